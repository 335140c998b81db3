//! Transactional persistence. No ORM: hand-written parameterized SQL
//! behind a `PgPool` — the pool is acquired once at startup
//! (`bin/server.rs`) and threaded through `AppState`, never a
//! module-level global.
//!
//! Schema assumptions (migrations are out of scope): a `uniq_stat` unique
//! constraint on `(node_id, date, network, station, location, channel,
//! country)` (see DESIGN.md for why `node_id` is included); `nodes`,
//! `networks`, `tokens`, `payloads` tables; `dataselect_stats.clients`
//! stored as `bytea` (the HLL wire bytes) rather than a `hll` Postgres
//! extension type, since no Rust binding for that extension exists in
//! this crate's dependency stack.

use crate::error::ApiError;
use crate::hll::Hll;
use crate::model::{Node, SubmissionEnvelope};
use crate::query::{QueryPlan, RestrictionInfo, StatRow};
use chrono::{NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

pub type Pool = PgPool;

pub async fn connect(db_uri: &str, max_connections: u32) -> Result<Pool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(db_uri)
        .await
}

/// Submission method: additive merge (POST) or full replace (PUT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Merge,
    Replace,
}

impl SubmitMode {
    pub fn from_http_method(method: &axum::http::Method) -> Option<Self> {
        if *method == axum::http::Method::POST {
            Some(SubmitMode::Merge)
        } else if *method == axum::http::Method::PUT {
            Some(SubmitMode::Replace)
        } else {
            None
        }
    }
}

/// Resolve a bearer token to its owning node id, honoring
/// `valid_from <= now < valid_until` (see DESIGN.md for the
/// exclusive-upper-bound choice).
pub async fn resolve_token(pool: &Pool, token: &str) -> Result<Option<i32>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT nodes.id FROM nodes JOIN tokens ON nodes.id = tokens.node_id \
         WHERE tokens.value = $1 AND $2 >= tokens.valid_from AND $2 < tokens.valid_until",
    )
    .bind(token)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get::<i32, _>("id")))
}

/// `murmur3_32(stringify(stats))`, the content hash used for duplicate
/// submission detection.
pub fn hash_stats(envelope: &SubmissionEnvelope) -> Result<i32, ApiError> {
    let stringified =
        serde_json::to_string(&envelope.stats).map_err(|_| ApiError::MalformedPayload)?;
    let h = murmur3::murmur3_32(&mut std::io::Cursor::new(stringified.as_bytes()), 0)
        .map_err(|_| ApiError::MalformedPayload)?;
    Ok(h as i32)
}

/// Insert a payload receipt; a unique-constraint violation on
/// `(node_id, hash)` is reported as [`ApiError::DuplicateSubmission`] by
/// `From<sqlx::Error>`.
async fn insert_payload_receipt(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    node_id: i32,
    hash: i32,
    envelope: &SubmissionEnvelope,
) -> Result<(), ApiError> {
    sqlx::query(
        "INSERT INTO payloads (node_id, hash, version, generated_at, coverage) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(node_id)
    .bind(hash)
    .bind(&envelope.version)
    .bind(envelope.generated_at)
    .bind(&envelope.days_coverage)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Auto-create the `(node_id, network)` row with `inversion = false` if it
/// doesn't already exist — an application-level equivalent of a DB-side
/// insert trigger, kept explicit in code rather than hidden in the schema.
async fn ensure_network(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    node_id: i32,
    network: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO networks (node_id, name, inverted_policy) VALUES ($1, $2, false) \
         ON CONFLICT (node_id, name) DO NOTHING",
    )
    .bind(node_id)
    .bind(network)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// One submitted stat, normalized: country codes of length != 2 become
/// null, missing `nb_unsuccessful_requests` defaults to 0, missing
/// `nb_requests` defaults to `nb_successful_requests + nb_unsuccessful_requests`.
struct NormalizedStat {
    network: String,
    station: String,
    location: String,
    channel: String,
    country: Option<String>,
    bytes: i64,
    nb_requests: i64,
    nb_successful_requests: i64,
    nb_unsuccessful_requests: i64,
    clients: Vec<u8>,
}

/// Schema column widths (`network VARCHAR(6)`, `station VARCHAR(5)`,
/// `location VARCHAR(2)`, `channel VARCHAR(3)`); checked here so an
/// oversized field fails fast with `MalformedPayload` instead of
/// surfacing as a DB error later.
fn check_field_width(field: &str, max_len: usize) -> Result<(), ApiError> {
    if field.chars().count() > max_len {
        return Err(ApiError::MalformedPayload);
    }
    Ok(())
}

fn normalize(stat: &crate::model::SubmissionStat) -> Result<NormalizedStat, ApiError> {
    check_field_width(&stat.network, 6)?;
    check_field_width(&stat.station, 5)?;
    check_field_width(&stat.location, 2)?;
    check_field_width(&stat.channel, 3)?;

    let country = stat
        .country
        .as_deref()
        .and_then(|c| crate::model::StatKey::normalize_country(c));
    let nb_unsuccessful = stat.nb_unsuccessful_requests.unwrap_or(0);
    let nb_requests = stat
        .nb_requests
        .unwrap_or(stat.nb_successful_requests + nb_unsuccessful);
    let clients =
        crate::hll::from_hex_wire(&stat.clients).map_err(|_| ApiError::MalformedPayload)?;
    Ok(NormalizedStat {
        network: stat.network.clone(),
        station: stat.station.clone(),
        location: stat.location.clone(),
        channel: stat.channel.clone(),
        country,
        bytes: stat.bytes,
        nb_requests,
        nb_successful_requests: stat.nb_successful_requests,
        nb_unsuccessful_requests: nb_unsuccessful,
        clients,
    })
}

async fn upsert_stat(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    node_id: i32,
    month: NaiveDate,
    stat: &NormalizedStat,
    mode: SubmitMode,
) -> Result<(), sqlx::Error> {
    let sql = match mode {
        SubmitMode::Merge => {
            "INSERT INTO dataselect_stats \
             (node_id, date, network, station, location, channel, country, \
              bytes, nb_reqs, nb_successful_reqs, nb_failed_reqs, clients, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now()) \
             ON CONFLICT ON CONSTRAINT uniq_stat DO UPDATE SET \
             bytes = dataselect_stats.bytes + EXCLUDED.bytes, \
             nb_reqs = dataselect_stats.nb_reqs + EXCLUDED.nb_reqs, \
             nb_successful_reqs = dataselect_stats.nb_successful_reqs + EXCLUDED.nb_successful_reqs, \
             nb_failed_reqs = dataselect_stats.nb_failed_reqs + EXCLUDED.nb_failed_reqs, \
             clients = $13, \
             updated_at = now()"
        }
        SubmitMode::Replace => {
            "INSERT INTO dataselect_stats \
             (node_id, date, network, station, location, channel, country, \
              bytes, nb_reqs, nb_successful_reqs, nb_failed_reqs, clients, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now()) \
             ON CONFLICT ON CONSTRAINT uniq_stat DO UPDATE SET \
             bytes = EXCLUDED.bytes, \
             nb_reqs = EXCLUDED.nb_reqs, \
             nb_successful_reqs = EXCLUDED.nb_successful_reqs, \
             nb_failed_reqs = EXCLUDED.nb_failed_reqs, \
             clients = $13, \
             created_at = now()"
        }
    };

    let nb_failed = stat.nb_unsuccessful_requests;

    // The merge path needs the union of the existing row's sketch with the
    // incoming one; Postgres has no portable "merge these bytes" operator
    // for plain bytea, so the union is computed application-side and always
    // bound as the literal $13 value (both branches reference it in their
    // `DO UPDATE SET clients = $13`, replace just passes the incoming bytes
    // straight through) rather than expressed as a SQL-side operator (see
    // query.rs's module doc for why this crate does HLL work in Rust rather
    // than via a Postgres extension).
    let merged_clients = match mode {
        SubmitMode::Merge => {
            // FOR UPDATE locks the row (if it already exists) for the rest of
            // this transaction, so a second concurrent submission to the same
            // key blocks here instead of reading the same pre-commit sketch
            // and silently losing one side of the union.
            let existing: Option<Vec<u8>> = sqlx::query_scalar(
                "SELECT clients FROM dataselect_stats WHERE node_id = $1 AND date = $2 AND \
                 network = $3 AND station = $4 AND location = $5 AND channel = $6 AND \
                 country IS NOT DISTINCT FROM $7 FOR UPDATE",
            )
            .bind(node_id)
            .bind(month)
            .bind(&stat.network)
            .bind(&stat.station)
            .bind(&stat.location)
            .bind(&stat.channel)
            .bind(&stat.country)
            .fetch_optional(&mut **tx)
            .await?;

            match existing {
                Some(bytes) => {
                    let mut sketch = Hll::from_bytes(&bytes).unwrap_or_else(|_| Hll::new());
                    let incoming = Hll::from_bytes(&stat.clients).unwrap_or_else(|_| Hll::new());
                    let _ = sketch.union(&incoming);
                    sketch.to_bytes()
                }
                None => stat.clients.clone(),
            }
        }
        SubmitMode::Replace => stat.clients.clone(),
    };

    sqlx::query(sql)
        .bind(node_id)
        .bind(month)
        .bind(&stat.network)
        .bind(&stat.station)
        .bind(&stat.location)
        .bind(&stat.channel)
        .bind(&stat.country)
        .bind(stat.bytes)
        .bind(stat.nb_requests as i32)
        .bind(stat.nb_successful_requests as i32)
        .bind(nb_failed as i32)
        .bind(&stat.clients)
        .bind(&merged_clients)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Run the full submission pipeline inside one transaction: the payload
/// receipt, per-stat upserts and network auto-creation either all become
/// visible together or not at all.
pub async fn submit_payload(
    pool: &Pool,
    node_id: i32,
    envelope: &SubmissionEnvelope,
    mode: SubmitMode,
) -> Result<(), ApiError> {
    let hash = hash_stats(envelope)?;
    let mut tx = pool.begin().await.map_err(ApiError::from)?;

    insert_payload_receipt(&mut tx, node_id, hash, envelope).await?;

    for stat in &envelope.stats {
        let normalized = normalize(stat)?;
        ensure_network(&mut tx, node_id, &normalized.network)
            .await
            .map_err(ApiError::from)?;
        upsert_stat(&mut tx, node_id, stat.month, &normalized, mode)
            .await
            .map_err(ApiError::from)?;
    }

    tx.commit().await.map_err(ApiError::from)?;
    Ok(())
}

/// Fetch rows matching a query plan's filters, unaggregated — grouping,
/// counter summation and HLL union happen in [`crate::query::shape`].
pub async fn fetch_stat_rows(pool: &Pool, plan: &QueryPlan) -> Result<Vec<StatRow>, ApiError> {
    let rendered = plan.render_sql();
    let mut query = sqlx::query_as::<_, StatRow>(&rendered.sql);
    for bind in &rendered.binds {
        query = match bind {
            crate::query::Bind::Date(d) => query.bind(d),
            crate::query::Bind::Text(t) => query.bind(t),
            crate::query::Bind::TextList(l) => query.bind(l),
        };
    }
    query.fetch_all(pool).await.map_err(ApiError::from)
}

/// `{nodes:[{name, restriction_policy}]}` for `/_nodes`.
pub async fn list_nodes(pool: &Pool) -> Result<Vec<(String, Option<bool>)>, ApiError> {
    let rows = sqlx::query("SELECT name, restriction_policy FROM nodes ORDER BY name")
        .fetch_all(pool)
        .await
        .map_err(ApiError::from)?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get("name"), r.get("restriction_policy")))
        .collect())
}

/// `{networks:[{name, node, restriction_policy}]}` for `/_networks`;
/// `restriction_policy` here is the already-XORed node-default/
/// network-inversion bit, `None` when either side is undefined.
pub async fn list_networks(pool: &Pool) -> Result<Vec<(String, String, Option<bool>)>, ApiError> {
    let rows = sqlx::query(
        "SELECT networks.name, nodes.name AS node_name, nodes.restriction_policy, \
         networks.inverted_policy \
         FROM networks JOIN nodes ON nodes.id = networks.node_id ORDER BY nodes.name, networks.name",
    )
    .fetch_all(pool)
    .await
    .map_err(ApiError::from)?;
    Ok(rows
        .into_iter()
        .map(|r| {
            let default: Option<bool> = r.get("restriction_policy");
            let inversion: Option<bool> = r.get("inverted_policy");
            let restriction_policy = match (default, inversion) {
                (Some(d), Some(i)) => Some(d ^ i),
                _ => None,
            };
            (r.get("name"), r.get("node_name"), restriction_policy)
        })
        .collect())
}

/// Look up the node row by display name, used by `/node_restriction_policy`
/// and bearer-token-adjacent lookups.
pub async fn find_node(pool: &Pool, name: &str) -> Result<Option<Node>, ApiError> {
    sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(ApiError::from)
}

/// `(node.default_policy, network.inversion, network.eas_group)` for one
/// `(node, network)` pair — the raw ingredients `restriction::resolve`
/// turns into a verdict, used by `/_isRestricted` and
/// `/network_restriction_policy`.
pub async fn find_network_restriction(
    pool: &Pool,
    node: &str,
    network: &str,
) -> Result<Option<(Option<bool>, Option<bool>, Option<String>)>, ApiError> {
    let row = sqlx::query(
        "SELECT nodes.restriction_policy AS node_default, networks.inverted_policy AS inversion, \
         networks.eas_group AS eas_group \
         FROM networks JOIN nodes ON nodes.id = networks.node_id \
         WHERE nodes.name = $1 AND networks.name = $2",
    )
    .bind(node)
    .bind(network)
    .fetch_optional(pool)
    .await
    .map_err(ApiError::from)?;
    Ok(row.map(|r| (r.get("node_default"), r.get("inversion"), r.get("eas_group"))))
}

/// Batch-load restriction info for every distinct `(node, network)` pair a
/// query's rows touch, so [`crate::query::shape`] can gate/collapse without
/// one lookup per row.
pub async fn load_restriction_lookup(
    pool: &Pool,
) -> Result<HashMap<(String, String), RestrictionInfo>, ApiError> {
    let rows = sqlx::query(
        "SELECT nodes.name AS node_name, networks.name AS network_name, \
         nodes.restriction_policy AS node_default, networks.inverted_policy AS inversion, \
         networks.eas_group AS eas_group \
         FROM networks JOIN nodes ON nodes.id = networks.node_id",
    )
    .fetch_all(pool)
    .await
    .map_err(ApiError::from)?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let node_name: String = r.get("node_name");
            let network_name: String = r.get("network_name");
            let node_default: Option<bool> = r.get("node_default");
            let inversion: Option<bool> = r.get("inversion");
            let eas_group: Option<String> = r.get("eas_group");
            (
                (node_name, network_name),
                RestrictionInfo {
                    restricted: crate::restriction::resolve(node_default, inversion),
                    eas_group,
                },
            )
        })
        .collect())
}

/// Every node's `eas_group`, used to decide whether a caller is an
/// operator for *any* node.
pub async fn node_eas_groups(pool: &Pool) -> Result<Vec<Option<String>>, ApiError> {
    let rows = sqlx::query("SELECT eas_group FROM nodes")
        .fetch_all(pool)
        .await
        .map_err(ApiError::from)?;
    Ok(rows.into_iter().map(|r| r.get("eas_group")).collect())
}

/// The `/_health` probe: DB reachability plus the caller's actual Postgres
/// privileges on the tables this service touches.
pub async fn check_health(pool: &Pool) -> Result<(), ApiError> {
    let current_user: String = sqlx::query_scalar("SELECT current_user")
        .fetch_one(pool)
        .await
        .map_err(ApiError::from)?;

    let rows = sqlx::query(
        "SELECT table_name, privilege_type FROM information_schema.role_table_grants \
         WHERE grantee = $1",
    )
    .bind(&current_user)
    .fetch_all(pool)
    .await
    .map_err(ApiError::from)?;

    let mut select_tables = std::collections::HashSet::new();
    let mut insert_tables = std::collections::HashSet::new();
    let mut update_tables = std::collections::HashSet::new();
    for row in &rows {
        let table: String = row.get("table_name");
        let privilege: String = row.get("privilege_type");
        match privilege.as_str() {
            "SELECT" => {
                select_tables.insert(table);
            }
            "INSERT" => {
                insert_tables.insert(table);
            }
            "UPDATE" => {
                update_tables.insert(table);
            }
            _ => {}
        }
    }

    let required_select = ["dataselect_stats", "nodes", "networks", "payloads", "tokens"];
    let required_insert = ["dataselect_stats", "payloads"];
    let required_update = ["dataselect_stats"];

    let missing = required_select.iter().any(|t| !select_tables.contains(*t))
        || required_insert.iter().any(|t| !insert_tables.contains(*t))
        || required_update.iter().any(|t| !update_tables.contains(*t));

    if missing {
        return Err(ApiError::IntegrityViolation);
    }
    Ok(())
}

/// The token-authenticator's own lookup, separate from the signed-token
/// verifier in `auth.rs` — resolves a bearer token's validity window
/// without yet deciding authorization.
pub async fn token_is_live(pool: &Pool, token: &str) -> Result<bool, ApiError> {
    Ok(resolve_token(pool, token).await.map_err(ApiError::from)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubmissionStat;

    fn stat(country: Option<&str>, nb_requests: Option<i64>, nb_unsuccessful: Option<i64>) -> SubmissionStat {
        SubmissionStat {
            month: NaiveDate::from_ymd_opt(2021, 5, 1).unwrap(),
            network: "GE".to_string(),
            station: "EIL".to_string(),
            location: String::new(),
            channel: "BHZ".to_string(),
            country: country.map(|c| c.to_string()),
            bytes: 1000,
            nb_requests,
            nb_successful_requests: 3,
            nb_unsuccessful_requests: nb_unsuccessful,
            clients: crate::hll::to_hex_wire(&Hll::new().to_bytes()),
        }
    }

    #[test]
    fn normalize_coerces_non_two_letter_country_to_none() {
        let n = normalize(&stat(Some("USA"), Some(3), Some(0))).unwrap();
        assert_eq!(n.country, None);
        let n = normalize(&stat(Some("US"), Some(3), Some(0))).unwrap();
        assert_eq!(n.country, Some("US".to_string()));
    }

    #[test]
    fn normalize_defaults_missing_nb_unsuccessful_to_zero() {
        let n = normalize(&stat(Some("US"), Some(3), None)).unwrap();
        assert_eq!(n.nb_unsuccessful_requests, 0);
    }

    #[test]
    fn normalize_defaults_missing_nb_requests_to_successful_plus_unsuccessful() {
        let n = normalize(&stat(Some("US"), None, Some(2))).unwrap();
        assert_eq!(n.nb_requests, 5);
    }

    #[test]
    fn normalize_rejects_oversized_network_code() {
        let mut s = stat(Some("US"), Some(3), Some(0));
        s.network = "TOOLONGNETWORKCODE".to_string();
        assert!(matches!(normalize(&s), Err(ApiError::MalformedPayload)));
    }

    #[test]
    fn normalize_accepts_field_widths_at_the_limit() {
        let mut s = stat(Some("US"), Some(3), Some(0));
        s.network = "ABCDEF".to_string();
        s.station = "ABCDE".to_string();
        s.location = "AB".to_string();
        s.channel = "ABC".to_string();
        assert!(normalize(&s).is_ok());
    }

    #[test]
    fn hash_stats_is_deterministic_and_order_sensitive() {
        let envelope_a = SubmissionEnvelope {
            version: "1.0.0".to_string(),
            generated_at: chrono::Utc::now(),
            days_coverage: vec![],
            stats: vec![stat(Some("US"), Some(3), Some(0))],
        };
        let mut envelope_b = envelope_a.clone();
        assert_eq!(hash_stats(&envelope_a).unwrap(), hash_stats(&envelope_b).unwrap());

        envelope_b.stats[0].bytes += 1;
        assert_ne!(hash_stats(&envelope_a).unwrap(), hash_stats(&envelope_b).unwrap());
    }

    /// Exercises the full submission pipeline, including atomicity and
    /// duplicate-submission detection, against a real schema. Skipped when
    /// no test database is reachable rather than mocked — this crate has no
    /// in-memory Postgres substitute.
    #[tokio::test]
    async fn submit_payload_rejects_duplicate_and_merges_on_post() {
        let Ok(db_uri) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("skipping: TEST_DATABASE_URL not set");
            return;
        };
        let pool = connect(&db_uri, 5).await.expect("connect to test database");

        let node_id: i32 = sqlx::query_scalar(
            "INSERT INTO nodes (name) VALUES ($1) RETURNING id",
        )
        .bind(format!("TESTNODE-{}", uuid_like_suffix()))
        .fetch_one(&pool)
        .await
        .expect("insert test node");

        let envelope = SubmissionEnvelope {
            version: "1.0.0".to_string(),
            generated_at: chrono::Utc::now(),
            days_coverage: vec![NaiveDate::from_ymd_opt(2021, 5, 1).unwrap()],
            stats: vec![stat(Some("US"), Some(3), Some(0))],
        };

        submit_payload(&pool, node_id, &envelope, SubmitMode::Merge)
            .await
            .expect("first submission succeeds");

        let err = submit_payload(&pool, node_id, &envelope, SubmitMode::Merge)
            .await
            .expect_err("duplicate submission is rejected");
        assert!(matches!(err, ApiError::DuplicateSubmission));
    }

    fn uuid_like_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }
}
