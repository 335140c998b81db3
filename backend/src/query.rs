//! Query planner and executor: column selection driven by `level`/
//! `details`, and the restricted-network "Other" bucket.
//!
//! The plan tree (`QueryPlan`) is a plain struct built from validated
//! parameters; `render_sql` turns it into a parameterized `WHERE`-only
//! query string plus a bind list, so its shape is unit-testable without a
//! database. There is no Postgres HLL extension available to this crate, so
//! `hll_union_agg` is emulated: the store fetches matching rows unaggregated
//! and `shape` performs the grouping, counter summation and HLL union
//! entirely in Rust, which also gives the restricted-network collapsing
//! ("Other" bucket) a single, testable code path instead of a second SQL
//! branch.

use crate::hll::Hll;
use crate::model::Restricted;
use crate::validator::ValidatedParams;
use chrono::{Datelike, NaiveDate};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Node,
    Network,
    Station,
    Location,
    Channel,
}

impl Level {
    pub fn parse(raw: &str) -> Option<Level> {
        match raw {
            "node" => Some(Level::Node),
            "network" => Some(Level::Network),
            "station" => Some(Level::Station),
            "location" => Some(Level::Location),
            "channel" => Some(Level::Channel),
            _ => None,
        }
    }

    fn includes_network(&self) -> bool {
        *self >= Level::Network
    }

    fn includes_station(&self) -> bool {
        *self >= Level::Station
    }

    fn includes_location(&self) -> bool {
        *self >= Level::Location
    }

    fn includes_channel(&self) -> bool {
        *self >= Level::Channel
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetailSet {
    pub month: bool,
    pub year: bool,
    pub country: bool,
}

impl DetailSet {
    pub fn from_values(values: &[String]) -> Self {
        Self {
            month: values.iter().any(|v| v == "month"),
            year: values.iter().any(|v| v == "year"),
            country: values.iter().any(|v| v == "country"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
    pub nodes: Vec<String>,
    pub networks: Vec<String>,
    pub stations: Vec<String>,
    pub locations: Vec<String>,
    pub channels: Vec<String>,
    pub countries: Vec<String>,
    pub level: Option<Level>,
    pub details: DetailSet,
    pub raw: bool,
}

impl QueryPlan {
    pub fn from_params(params: &ValidatedParams, raw: bool) -> Option<Self> {
        let start = params.start?;
        Some(Self {
            start,
            end: params.end,
            nodes: params.node.clone(),
            networks: params.network.clone(),
            stations: params.station.clone(),
            locations: params.location.clone(),
            channels: params.channel.clone(),
            countries: params.country.clone(),
            level: params.level.as_deref().and_then(Level::parse),
            details: DetailSet::from_values(&params.details),
            raw,
        })
    }

    pub fn touches_network_dimension(&self) -> bool {
        self.raw || self.level.map(|l| l.includes_network()).unwrap_or(false)
    }
}

/// One stored statistic row joined with its owning node's name, as fetched
/// by the store ahead of any grouping.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatRow {
    pub node: String,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub date: NaiveDate,
    pub country: Option<String>,
    pub bytes: i64,
    pub nb_reqs: i64,
    pub nb_successful_reqs: i64,
    pub clients: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Bind {
    Date(NaiveDate),
    Text(String),
    TextList(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct RenderedQuery {
    pub sql: String,
    pub binds: Vec<Bind>,
}

fn push_bind(binds: &mut Vec<Bind>, bind: Bind) -> usize {
    binds.push(bind);
    binds.len()
}

fn push_wildcard_group(sql: &mut String, binds: &mut Vec<Bind>, column: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    sql.push_str(" AND (");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            sql.push_str(" OR ");
        }
        let idx = push_bind(binds, Bind::Text(value.clone()));
        if value.contains('%') || value.contains('_') {
            sql.push_str(&format!("{column} LIKE ${idx}"));
        } else {
            sql.push_str(&format!("{column} = ${idx}"));
        }
    }
    sql.push(')');
}

impl QueryPlan {
    /// Render the filtering half of the query. No `GROUP BY`/aggregate is
    /// emitted; projection and summation happen in [`shape`] after the rows
    /// come back, so this stays a pure function of the plan.
    pub fn render_sql(&self) -> RenderedQuery {
        let mut sql = String::from(
            "SELECT nodes.name AS node, dataselect_stats.network, dataselect_stats.station, \
             dataselect_stats.location, dataselect_stats.channel, dataselect_stats.date, \
             dataselect_stats.country, dataselect_stats.bytes, dataselect_stats.nb_reqs, \
             dataselect_stats.nb_successful_reqs, dataselect_stats.clients \
             FROM dataselect_stats JOIN nodes ON nodes.id = dataselect_stats.node_id WHERE 1=1",
        );
        let mut binds = Vec::new();

        let idx = push_bind(&mut binds, Bind::Date(self.start));
        sql.push_str(&format!(" AND dataselect_stats.date >= ${idx}"));

        if let Some(end) = self.end {
            let idx = push_bind(&mut binds, Bind::Date(end));
            sql.push_str(&format!(" AND dataselect_stats.date <= ${idx}"));
        }

        if !self.nodes.is_empty() {
            let idx = push_bind(&mut binds, Bind::TextList(self.nodes.clone()));
            sql.push_str(&format!(" AND nodes.name = ANY(${idx})"));
        }

        push_wildcard_group(&mut sql, &mut binds, "dataselect_stats.network", &self.networks);
        push_wildcard_group(&mut sql, &mut binds, "dataselect_stats.station", &self.stations);
        push_wildcard_group(&mut sql, &mut binds, "dataselect_stats.location", &self.locations);
        push_wildcard_group(&mut sql, &mut binds, "dataselect_stats.channel", &self.channels);

        if !self.countries.is_empty() {
            let idx = push_bind(&mut binds, Bind::TextList(self.countries.clone()));
            sql.push_str(&format!(" AND dataselect_stats.country = ANY(${idx})"));
        }

        RenderedQuery { sql, binds }
    }
}

#[derive(Debug, Clone)]
pub struct RestrictionInfo {
    pub restricted: Restricted,
    pub eas_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProjectionKey {
    date: String,
    node: String,
    network: String,
    station: String,
    location: String,
    channel: String,
    country: String,
}

fn date_label(plan: &QueryPlan, row: &StatRow) -> String {
    if plan.raw || plan.details.month {
        row.date.format("%Y-%m").to_string()
    } else if plan.details.year {
        row.date.year().to_string()
    } else {
        "*".to_string()
    }
}

fn country_label(plan: &QueryPlan, row: &StatRow) -> String {
    if plan.raw || plan.details.country {
        row.country.clone().unwrap_or_default()
    } else {
        "*".to_string()
    }
}

struct Bucket {
    key: ProjectionKey,
    bytes: i64,
    nb_reqs: i64,
    nb_successful_reqs: i64,
    clients: Hll,
}

#[derive(Debug, Clone)]
pub struct ShapedRow {
    pub date: String,
    pub node: String,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub country: String,
    pub bytes: i64,
    pub nb_reqs: i64,
    pub nb_successful_reqs: i64,
    pub clients: u64,
    pub hll_clients: Option<String>,
}

/// Group fetched rows by the plan's projection, collapsing any network the
/// caller cannot see into a synthetic `node="Other", network="Other"`
/// bucket keyed by `(date, country)`.
///
/// `caller_groups = None` means the public-endpoint rule: every restricted
/// network collapses regardless of caller. `caller_groups = Some(groups)`
/// means the restricted-endpoint rule: a network collapses only when the
/// caller's groups don't include its authorizing `eas_group`.
pub fn shape(
    rows: Vec<StatRow>,
    plan: &QueryPlan,
    restriction_lookup: &HashMap<(String, String), RestrictionInfo>,
    caller_groups: Option<&HashSet<String>>,
    hllvalues: bool,
) -> Vec<ShapedRow> {
    let mut buckets: HashMap<ProjectionKey, Bucket> = HashMap::new();

    for row in rows {
        let mut collapse = false;
        if plan.touches_network_dimension() {
            if let Some(info) = restriction_lookup.get(&(row.node.clone(), row.network.clone())) {
                if info.restricted == Restricted::Yes {
                    collapse = match caller_groups {
                        None => true,
                        Some(groups) => !info
                            .eas_group
                            .as_ref()
                            .map(|g| groups.contains(g))
                            .unwrap_or(false),
                    };
                }
            }
        }

        let key = if collapse {
            ProjectionKey {
                date: date_label(plan, &row),
                node: "Other".to_string(),
                network: "Other".to_string(),
                station: "*".to_string(),
                location: "*".to_string(),
                channel: "*".to_string(),
                country: country_label(plan, &row),
            }
        } else {
            ProjectionKey {
                date: date_label(plan, &row),
                node: if plan.raw || plan.level.is_some() {
                    row.node.clone()
                } else {
                    "*".to_string()
                },
                network: if plan.raw
                    || plan.level.map(|l| l.includes_network()).unwrap_or(false)
                {
                    row.network.clone()
                } else {
                    "*".to_string()
                },
                station: if plan.raw
                    || plan.level.map(|l| l.includes_station()).unwrap_or(false)
                {
                    row.station.clone()
                } else {
                    "*".to_string()
                },
                location: if plan.raw
                    || plan.level.map(|l| l.includes_location()).unwrap_or(false)
                {
                    row.location.clone()
                } else {
                    "*".to_string()
                },
                channel: if plan.raw
                    || plan.level.map(|l| l.includes_channel()).unwrap_or(false)
                {
                    row.channel.clone()
                } else {
                    "*".to_string()
                },
                country: country_label(plan, &row),
            }
        };

        let row_clients = Hll::from_bytes(&row.clients).unwrap_or_else(|_| Hll::new());

        match buckets.get_mut(&key) {
            Some(bucket) => {
                bucket.bytes += row.bytes;
                bucket.nb_reqs += row.nb_reqs;
                bucket.nb_successful_reqs += row.nb_successful_reqs;
                let _ = bucket.clients.union(&row_clients);
            }
            None => {
                buckets.insert(
                    key.clone(),
                    Bucket {
                        key,
                        bytes: row.bytes,
                        nb_reqs: row.nb_reqs,
                        nb_successful_reqs: row.nb_successful_reqs,
                        clients: row_clients,
                    },
                );
            }
        }
    }

    let mut shaped: Vec<ShapedRow> = buckets
        .into_values()
        .map(|bucket| ShapedRow {
            hll_clients: hllvalues.then(|| crate::hll::to_hex_wire(&bucket.clients.to_bytes())),
            clients: bucket.clients.cardinality(),
            date: bucket.key.date,
            node: bucket.key.node,
            network: bucket.key.network,
            station: bucket.key.station,
            location: bucket.key.location,
            channel: bucket.key.channel,
            country: bucket.key.country,
            bytes: bucket.bytes,
            nb_reqs: bucket.nb_reqs,
            nb_successful_reqs: bucket.nb_successful_reqs,
        })
        .collect();

    if plan.raw || plan.details.month || plan.details.year {
        shaped.sort_by(|a, b| a.date.cmp(&b.date));
    }

    shaped
}

pub fn to_json(rows: &[ShapedRow], request_parameters: &str) -> serde_json::Value {
    serde_json::json!({
        "version": "1.0.0",
        "request_parameters": request_parameters,
        "results": rows.iter().map(|r| {
            let mut obj = serde_json::json!({
                "date": r.date,
                "node": r.node,
                "network": r.network,
                "station": r.station,
                "location": r.location,
                "channel": r.channel,
                "country": r.country,
                "bytes": r.bytes,
                "nb_reqs": r.nb_reqs,
                "nb_successful_reqs": r.nb_successful_reqs,
                "clients": r.clients,
            });
            if let Some(hex) = &r.hll_clients {
                obj["hll_clients"] = serde_json::Value::String(hex.clone());
            }
            obj
        }).collect::<Vec<_>>(),
    })
}

pub fn to_csv(rows: &[ShapedRow], request_parameters: &str) -> String {
    let mut csv = format!(
        "# version: 1.0.0\n# request_parameters: {request_parameters}\ndate,node,network,station,location,channel,country,bytes,nb_reqs,nb_successful_reqs,clients"
    );
    for r in rows {
        csv.push('\n');
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            r.date,
            r.node,
            r.network,
            r.station,
            r.location,
            r.channel,
            r.country,
            r.bytes,
            r.nb_reqs,
            r.nb_successful_reqs,
            r.clients
        ));
    }
    csv
}
