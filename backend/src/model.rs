//! Dimensional data model: nodes, networks, tokens, payload receipts and the
//! monthly rolled-up `DataselectStat`. Plain value types plus foreign-key
//! identifiers; no owning back-references between child and parent rows.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A participating EIDA data center.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Node {
    pub id: i32,
    pub name: String,
    pub contact: Option<String>,
    pub restriction_policy: Option<bool>,
    pub eas_group: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A seismic network bound to exactly one node. Primary key `(node_id, name)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Network {
    pub node_id: i32,
    pub name: String,
    pub inverted_policy: Option<bool>,
    pub eas_group: Option<String>,
}

/// Opaque per-node bearer secret.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Token {
    pub value: String,
    pub node_id: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// One row per accepted submission, used for duplicate-submission detection.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PayloadReceipt {
    pub node_id: i32,
    pub hash: i32,
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub coverage: Vec<NaiveDate>,
}

/// The composite key identifying one monthly rolled-up bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatKey {
    pub date: NaiveDate,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub country: Option<String>,
}

impl StatKey {
    /// Coerce any non-2-letter country code to `None`.
    pub fn normalize_country(country: &str) -> Option<String> {
        if country.chars().count() == 2 {
            Some(country.to_string())
        } else {
            None
        }
    }
}

/// One monthly rolled-up bucket: `(node_id, date, network, station,
/// location, channel, country)` is the primary key.
#[derive(Debug, Clone)]
pub struct DataselectStat {
    pub node_id: i32,
    pub date: NaiveDate,
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub country: Option<String>,
    pub bytes: i64,
    pub nb_reqs: i32,
    pub nb_successful_reqs: i32,
    pub nb_failed_reqs: i32,
    /// Opaque HLL sketch bytes (process-wide fixed p/width).
    pub clients: Vec<u8>,
}

impl DataselectStat {
    pub fn key(&self) -> StatKey {
        StatKey {
            date: self.date,
            network: self.network.clone(),
            station: self.station.clone(),
            location: self.location.clone(),
            channel: self.channel.clone(),
            country: self.country.clone(),
        }
    }
}

/// The submission envelope body accepted by `POST|PUT /submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionEnvelope {
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub days_coverage: Vec<NaiveDate>,
    pub stats: Vec<SubmissionStat>,
}

/// One statistic entry inside a submission envelope, as submitted over the
/// wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionStat {
    pub month: NaiveDate,
    pub network: String,
    #[serde(default)]
    pub station: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub bytes: i64,
    #[serde(default)]
    pub nb_requests: Option<i64>,
    #[serde(default)]
    pub nb_successful_requests: i64,
    #[serde(default)]
    pub nb_unsuccessful_requests: Option<i64>,
    /// `\x`-prefixed hex-encoded HLL sketch bytes.
    pub clients: String,
}

/// Tri-state restriction verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Restricted {
    No,
    Yes,
    Undefined,
}

impl Restricted {
    pub fn as_str(&self) -> &'static str {
        match self {
            Restricted::No => "no",
            Restricted::Yes => "yes",
            Restricted::Undefined => "not yet defined",
        }
    }
}
