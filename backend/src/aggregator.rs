//! Log-line aggregation: turns fdsnws-dataselect request log lines into
//! monthly-bucketed statistics with per-bucket HLL client sketches. An
//! in-memory accumulator merges incrementally rather than building two
//! whole maps and merging them at the end.

use crate::hll::Hll;
use crate::model::{StatKey, SubmissionStat};
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::BufRead;

#[derive(Debug, Deserialize)]
struct RawLogRecord {
    finished: String,
    status: String,
    #[serde(rename = "userLocation")]
    user_location: Option<UserLocation>,
    #[serde(rename = "userID")]
    user_id: Value,
    // Kept as loose JSON values rather than `Vec<RawTrace>`: serde fails the
    // whole array if any single element doesn't deserialize, which would
    // drop every other (valid) trace sharing the line. Elements are
    // converted one at a time in `process_line` so one bad trace only
    // costs itself.
    #[serde(default)]
    trace: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct UserLocation {
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTrace {
    net: String,
    sta: String,
    #[serde(default = "default_location")]
    loc: String,
    cha: String,
    bytes: i64,
}

fn default_location() -> String {
    "--".to_string()
}

/// Aggregation key distinct from [`StatKey`]: country is carried as the raw
/// string observed in the log, not yet coerced to the 2-letter-or-unknown
/// invariant that applies to stored/queried statistics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AggKey {
    date: NaiveDate,
    network: String,
    station: String,
    location: String,
    channel: String,
    country: String,
}

#[derive(Debug, Clone)]
pub struct AggregatedStat {
    pub bytes: i64,
    pub nb_requests: i64,
    pub nb_successful_requests: i64,
    pub nb_unsuccessful_requests: i64,
    pub unique_clients: Hll,
}

impl AggregatedStat {
    fn empty() -> Self {
        Self {
            bytes: 0,
            nb_requests: 0,
            nb_successful_requests: 0,
            nb_unsuccessful_requests: 0,
            unique_clients: Hll::new(),
        }
    }

    fn merge_from(&mut self, other: &AggregatedStat) {
        self.bytes += other.bytes;
        self.nb_requests += other.nb_requests;
        self.nb_successful_requests += other.nb_successful_requests;
        self.nb_unsuccessful_requests += other.nb_unsuccessful_requests;
        // Same fixed p/width everywhere; a union failure here would mean a
        // programming error, not bad input.
        self.unique_clients
            .union(&other.unique_clients)
            .expect("HLL parameters are process-wide constants");
    }
}

/// Shift a calendar date to the first day of its month.
pub fn shift_to_begin_of_month(d: NaiveDate) -> NaiveDate {
    d.with_day(1).expect("day 1 is always valid")
}

fn parse_finished(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim_end_matches('Z');
    let with_z = format!("{trimmed}Z");
    chrono::DateTime::parse_from_rfc3339(&with_z)
        .ok()
        .map(|dt| dt.date_naive())
}

fn userid_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// `Hll::add` needs genuine 64 bits of entropy (it shifts off the low `p`
/// bits and counts leading zeros across the remaining 64-p). `murmur3_32`
/// only has 32 bits to give, so zero-extending it to `u64` would leave the
/// top half always zero and saturate every register after a handful of
/// inserts. Use the wider `murmur3_x64_128` variant and XOR-fold its output
/// down to 64 bits instead.
fn hash_client_id(id: &str) -> u64 {
    let h = murmur3::murmur3_x64_128(&mut std::io::Cursor::new(id.as_bytes()), 0)
        .expect("hashing an in-memory buffer never fails");
    ((h >> 64) as u64) ^ (h as u64)
}

/// Accumulates per-(date, network, station, location, channel, country)
/// statistics across any number of parsed log lines or merged accumulators.
#[derive(Debug, Default)]
pub struct Accumulator {
    stats: HashMap<AggKey, AggregatedStat>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    fn record(&mut self, key: AggKey, bytes: i64, successful: bool, client_hash: u64) {
        let entry = self.stats.entry(key).or_insert_with(AggregatedStat::empty);
        entry.nb_requests += 1;
        if successful {
            entry.nb_successful_requests += 1;
            entry.bytes += bytes;
        } else {
            entry.nb_unsuccessful_requests += 1;
        }
        entry.unique_clients.add(client_hash);
    }

    fn record_success(&mut self, month: NaiveDate, trace: &RawTrace, country: String, client_hash: u64) {
        let key = AggKey {
            date: month,
            network: trace.net.clone(),
            station: trace.sta.clone(),
            location: trace.loc.clone(),
            channel: trace.cha.clone(),
            country,
        };
        self.record(key, trace.bytes, true, client_hash);
    }

    fn record_failure(&mut self, month: NaiveDate, country: String, client_hash: u64) {
        let key = AggKey {
            date: month,
            network: String::new(),
            station: String::new(),
            location: "--".to_string(),
            channel: String::new(),
            country,
        };
        self.record(key, 0, false, client_hash);
    }

    /// Absorb another accumulator's buckets into this one, summing counters
    /// and unioning HLL sketches for keys present in both.
    pub fn merge_from(&mut self, other: Accumulator) {
        for (key, stat) in other.stats {
            match self.stats.get_mut(&key) {
                Some(existing) => existing.merge_from(&stat),
                None => {
                    self.stats.insert(key, stat);
                }
            }
        }
    }

    /// Parse one JSON log line, updating the accumulator in place. Malformed
    /// lines and entries missing required fields are logged and skipped
    /// rather than aborting the whole run.
    pub fn process_line(&mut self, line: &str, line_no: usize) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let record: RawLogRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(line_no, error = %err, "unparseable log line, skipping");
                return;
            }
        };
        let month = match parse_finished(&record.finished) {
            Some(d) => shift_to_begin_of_month(d),
            None => {
                tracing::warn!(line_no, finished = %record.finished, "unparseable timestamp, skipping line");
                return;
            }
        };
        let country = record.user_location.and_then(|u| u.country);
        let client_hash = hash_client_id(&userid_to_string(&record.user_id));

        if record.status == "OK" {
            for (trace_no, raw_trace) in record.trace.iter().enumerate() {
                let trace: RawTrace = match serde_json::from_value(raw_trace.clone()) {
                    Ok(t) => t,
                    Err(err) => {
                        tracing::warn!(line_no, trace_no, error = %err, "malformed trace entry, skipping");
                        continue;
                    }
                };
                let Some(country) = country.clone() else {
                    tracing::warn!(line_no, "missing userLocation.country for successful trace, skipping");
                    continue;
                };
                self.record_success(month, &trace, country, client_hash);
            }
        } else {
            let Some(country) = country else {
                tracing::warn!(line_no, "missing userLocation.country for failed request, skipping");
                return;
            };
            self.record_failure(month, country, client_hash);
        }
    }

    /// Parse every line from a reader, returning the number of lines seen.
    pub fn process_reader<R: BufRead>(&mut self, reader: R) -> usize {
        let mut n = 0;
        for (i, line) in reader.lines().enumerate() {
            match line {
                Ok(text) => {
                    self.process_line(&text, i + 1);
                    n += 1;
                }
                Err(err) => {
                    tracing::warn!(line_no = i + 1, error = %err, "could not read line, skipping");
                }
            }
        }
        n
    }

    /// Flatten the accumulator into submission-ready entries, coercing
    /// countries to the 2-letter-or-unknown invariant and hex-encoding HLL
    /// sketches for the wire.
    pub fn into_submission_stats(self) -> Vec<SubmissionStat> {
        self.stats
            .into_iter()
            .map(|(key, stat)| SubmissionStat {
                month: key.date,
                network: key.network,
                station: key.station,
                location: key.location,
                channel: key.channel,
                country: StatKey::normalize_country(&key.country),
                bytes: stat.bytes,
                nb_requests: Some(stat.nb_requests),
                nb_successful_requests: stat.nb_successful_requests,
                nb_unsuccessful_requests: Some(stat.nb_unsuccessful_requests),
                clients: crate::hll::to_hex_wire(&stat.unique_clients.to_bytes()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_LINE: &str = r#"{"clientID": "ObsPy/1.2.2", "finished": "2020-09-18T00:00:01.142527Z", "userLocation": {"country": "ID"}, "created": "2020-09-18T00:00:00.606932Z", "bytes": 19968, "service": "fdsnws-dataselect", "userEmail": null, "trace": [{"cha": "BHN", "sta": "PB11", "start": "2010-09-04T11:59:52.076986Z", "net": "CX", "restricted": false, "loc": "", "bytes": 6656, "status": "OK", "end": "2010-09-04T12:03:32.076986Z"}], "status": "OK", "userID": 589198147}"#;

    const FAIL_LINE: &str = r#"{"clientID": "curl/7.0", "finished": "2020-09-18T00:00:01.142527Z", "userLocation": {"country": "FR"}, "bytes": 0, "service": "fdsnws-dataselect", "status": "DENIED", "userID": 42}"#;

    #[test]
    fn shifts_to_first_of_month() {
        let d = NaiveDate::from_ymd_opt(2020, 9, 18).unwrap();
        assert_eq!(shift_to_begin_of_month(d), NaiveDate::from_ymd_opt(2020, 9, 1).unwrap());
    }

    #[test]
    fn records_successful_trace() {
        let mut acc = Accumulator::new();
        acc.process_line(OK_LINE, 1);
        assert_eq!(acc.len(), 1);
        let stats = acc.into_submission_stats();
        assert_eq!(stats[0].network, "CX");
        assert_eq!(stats[0].station, "PB11");
        assert_eq!(stats[0].bytes, 6656);
        assert_eq!(stats[0].nb_successful_requests, 1);
        assert_eq!(stats[0].nb_unsuccessful_requests, Some(0));
        assert_eq!(stats[0].country, Some("ID".to_string()));
    }

    #[test]
    fn records_failed_request_under_sentinel_key() {
        let mut acc = Accumulator::new();
        acc.process_line(FAIL_LINE, 1);
        let stats = acc.into_submission_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].network, "");
        assert_eq!(stats[0].location, "--");
        assert_eq!(stats[0].nb_successful_requests, 0);
        assert_eq!(stats[0].nb_unsuccessful_requests, Some(1));
        assert_eq!(stats[0].country, Some("FR".to_string()));
    }

    #[test]
    fn skips_unparseable_line_without_panicking() {
        let mut acc = Accumulator::new();
        acc.process_line("not json at all", 1);
        assert!(acc.is_empty());
    }

    #[test]
    fn skips_success_trace_missing_country() {
        let line = r#"{"finished": "2020-09-18T00:00:01Z", "service": "fdsnws-dataselect", "trace": [{"cha": "BHN", "sta": "PB11", "loc": "", "net": "CX", "bytes": 100, "status": "OK"}], "status": "OK", "userID": 1}"#;
        let mut acc = Accumulator::new();
        acc.process_line(line, 1);
        assert!(acc.is_empty());
    }

    #[test]
    fn one_malformed_trace_does_not_drop_its_siblings() {
        let line = r#"{"finished": "2020-09-18T00:00:01Z", "userLocation": {"country": "ID"}, "status": "OK", "userID": 1, "trace": [{"cha": "BHN", "sta": "PB11", "net": "CX", "bytes": 100, "status": "OK"}, {"sta": "PB12", "bytes": 50}, {"cha": "BHZ", "sta": "PB13", "net": "CX", "bytes": 200, "status": "OK"}]}"#;
        let mut acc = Accumulator::new();
        acc.process_line(line, 1);
        assert_eq!(acc.len(), 2);
        let mut stations: Vec<_> = acc.into_submission_stats().into_iter().map(|s| s.station).collect();
        stations.sort();
        assert_eq!(stations, vec!["PB11".to_string(), "PB13".to_string()]);
    }

    #[test]
    fn trace_missing_location_defaults_to_sentinel() {
        let line = r#"{"finished": "2020-09-18T00:00:01Z", "userLocation": {"country": "ID"}, "status": "OK", "userID": 1, "trace": [{"cha": "BHN", "sta": "PB11", "net": "CX", "bytes": 100, "status": "OK"}]}"#;
        let mut acc = Accumulator::new();
        acc.process_line(line, 1);
        let stats = acc.into_submission_stats();
        assert_eq!(stats[0].location, "--");
    }

    #[test]
    fn aggregates_repeated_keys_within_one_accumulator() {
        let mut acc = Accumulator::new();
        acc.process_line(OK_LINE, 1);
        acc.process_line(OK_LINE, 2);
        assert_eq!(acc.len(), 1);
        let stats = acc.into_submission_stats();
        assert_eq!(stats[0].nb_successful_requests, 2);
        assert_eq!(stats[0].bytes, 13312);
    }

    #[test]
    fn merges_two_accumulators() {
        let mut a = Accumulator::new();
        a.process_line(OK_LINE, 1);
        let mut b = Accumulator::new();
        b.process_line(OK_LINE, 1);
        a.merge_from(b);
        assert_eq!(a.len(), 1);
        let stats = a.into_submission_stats();
        assert_eq!(stats[0].nb_successful_requests, 2);
        assert_eq!(stats[0].bytes, 13312);
    }

    #[test]
    fn client_hash_is_stable_for_same_id() {
        assert_eq!(hash_client_id("589198147"), hash_client_id("589198147"));
        assert_ne!(hash_client_id("589198147"), hash_client_id("42"));
    }
}
