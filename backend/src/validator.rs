//! Request parameter validator for the three dataselect query endpoints.
//! A single allow-listed, per-endpoint pass over the raw query string that
//! either produces a fully normalized parameter set or raises one of the
//! `ApiError` query-validation variants. Kept free of any database access
//! so it can be exercised without a pool.

use crate::error::ApiError;
use chrono::NaiveDate;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Public,
    Restricted,
    Raw,
}

impl Endpoint {
    fn accepted_params(&self) -> &'static [&'static str] {
        const BASE: &[&str] = &[
            "start", "end", "node", "network", "country", "level", "details", "format",
            "hllvalues",
        ];
        const WITH_TRACE: &[&str] = &[
            "start", "end", "node", "network", "country", "level", "details", "format",
            "hllvalues", "station", "location", "channel",
        ];
        match self {
            Endpoint::Public => BASE,
            Endpoint::Restricted | Endpoint::Raw => WITH_TRACE,
        }
    }

    fn is_trace_level_allowed(&self) -> bool {
        !matches!(self, Endpoint::Public)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidatedParams {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub node: Vec<String>,
    pub network: Vec<String>,
    pub station: Vec<String>,
    pub location: Vec<String>,
    pub channel: Vec<String>,
    pub country: Vec<String>,
    pub level: Option<String>,
    pub details: Vec<String>,
    pub format: String,
    pub hllvalues: bool,
}

fn translate_wildcards(value: &str) -> String {
    value.replace('*', "%").replace('?', "_")
}

fn split_multivalue(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|v| v.split(',').map(|s| s.to_string()))
        .collect()
}

fn group_params(raw_pairs: &[(String, String)]) -> HashMap<String, Vec<String>> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for (k, v) in raw_pairs {
        grouped.entry(k.clone()).or_default().push(v.clone());
    }
    grouped
}

/// Validate and normalize a dataselect query's raw `(key, value)` pairs.
///
/// `one_network` is `true` for ordinary (non-operator) callers, who may
/// name at most one network per request; node operators pass `false` and
/// may supply several.
pub fn parse_params(
    raw_pairs: &[(String, String)],
    endpoint: Endpoint,
    one_network: bool,
    known_nodes: &[String],
) -> Result<ValidatedParams, ApiError> {
    let grouped = group_params(raw_pairs);
    let accepted = endpoint.accepted_params();

    if !grouped.contains_key("start") {
        return Err(ApiError::Mandatory);
    }

    let trace_present = ["station", "channel", "location"]
        .iter()
        .any(|k| grouped.contains_key(*k));
    if endpoint == Endpoint::Restricted && one_network && trace_present && !grouped.contains_key("network") {
        return Err(ApiError::NoNetwork);
    }

    let mut out = ValidatedParams {
        format: "csv".to_string(),
        hllvalues: false,
        ..Default::default()
    };

    for (key, values) in &grouped {
        if !accepted.contains(&key.as_str()) {
            return Err(ApiError::UnknownParameter(key.clone()));
        }

        match key.as_str() {
            "start" | "end" => {
                let raw = values.first().ok_or_else(|| ApiError::BadValue(key.clone()))?;
                let month = NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d")
                    .map_err(|_| ApiError::BadValue(key.clone()))?;
                if key == "start" {
                    out.start = Some(month);
                } else {
                    out.end = Some(month);
                }
            }
            "format" => {
                let raw = values.first().ok_or_else(|| ApiError::BadValue(key.clone()))?;
                if raw != "csv" && raw != "json" {
                    return Err(ApiError::BadValue(key.clone()));
                }
                out.format = raw.clone();
            }
            "hllvalues" => {
                let raw = values.first().ok_or_else(|| ApiError::BadValue(key.clone()))?;
                out.hllvalues = match raw.as_str() {
                    "true" => true,
                    "false" => false,
                    _ => return Err(ApiError::BadValue(key.clone())),
                };
            }
            "level" => {
                let raw = values.first().ok_or_else(|| ApiError::BadValue(key.clone()))?;
                const ALL: &[&str] = &["node", "network", "station", "location", "channel"];
                if !ALL.contains(&raw.as_str()) {
                    return Err(ApiError::BadValue(key.clone()));
                }
                if !endpoint.is_trace_level_allowed() && raw != "node" && raw != "network" {
                    return Err(ApiError::BadValue(key.clone()));
                }
                if endpoint == Endpoint::Restricted
                    && one_network
                    && ["station", "location", "channel"].contains(&raw.as_str())
                    && !grouped.contains_key("network")
                {
                    return Err(ApiError::NoNetwork);
                }
                out.level = Some(raw.clone());
            }
            "network" if one_network => {
                let raw = values.first().ok_or_else(|| ApiError::BadValue(key.clone()))?;
                out.network = vec![translate_wildcards(raw)];
            }
            "network" => {
                out.network = split_multivalue(values)
                    .iter()
                    .map(|v| translate_wildcards(v))
                    .collect();
            }
            "station" => {
                out.station = split_multivalue(values)
                    .iter()
                    .map(|v| translate_wildcards(v))
                    .collect();
            }
            "location" => {
                out.location = split_multivalue(values)
                    .iter()
                    .map(|v| translate_wildcards(v))
                    .collect();
            }
            "channel" => {
                out.channel = split_multivalue(values)
                    .iter()
                    .map(|v| translate_wildcards(v))
                    .collect();
            }
            "country" => {
                out.country = split_multivalue(values);
            }
            "node" => {
                let names = split_multivalue(values);
                if names.iter().any(|n| !known_nodes.iter().any(|k| k == n)) {
                    return Err(ApiError::BadValue(key.clone()));
                }
                out.node = names;
            }
            "details" => {
                let vals = split_multivalue(values);
                const ALL: &[&str] = &["month", "year", "country"];
                if vals.iter().any(|v| !ALL.contains(&v.as_str())) {
                    return Err(ApiError::BadValue(key.clone()));
                }
                if vals.iter().any(|v| v == "month") && vals.iter().any(|v| v == "year") {
                    return Err(ApiError::BothMonthYear);
                }
                out.details = vals;
            }
            _ => unreachable!("accepted list and match arms must stay in sync"),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(input: &[(&str, &str)]) -> Vec<(String, String)> {
        input.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn requires_start() {
        let err = parse_params(&pairs(&[("node", "GFZ")]), Endpoint::Public, true, &[]).unwrap_err();
        assert!(matches!(err, ApiError::Mandatory));
    }

    #[test]
    fn normalizes_month_to_first_of_month() {
        let parsed = parse_params(&pairs(&[("start", "2021-05")]), Endpoint::Public, true, &[]).unwrap();
        assert_eq!(parsed.start, Some(NaiveDate::from_ymd_opt(2021, 5, 1).unwrap()));
    }

    #[test]
    fn rejects_malformed_date() {
        let err = parse_params(&pairs(&[("start", "not-a-date")]), Endpoint::Public, true, &[]).unwrap_err();
        assert!(matches!(err, ApiError::BadValue(k) if k == "start"));
    }

    #[test]
    fn rejects_unknown_parameter() {
        let err = parse_params(
            &pairs(&[("start", "2021-05"), ("bogus", "x")]),
            Endpoint::Public,
            true,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::UnknownParameter(k) if k == "bogus"));
    }

    #[test]
    fn rejects_trace_params_on_public() {
        let err = parse_params(
            &pairs(&[("start", "2021-05"), ("station", "ANMO")]),
            Endpoint::Public,
            true,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::UnknownParameter(k) if k == "station"));
    }

    #[test]
    fn requires_network_when_trace_param_given_restricted() {
        let err = parse_params(
            &pairs(&[("start", "2021-05"), ("station", "ANMO")]),
            Endpoint::Restricted,
            true,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::NoNetwork));
    }

    #[test]
    fn operator_may_omit_network_with_trace_params() {
        let parsed = parse_params(
            &pairs(&[("start", "2021-05"), ("station", "ANMO")]),
            Endpoint::Restricted,
            false,
            &[],
        )
        .unwrap();
        assert_eq!(parsed.station, vec!["ANMO".to_string()]);
    }

    #[test]
    fn raw_endpoint_does_not_require_network_for_trace_params() {
        let parsed = parse_params(
            &pairs(&[("start", "2021-05"), ("station", "ANMO")]),
            Endpoint::Raw,
            true,
            &[],
        )
        .unwrap();
        assert_eq!(parsed.station, vec!["ANMO".to_string()]);
    }

    #[test]
    fn level_below_network_requires_network_for_non_operator() {
        let err = parse_params(
            &pairs(&[("start", "2021-05"), ("level", "station")]),
            Endpoint::Restricted,
            true,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::NoNetwork));
    }

    #[test]
    fn public_endpoint_rejects_trace_level() {
        let err = parse_params(
            &pairs(&[("start", "2021-05"), ("level", "station")]),
            Endpoint::Public,
            true,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::BadValue(k) if k == "level"));
    }

    #[test]
    fn multivalue_params_split_on_comma_and_flatten_across_keys() {
        let parsed = parse_params(
            &pairs(&[("start", "2021-05"), ("country", "GR,FR"), ("country", "SP")]),
            Endpoint::Public,
            true,
            &[],
        )
        .unwrap();
        let mut got = parsed.country.clone();
        got.sort();
        assert_eq!(got, vec!["FR".to_string(), "GR".to_string(), "SP".to_string()]);
    }

    #[test]
    fn single_network_caller_keeps_raw_value_unsplit() {
        let parsed = parse_params(
            &pairs(&[("start", "2021-05"), ("network", "GR,FR")]),
            Endpoint::Public,
            true,
            &[],
        )
        .unwrap();
        assert_eq!(parsed.network, vec!["GR,FR".to_string()]);
    }

    #[test]
    fn wildcards_translate_to_sql_syntax() {
        let parsed = parse_params(
            &pairs(&[("start", "2021-05"), ("station", "AN*O?")]),
            Endpoint::Restricted,
            false,
            &[],
        )
        .unwrap();
        assert_eq!(parsed.station, vec!["AN%O_".to_string()]);
    }

    #[test]
    fn rejects_unknown_node() {
        let err = parse_params(
            &pairs(&[("start", "2021-05"), ("node", "BOGUS")]),
            Endpoint::Public,
            true,
            &["GFZ".to_string(), "RESIF".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::BadValue(k) if k == "node"));
    }

    #[test]
    fn accepts_known_node() {
        let parsed = parse_params(
            &pairs(&[("start", "2021-05"), ("node", "GFZ")]),
            Endpoint::Public,
            true,
            &["GFZ".to_string()],
        )
        .unwrap();
        assert_eq!(parsed.node, vec!["GFZ".to_string()]);
    }

    #[test]
    fn rejects_both_month_and_year_details() {
        let err = parse_params(
            &pairs(&[("start", "2021-05"), ("details", "month,year")]),
            Endpoint::Public,
            true,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::BothMonthYear));
    }

    #[test]
    fn details_default_to_empty() {
        let parsed = parse_params(&pairs(&[("start", "2021-05")]), Endpoint::Public, true, &[]).unwrap();
        assert!(parsed.details.is_empty());
    }

    #[test]
    fn format_and_hllvalues_defaults_and_validation() {
        let parsed = parse_params(&pairs(&[("start", "2021-05")]), Endpoint::Public, true, &[]).unwrap();
        assert_eq!(parsed.format, "csv");
        assert!(!parsed.hllvalues);

        let err = parse_params(
            &pairs(&[("start", "2021-05"), ("format", "xml")]),
            Endpoint::Public,
            true,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::BadValue(k) if k == "format"));
    }
}
