//! HTTP facade: `receive -> parse-params -> authenticate? -> authorize? ->
//! plan -> execute -> shape -> respond`, composed over an `axum` router
//! with a `ServiceBuilder` layer stack.

use crate::auth::{self, SignedTokenVerifier};
use crate::error::ApiError;
use crate::model::SubmissionEnvelope;
use crate::query::QueryPlan;
use crate::restriction;
use crate::store::{self, Pool, SubmitMode};
use crate::validator::{self, Endpoint};
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub verifier: Arc<dyn SignedTokenVerifier>,
}

pub fn router(prefix: &str, state: AppState) -> Router {
    Router::new()
        .route(&format!("{prefix}/_health"), get(health))
        .route(&format!("{prefix}/_nodes"), get(nodes))
        .route(&format!("{prefix}/_networks"), get(networks))
        .route(&format!("{prefix}/_isRestricted"), get(is_restricted))
        .route(
            &format!("{prefix}/node_restriction_policy"),
            get(node_restriction_policy),
        )
        .route(
            &format!("{prefix}/network_restriction_policy"),
            get(network_restriction_policy),
        )
        .route(&format!("{prefix}/dataselect/public"), get(public))
        .route(&format!("{prefix}/dataselect/restricted"), post(restricted))
        .route(&format!("{prefix}/dataselect/raw"), post(raw))
        .route(&format!("{prefix}/submit"), post(submit).put(submit))
        .with_state(state)
}

fn parse_raw_pairs(raw_query: Option<String>) -> Vec<(String, String)> {
    raw_query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

#[tracing::instrument(skip(state))]
async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    store::check_health(&state.pool).await?;
    Ok((
        StatusCode::OK,
        "The service is up and running and database is available!",
    ))
}

#[tracing::instrument(skip(state))]
async fn nodes(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let rows = store::list_nodes(&state.pool).await?;
    Ok(Json(serde_json::json!({
        "nodes": rows.into_iter().map(|(name, policy)| {
            serde_json::json!({ "name": name, "restriction_policy": policy.map(|b| (b as i32).to_string()) })
        }).collect::<Vec<_>>()
    })))
}

#[tracing::instrument(skip(state))]
async fn networks(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let rows = store::list_networks(&state.pool).await?;
    Ok(Json(serde_json::json!({
        "networks": rows.into_iter().map(|(name, node, policy)| {
            serde_json::json!({
                "name": name,
                "node": node,
                "restriction_policy": policy.map(|b| (b as i32).to_string()),
            })
        }).collect::<Vec<_>>()
    })))
}

#[tracing::instrument(skip(state))]
async fn is_restricted(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<impl IntoResponse, ApiError> {
    let pairs = parse_raw_pairs(raw);
    let mut node = None;
    let mut network = None;
    for (k, v) in &pairs {
        match k.as_str() {
            "node" => node = Some(v.clone()),
            "network" => network = Some(v.clone()),
            other => return Err(ApiError::UnknownParameter(other.to_string())),
        }
    }
    let (node, network) = match (node, network) {
        (Some(n), Some(w)) => (n, w),
        _ => return Err(ApiError::Mandatory),
    };

    let found = store::find_network_restriction(&state.pool, &node, &network).await?;
    let (default_policy, inversion, group) = found.ok_or(ApiError::NoMatchingEntry)?;
    let verdict = restriction::resolve(default_policy, inversion);
    Ok(Json(
        serde_json::json!({ "restricted": verdict.as_str(), "group": group }),
    ))
}

#[tracing::instrument(skip(state))]
async fn node_restriction_policy(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<impl IntoResponse, ApiError> {
    let pairs = parse_raw_pairs(raw);
    let mut node = None;
    for (k, v) in &pairs {
        match k.as_str() {
            "node" => node = Some(v.clone()),
            other => return Err(ApiError::UnknownParameter(other.to_string())),
        }
    }
    let node = node.ok_or(ApiError::Mandatory)?;
    let found = store::find_node(&state.pool, &node).await?;
    let row = found.ok_or(ApiError::NoMatchingEntry)?;
    Ok(Json(serde_json::json!({
        "restriction_policy": row.restriction_policy.map(|b| (b as i32).to_string())
    })))
}

#[tracing::instrument(skip(state))]
async fn network_restriction_policy(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<impl IntoResponse, ApiError> {
    let pairs = parse_raw_pairs(raw);
    let mut node = None;
    let mut network = None;
    for (k, v) in &pairs {
        match k.as_str() {
            "node" => node = Some(v.clone()),
            "network" => network = Some(v.clone()),
            other => return Err(ApiError::UnknownParameter(other.to_string())),
        }
    }
    let (node, network) = match (node, network) {
        (Some(n), Some(w)) => (n, w),
        _ => return Err(ApiError::Mandatory),
    };
    let found = store::find_network_restriction(&state.pool, &node, &network).await?;
    let (_default_policy, inversion, group) = found.ok_or(ApiError::NoMatchingEntry)?;
    Ok(Json(serde_json::json!({
        "invert_policy": inversion.map(|b| (b as i32).to_string()),
        "eas_group": group,
    })))
}

async fn known_node_names(pool: &Pool) -> Result<Vec<String>, ApiError> {
    Ok(store::list_nodes(pool)
        .await?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

fn render_response(
    shaped: Vec<crate::query::ShapedRow>,
    format: &str,
    request_parameters: &str,
) -> Response {
    if format == "csv" {
        let body = crate::query::to_csv(&shaped, request_parameters);
        (
            StatusCode::OK,
            [("content-type", "text/csv")],
            body,
        )
            .into_response()
    } else {
        Json(crate::query::to_json(&shaped, request_parameters)).into_response()
    }
}

#[tracing::instrument(skip(state))]
async fn public(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let pairs = parse_raw_pairs(raw);
    let known = known_node_names(&state.pool).await?;
    let params = validator::parse_params(&pairs, Endpoint::Public, true, &known)?;
    let plan = QueryPlan::from_params(&params, false).ok_or(ApiError::Mandatory)?;

    let rows = store::fetch_stat_rows(&state.pool, &plan).await?;
    let lookup = store::load_restriction_lookup(&state.pool).await?;
    let shaped = crate::query::shape(rows, &plan, &lookup, None, params.hllvalues);

    let request_parameters = format_request_parameters(&pairs);
    Ok(render_response(shaped, &params.format, &request_parameters))
}

/// Shared caller-gating used by `/restricted` and `/raw`: verify the
/// signed token, then determine operator status — a caller is an operator
/// for the whole request if their `memberof` contains ANY node's
/// `eas_group`.
async fn authenticate_query_caller(
    state: &AppState,
    body: &Bytes,
) -> Result<(auth::SignedTokenClaims, bool), ApiError> {
    let claims = state.verifier.verify(body)?;
    let node_groups = store::node_eas_groups(&state.pool).await?;
    let operator = node_groups
        .iter()
        .any(|g| g.as_ref().map(|g| claims.memberof.contains(g)).unwrap_or(false));
    Ok((claims, operator))
}

/// Pre-execution gate for `/restricted`: when the caller is not an
/// operator and a single `network` was specified, confirm at least one
/// matching `(node, network)` exists and that the caller can see it.
async fn check_network_access(
    state: &AppState,
    claims: &auth::SignedTokenClaims,
    nodes: &[String],
    network: &str,
) -> Result<(), ApiError> {
    let candidate_nodes: Vec<String> = if nodes.is_empty() {
        known_node_names(&state.pool).await?
    } else {
        nodes.to_vec()
    };

    let mut saw_entry = false;
    for node in &candidate_nodes {
        let found = match store::find_network_restriction(&state.pool, node, network).await? {
            Some(f) => f,
            None => continue,
        };
        saw_entry = true;
        let (default_policy, inversion, group) = found;
        let verdict = restriction::resolve(default_policy, inversion);
        match verdict {
            crate::model::Restricted::No => return Ok(()),
            crate::model::Restricted::Yes => {
                if claims.is_operator_for(&group) {
                    return Ok(());
                }
            }
            crate::model::Restricted::Undefined => {}
        }
    }

    if !saw_entry {
        return Err(ApiError::NoMatchingEntry);
    }
    Err(ApiError::NotAuthorized)
}

#[tracing::instrument(skip(state, body))]
async fn restricted(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (claims, operator) = authenticate_query_caller(&state, &body).await?;
    let pairs = parse_raw_pairs(raw);
    let known = known_node_names(&state.pool).await?;
    let params = validator::parse_params(&pairs, Endpoint::Restricted, !operator, &known)?;

    if !operator {
        if let Some(network) = params.network.first() {
            check_network_access(&state, &claims, &params.node, network).await?;
        }
    }

    let plan = QueryPlan::from_params(&params, false).ok_or(ApiError::Mandatory)?;
    let rows = store::fetch_stat_rows(&state.pool, &plan).await?;
    let lookup = store::load_restriction_lookup(&state.pool).await?;
    let caller_groups: HashSet<String> = claims.memberof.clone();
    let shaped = crate::query::shape(rows, &plan, &lookup, Some(&caller_groups), params.hllvalues);

    let request_parameters = format_request_parameters(&pairs);
    Ok(render_response(shaped, &params.format, &request_parameters))
}

#[tracing::instrument(skip(state, body))]
async fn raw(
    State(state): State<AppState>,
    RawQuery(raw_q): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (claims, operator) = authenticate_query_caller(&state, &body).await?;
    let pairs = parse_raw_pairs(raw_q);
    let known = known_node_names(&state.pool).await?;
    let params = validator::parse_params(&pairs, Endpoint::Raw, !operator, &known)?;

    if !operator {
        if let Some(network) = params.network.first() {
            check_network_access(&state, &claims, &params.node, network).await?;
        }
    }

    let plan = QueryPlan::from_params(&params, true).ok_or(ApiError::Mandatory)?;
    let rows = store::fetch_stat_rows(&state.pool, &plan).await?;
    let lookup = store::load_restriction_lookup(&state.pool).await?;
    let caller_groups: HashSet<String> = claims.memberof.clone();
    let shaped = crate::query::shape(rows, &plan, &lookup, Some(&caller_groups), params.hllvalues);

    let request_parameters = format_request_parameters(&pairs);
    Ok(render_response(shaped, &params.format, &request_parameters))
}

fn format_request_parameters(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_raw_pairs_flattens_repeated_keys() {
        let pairs = parse_raw_pairs(Some("country=GR&country=FR&start=2021-05".to_string()));
        assert_eq!(
            pairs,
            vec![
                ("country".to_string(), "GR".to_string()),
                ("country".to_string(), "FR".to_string()),
                ("start".to_string(), "2021-05".to_string()),
            ]
        );
    }

    #[test]
    fn parse_raw_pairs_handles_missing_query() {
        assert!(parse_raw_pairs(None).is_empty());
    }

    #[test]
    fn format_request_parameters_joins_with_ampersand() {
        let pairs = vec![("start".to_string(), "2021-05".to_string()), ("node".to_string(), "GFZ".to_string())];
        assert_eq!(format_request_parameters(&pairs), "start=2021-05&node=GFZ");
    }

    #[test]
    fn render_response_picks_csv_content_type() {
        let shaped = vec![];
        let resp = render_response(shaped, "csv", "start=2021-05");
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/csv"
        );
    }
}

#[tracing::instrument(skip(state, headers, body))]
async fn submit(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let mode = SubmitMode::from_http_method(&method).ok_or(ApiError::MethodNotAllowed)?;

    let token = auth::extract_bearer_token(&headers)?;
    let node_id = store::resolve_token(&state.pool, &token)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::InvalidBearerToken)?;

    let envelope: SubmissionEnvelope =
        serde_json::from_slice(&body).map_err(|_| ApiError::MalformedPayload)?;

    store::submit_payload(&state.pool, node_id, &envelope, mode).await?;

    Ok((
        StatusCode::OK,
        "Statistic successfully ingested to database!",
    ))
}
