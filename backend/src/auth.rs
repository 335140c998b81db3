//! Two distinct, deliberately unmerged auth paths: a bearer token
//! authenticator for `/submit` (node identity, resolved in `store.rs`
//! against the `tokens` table) and a signed-token verifier for the query
//! endpoints (`/restricted`, `/raw`), whose claims carry group membership
//! and an expiry. They validate against different trust surfaces and are
//! kept as separate components on purpose.

use crate::error::ApiError;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Command;

/// Extract the bearer token from the ingestion `Authentication` header
/// (note: `Authentication`, not the conventional `Authorization`).
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get("Authentication")
        .ok_or(ApiError::Unauthenticated)?
        .to_str()
        .map_err(|_| ApiError::Unauthenticated)?;
    let mut parts = raw.splitn(2, ' ');
    let scheme = parts.next().unwrap_or("");
    let value = parts.next().ok_or(ApiError::Unauthenticated)?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return Err(ApiError::Unauthenticated);
    }
    Ok(value.to_string())
}

/// Claims carried by a signed query-authentication token.
#[derive(Debug, Clone)]
pub struct SignedTokenClaims {
    pub valid_until: DateTime<Utc>,
    pub memberof: HashSet<String>,
    pub given_name: String,
}

impl SignedTokenClaims {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }

    /// A caller is an "operator" for a node if they hold that node's
    /// `eas_group` in `memberof`.
    pub fn is_operator_for(&self, node_eas_group: &Option<String>) -> bool {
        match node_eas_group {
            Some(group) => self.memberof.contains(group),
            None => false,
        }
    }
}

/// Normalize a `memberof` claim into a set of group names. The claim may
/// arrive as a semicolon-joined string (`"groupA;groupB"`) or, from older
/// clients, as a path-like string (`"groupA/groupB"`) — a single function
/// handles both shapes so callers never special-case the source.
pub fn parse_groups(claim: &str) -> HashSet<String> {
    claim
        .split(|c| c == ';' || c == '/')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Parse the colon-separated, comma-joined key-value claim body extracted
/// from a verified signed token, e.g.
/// `{valid_until:2030-01-01T00:00:00.000Z,memberof:GFZ;RESIF,cn:Jane Doe}`.
fn parse_claim_body(body: &str) -> std::collections::HashMap<String, String> {
    let trimmed = body.trim().trim_start_matches('{').trim_end_matches('}');
    trimmed
        .split(',')
        .filter_map(|kv| {
            let mut it = kv.splitn(2, ':');
            let k = it.next()?.trim();
            let v = it.next()?.trim();
            if k.is_empty() {
                None
            } else {
                Some((k.to_string(), v.to_string()))
            }
        })
        .collect()
}

/// Verifies a detached-signature-wrapped token against a configured trust
/// root. The concrete verification mechanism is treated as an opaque
/// external collaborator; this trait is the seam.
pub trait SignedTokenVerifier: Send + Sync {
    fn verify(&self, signed_body: &[u8]) -> Result<SignedTokenClaims, ApiError>;
}

/// Shells out to `gpg --verify` against a configured keyring directory.
pub struct GpgSignedTokenVerifier {
    pub gnupg_home: PathBuf,
}

impl SignedTokenVerifier for GpgSignedTokenVerifier {
    fn verify(&self, signed_body: &[u8]) -> Result<SignedTokenClaims, ApiError> {
        let tmp = std::env::temp_dir().join(format!("eidastats-token-{}.asc", std::process::id()));
        std::fs::write(&tmp, signed_body).map_err(|_| ApiError::BadSignature)?;

        let status = Command::new("gpg")
            .arg("--homedir")
            .arg(&self.gnupg_home)
            .arg("--verify")
            .arg(&tmp)
            .status();
        let _ = std::fs::remove_file(&tmp);

        match status {
            Ok(s) if s.success() => {}
            _ => return Err(ApiError::BadSignature),
        }

        let text = String::from_utf8_lossy(signed_body).into_owned();
        let start = text.find('{').ok_or(ApiError::BadSignature)?;
        let end = text.rfind('}').ok_or(ApiError::BadSignature)?;
        let claim_body = &text[start..=end];
        let fields = parse_claim_body(claim_body);

        let valid_until_raw = fields.get("valid_until").ok_or(ApiError::BadSignature)?;
        let valid_until = DateTime::parse_from_rfc3339(valid_until_raw)
            .map_err(|_| ApiError::BadSignature)?
            .with_timezone(&Utc);

        let memberof = fields
            .get("memberof")
            .map(|m| parse_groups(m))
            .unwrap_or_default();

        let given_name = fields
            .get("givenName")
            .or_else(|| fields.get("cn"))
            .cloned()
            .unwrap_or_else(|| "null".to_string());

        let claims = SignedTokenClaims {
            valid_until,
            memberof,
            given_name,
        };

        if claims.is_expired(Utc::now()) {
            return Err(ApiError::TokenExpired);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("Authentication", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc123");
    }

    #[test]
    fn missing_header_is_unauthenticated() {
        let headers = HeaderMap::new();
        assert!(matches!(
            extract_bearer_token(&headers),
            Err(ApiError::Unauthenticated)
        ));
    }

    #[test]
    fn wrong_scheme_is_unauthenticated() {
        let mut headers = HeaderMap::new();
        headers.insert("Authentication", HeaderValue::from_static("Basic abc123"));
        assert!(matches!(
            extract_bearer_token(&headers),
            Err(ApiError::Unauthenticated)
        ));
    }

    #[test]
    fn parse_groups_handles_semicolon_shape() {
        let groups = parse_groups("GFZ;RESIF;ODC");
        assert_eq!(groups.len(), 3);
        assert!(groups.contains("RESIF"));
    }

    #[test]
    fn parse_groups_handles_path_like_shape() {
        let groups = parse_groups("GFZ/RESIF/ODC");
        assert_eq!(groups.len(), 3);
        assert!(groups.contains("ODC"));
    }

    #[test]
    fn parse_groups_trims_and_drops_empty() {
        let groups = parse_groups(" GFZ ; ;RESIF ");
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn claim_body_parses_fields() {
        let fields = parse_claim_body(
            "{valid_until:2030-01-01T00:00:00.000Z,memberof:GFZ;RESIF,cn:Jane Doe}",
        );
        assert_eq!(fields.get("valid_until").unwrap(), "2030-01-01T00:00:00.000Z");
        assert_eq!(fields.get("memberof").unwrap(), "GFZ;RESIF");
        assert_eq!(fields.get("cn").unwrap(), "Jane Doe");
    }

    #[test]
    fn is_operator_for_matches_membership() {
        let claims = SignedTokenClaims {
            valid_until: Utc::now() + chrono::Duration::days(1),
            memberof: ["GFZ".to_string(), "RESIF".to_string()].into_iter().collect(),
            given_name: "Jane".into(),
        };
        assert!(claims.is_operator_for(&Some("RESIF".to_string())));
        assert!(!claims.is_operator_for(&Some("ODC".to_string())));
        assert!(!claims.is_operator_for(&None));
    }

    #[test]
    fn is_expired_detects_past_tokens() {
        let claims = SignedTokenClaims {
            valid_until: Utc::now() - chrono::Duration::days(1),
            memberof: HashSet::new(),
            given_name: "Jane".into(),
        };
        assert!(claims.is_expired(Utc::now()));
    }
}
