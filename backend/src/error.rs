//! Closed error taxonomy, one-to-one mapped to HTTP responses by the
//! facade.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("unsupported value for parameter '{0}'")]
    BadValue(String),
    #[error("specify at least the 'start' parameter")]
    Mandatory,
    #[error("for non-operator users, 'network' parameter is required below network level or whenever any of the 'station', 'location', 'channel' parameters are specified")]
    NoNetwork,
    #[error("only one of 'month' or 'year' details can be requested each time")]
    BothMonthYear,
    #[error("no entry that matches given node and network parameters")]
    NoMatchingEntry,
    #[error("no token provided. Permission denied")]
    Unauthenticated,
    #[error("token has expired")]
    TokenExpired,
    #[error("invalid token signature")]
    BadSignature,
    #[error("no valid token provided")]
    InvalidBearerToken,
    #[error("user has no access to the requested network")]
    NotAuthorized,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("this statistic already exists on the server. Refusing to merge")]
    DuplicateSubmission,
    #[error("data can not be parsed as a valid submission payload")]
    MalformedPayload,
    #[error("database connection error or invalid SQL statement")]
    StorageError,
    #[error("database schema or privilege error")]
    IntegrityViolation,
    #[error("database call timed out")]
    Timeout,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        use ApiError::*;
        match self {
            UnknownParameter(_) | BadValue(_) | Mandatory | NoNetwork | BothMonthYear
            | NoMatchingEntry | DuplicateSubmission | MalformedPayload => StatusCode::BAD_REQUEST,
            Unauthenticated | TokenExpired | BadSignature => StatusCode::UNAUTHORIZED,
            InvalidBearerToken | NotAuthorized => StatusCode::FORBIDDEN,
            MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            StorageError | IntegrityViolation | Timeout => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "storage_error");
        match err {
            sqlx::Error::PoolTimedOut => ApiError::Timeout,
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                ApiError::DuplicateSubmission
            }
            _ => ApiError::StorageError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_expected_classes() {
        assert_eq!(ApiError::UnknownParameter("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Mandatory.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::DuplicateSubmission.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::TokenExpired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::InvalidBearerToken.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotAuthorized.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::MethodNotAllowed.status_code(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(ApiError::StorageError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn duplicate_submission_message_contains_stable_substring() {
        assert!(ApiError::DuplicateSubmission.to_string().contains("already exists"));
    }

    #[test]
    fn both_month_year_message_names_both_fields() {
        let msg = ApiError::BothMonthYear.to_string();
        assert!(msg.contains("month"));
        assert!(msg.contains("year"));
    }
}
