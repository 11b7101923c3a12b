//! Request/response shapes and the HTTP error envelope.
//!
//! `ApiError` is the only place HTTP status codes are decided — `catalog`,
//! `cache`, and `service` never import `axum`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::catalog::{Version, VersionRecord};
use crate::error::Error;

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub channel: String,
    pub version: Version,
    #[serde(rename = "localIP", default)]
    pub local_ip: Option<String>,
    #[serde(rename = "appLogin", default)]
    pub app_login: Option<String>,
    #[serde(rename = "osLogin", default)]
    pub os_login: Option<String>,
}

/// The `buildTime` wire format used both in the `/add` form field and in
/// `/check`'s JSON response and `/update`'s `Version-Date` header.
pub const BUILD_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Serialize)]
pub struct UpdateInfoBody {
    pub version: Version,
    #[serde(rename = "buildTime")]
    pub build_time: String,
    pub info: String,
}

impl From<VersionRecord> for UpdateInfoBody {
    fn from(record: VersionRecord) -> Self {
        Self {
            version: record.version,
            build_time: record.build_time.format(BUILD_TIME_FORMAT).to_string(),
            info: record.info,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let (status, kind) = match &e {
            Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            Error::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            Error::PermissionDenied(_) => (StatusCode::FORBIDDEN, "permission_denied"),
            // "No update" is a normal outcome, not an error condition; 204 is
            // intentional here, not a typo (see error.rs).
            Error::NotFound(_) => (StatusCode::NO_CONTENT, "not_found"),
            // Legacy: the source service returns 403 on duplicate version
            // rather than 409. Preserved for client compatibility.
            Error::AlreadyExists(_) => (StatusCode::FORBIDDEN, "already_exists"),
            Error::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, "too_many_requests"),
            Error::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self { status, kind, message: e.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status == StatusCode::NO_CONTENT {
            return self.status.into_response();
        }
        if !matches!(self.status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::debug!(status = %self.status, kind = self.kind, message = %self.message, "request rejected");
        } else {
            tracing::error!(kind = self.kind, message = %self.message, "internal error serving request");
        }
        (self.status, Json(json!({"error": self.kind, "message": self.message}))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
