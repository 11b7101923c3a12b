//! Token-set authentication (§4.9, §6). A bare opaque token in
//! `X-Authorization`, checked against the configured read/write sets before
//! the handler ever runs — grounded on the teacher's `auth_middleware`
//! pattern, simplified from JWT/API-key/mTLS down to the one scheme this
//! service actually uses.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::types::ApiError;
use crate::error::Error;

use super::server::AppState;

const TOKEN_HEADER: &str = "x-authorization";

/// The caller's token, attached to the request by the auth layer and read
/// back out by handlers that need it for logging.
#[derive(Debug, Clone)]
pub struct ClientToken(pub String);

fn extract_token(headers: &HeaderMap) -> Result<String, Error> {
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or(Error::Unauthenticated)
}

/// `/add` requires a write-capable token. A token that exists but is
/// read-only is `PermissionDenied`, not `Unauthenticated`.
pub async fn require_write_token(State(state): State<AppState>, mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let token = extract_token(req.headers()).map_err(ApiError::from)?;
    if state.write_tokens.contains(&token) {
        req.extensions_mut().insert(ClientToken(token));
        return Ok(next.run(req).await);
    }
    if state.read_tokens.contains(&token) {
        return Err(Error::PermissionDenied("write token required".into()).into());
    }
    Err(Error::Unauthenticated.into())
}

/// `/check` and `/update` accept any known token, read- or write-capable.
pub async fn require_known_token(State(state): State<AppState>, mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let token = extract_token(req.headers()).map_err(ApiError::from)?;
    if state.read_tokens.contains(&token) || state.write_tokens.contains(&token) {
        req.extensions_mut().insert(ClientToken(token));
        return Ok(next.run(req).await);
    }
    Err(Error::Unauthenticated.into())
}
