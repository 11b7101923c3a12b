//! Route handlers: parse the transport-level request, build a
//! `ClientContext`, call into `service::Service`, shape the response.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Extension, Multipart, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{NaiveDateTime, Utc};

use crate::catalog::Version;

use super::middleware::ClientToken;
use super::server::AppState;
use super::types::{ApiResult, BUILD_TIME_FORMAT, CheckRequest, UpdateInfoBody};
use crate::error::Error;
use crate::service::ClientContext;

fn client_context(token: String, peer: Option<SocketAddr>, deadline_from: std::time::Duration) -> ClientContext {
    ClientContext {
        peer_addr: peer.map(|a| a.ip()),
        token,
        deadline: tokio::time::Instant::now() + deadline_from,
    }
}

/// Mirrors the original service's handler: an absent-or-empty part defaults
/// to `true`, `"true"`/`"false"` compare case-insensitively, anything else is
/// rejected.
fn parse_enabled(raw: &str) -> Result<bool, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(Error::InvalidArgument(format!("invalid enabled value: {raw}")))
    }
}

pub async fn add(
    State(state): State<AppState>,
    Extension(ClientToken(token)): Extension<ClientToken>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> ApiResult<StatusCode> {
    let mut update_bytes: Option<Vec<u8>> = None;
    let mut build_time_raw = String::new();
    let mut channel = String::new();
    let mut info = String::new();
    let mut version_raw = String::new();
    let mut enabled = true;

    while let Some(field) = multipart.next_field().await.map_err(|e| Error::InvalidArgument(e.to_string()))? {
        let Some(name) = field.name().map(str::to_string) else { continue };
        match name.as_str() {
            "update" => {
                let bytes = field.bytes().await.map_err(|e| Error::InvalidArgument(e.to_string()))?;
                update_bytes = Some(bytes.to_vec());
            }
            "buildTime" => build_time_raw = field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()))?,
            "channel" => channel = field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()))?,
            "info" => info = field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()))?,
            "version" => version_raw = field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()))?,
            "enabled" => {
                let raw = field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()))?;
                enabled = parse_enabled(&raw)?;
            }
            _ => {}
        }
    }

    let update_bytes = update_bytes.ok_or_else(|| Error::InvalidArgument("missing 'update' part".into()))?;
    if channel.is_empty() {
        return Err(Error::InvalidArgument("channel must not be empty".into()).into());
    }
    let version = Version::parse(&version_raw)?;
    let build_time = if build_time_raw.trim().is_empty() {
        Utc::now()
    } else {
        NaiveDateTime::parse_from_str(&build_time_raw, BUILD_TIME_FORMAT)
            .map_err(|_| Error::InvalidArgument(format!("invalid buildTime: {build_time_raw}")))?
            .and_utc()
    };

    let ctx = client_context(token, Some(peer), state.write_timeout);
    state.service.add(&ctx, &channel, version, build_time, &info, enabled, &update_bytes).await?;

    Ok(StatusCode::CREATED)
}

pub async fn check(
    State(state): State<AppState>,
    Extension(ClientToken(token)): Extension<ClientToken>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<CheckRequest>,
) -> ApiResult<Response> {
    let ctx = client_context(token, Some(peer), state.read_timeout);
    match state.service.check(&ctx, &body.channel, body.version).await? {
        Some(record) => Ok((StatusCode::OK, Json(UpdateInfoBody::from(record))).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn update(
    State(state): State<AppState>,
    Extension(ClientToken(token)): Extension<ClientToken>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<CheckRequest>,
) -> ApiResult<Response> {
    let ctx = client_context(token, Some(peer), state.read_timeout);
    match state.service.update(&ctx, &body.channel, body.version).await? {
        Some((metadata, archive)) => {
            let mut response = (StatusCode::OK, archive).into_response();
            let headers = response.headers_mut();
            headers.insert("Content-Type", HeaderValue::from_static("application/zip"));
            headers.insert(
                "Version-Date",
                HeaderValue::from_str(&metadata.build_time.format(BUILD_TIME_FORMAT).to_string())
                    .unwrap_or(HeaderValue::from_static("")),
            );
            headers.insert("Version-Major", HeaderValue::from(metadata.to_version.major));
            headers.insert("Version-Minor", HeaderValue::from(metadata.to_version.minor));
            headers.insert("Version-Patch", HeaderValue::from(metadata.to_version.patch));
            headers.insert("Version-Revision", HeaderValue::from(metadata.to_version.revision));
            Ok(response)
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_enabled_defaults_empty_to_true() {
        assert!(parse_enabled("").unwrap());
        assert!(parse_enabled("   ").unwrap());
    }

    #[test]
    fn parse_enabled_is_case_insensitive() {
        assert!(parse_enabled("true").unwrap());
        assert!(parse_enabled("TRUE").unwrap());
        assert!(parse_enabled("True").unwrap());
        assert!(!parse_enabled("false").unwrap());
        assert!(!parse_enabled("FALSE").unwrap());
        assert!(!parse_enabled("False").unwrap());
    }

    #[test]
    fn parse_enabled_rejects_other_values() {
        assert!(parse_enabled("yes").is_err());
        assert!(parse_enabled("0").is_err());
    }
}
