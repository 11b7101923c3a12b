//! The service facade: the three client-facing operations, each a thin
//! orchestration over `catalog` and `cache`. No HTTP, no SQL — those live in
//! `api` and `catalog::postgres` respectively.

use std::io::{Cursor, Read};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::cache::{CacheMetadata, DiffCache};
use crate::catalog::{Catalog, StagedFile, Version, VersionRecord};
use crate::error::{Error, Result};

/// Per-request identity and deadline, threaded explicitly rather than kept
/// as ambient/thread-local state (§3). The deadline bounds the diff cache's
/// in-flight wait; database round-trips are separately bounded by the pool's
/// own configured read/write timeouts.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub peer_addr: Option<IpAddr>,
    pub token: String,
    pub deadline: Instant,
}

pub struct Service {
    catalog: Arc<dyn Catalog>,
    cache: Arc<DiffCache>,
}

impl Service {
    pub fn new(catalog: Arc<dyn Catalog>, cache: Arc<DiffCache>) -> Self {
        Self { catalog, cache }
    }

    /// Unpacks `archive_bytes` as a ZIP, computes each member's checksum, and
    /// inserts the version. Retention is applied afterward on a best-effort
    /// basis: a retention failure is logged but does not undo the insert.
    pub async fn add(
        &self,
        _ctx: &ClientContext,
        channel: &str,
        version: Version,
        build_time: DateTime<Utc>,
        info: &str,
        enabled: bool,
        archive_bytes: &[u8],
    ) -> Result<()> {
        let files = unpack_zip(archive_bytes)?;

        let id = self
            .catalog
            .insert_version(channel, version, build_time, info, enabled, files)
            .await?;

        if let Err(e) = self.catalog.apply_retention(channel).await {
            tracing::warn!(error = %e, channel, id, "retention pass failed after insert");
        }

        Ok(())
    }

    pub async fn check(&self, _ctx: &ClientContext, channel: &str, client_version: Version) -> Result<Option<VersionRecord>> {
        self.catalog.latest_newer(channel, client_version).await
    }

    /// Returns `None` when there is nothing newer, or — rarely — when the
    /// version just resolved by `latest_newer` is deleted by a concurrent
    /// retention pass before the cache can read it back.
    pub async fn update(
        &self,
        ctx: &ClientContext,
        channel: &str,
        client_version: Version,
    ) -> Result<Option<(CacheMetadata, Vec<u8>)>> {
        let Some(newest) = self.catalog.latest_newer(channel, client_version).await? else {
            return Ok(None);
        };

        self.cache.get(channel, client_version, newest.version, ctx.deadline).await
    }
}

fn unpack_zip(archive_bytes: &[u8]) -> Result<Vec<StagedFile>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))
        .map_err(|e| Error::InvalidArgument(format!("not a valid zip archive: {e}")))?;

    let mut files = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::InvalidArgument(format!("corrupt zip entry: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::InvalidArgument(format!("failed to read zip entry {name}: {e}")))?;
        files.push(StagedFile { name, data });
    }

    if files.is_empty() {
        return Err(Error::InvalidArgument("uploaded archive contains no files".into()));
    }

    Ok(files)
}
