//! Postgres-backed `Catalog`. All methods open their own transaction,
//! guaranteeing the insert-version-then-insert-files sequence in `add`, and
//! the delete-cascade in `apply_retention`, are each atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::db::Db;
use crate::error::{Error, Result};

use super::{Catalog, FileEntry, StagedFile, Version, VersionRecord};

pub struct PostgresCatalog {
    db: Db,
    max_version_count: i64,
    min_version_age_days: i64,
}

impl PostgresCatalog {
    pub fn new(db: Db, max_version_count: u32, min_version_age_days: u32) -> Self {
        Self {
            db,
            max_version_count: max_version_count as i64,
            min_version_age_days: min_version_age_days as i64,
        }
    }
}

/// Schema bootstrap, run once at startup (§4.8). Matches the shape the
/// original repository's migrations produced, minus the large-object
/// columns: `blobs` (see `crate::blob`) stands in for Postgres Large Objects,
/// which `tokio_postgres` has no protocol support for.
pub const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS updates (
    id          BIGSERIAL PRIMARY KEY,
    channel     TEXT NOT NULL,
    major       INTEGER NOT NULL,
    minor       INTEGER NOT NULL,
    patch       INTEGER NOT NULL,
    revision    INTEGER NOT NULL,
    build_time  TIMESTAMPTZ NOT NULL,
    record_time TIMESTAMPTZ NOT NULL DEFAULT now(),
    info        TEXT NOT NULL DEFAULT '',
    enabled     BOOLEAN NOT NULL DEFAULT TRUE,
    UNIQUE (channel, major, minor, patch, revision)
);
CREATE INDEX IF NOT EXISTS updates_channel_version_idx
    ON updates (channel, major DESC, minor DESC, patch DESC, revision DESC);

CREATE TABLE IF NOT EXISTS files (
    id         BIGSERIAL PRIMARY KEY,
    id_update  BIGINT NOT NULL REFERENCES updates (id) ON DELETE CASCADE,
    file_name  TEXT NOT NULL,
    checksum   TEXT NOT NULL,
    data_oid   BIGINT NOT NULL REFERENCES blobs (id),
    UNIQUE (id_update, file_name)
);

CREATE TABLE IF NOT EXISTS cache (
    id_update_from BIGINT REFERENCES updates (id) ON DELETE CASCADE,
    id_update_to   BIGINT NOT NULL REFERENCES updates (id) ON DELETE CASCADE,
    diff_oid       BIGINT NOT NULL REFERENCES blobs (id),
    diff_info      JSONB NOT NULL,
    UNIQUE (id_update_from, id_update_to)
);
CREATE UNIQUE INDEX IF NOT EXISTS cache_from_null_to_idx
    ON cache (id_update_to) WHERE id_update_from IS NULL;
";

async fn load_files(conn: &tokio_postgres::Client, id_update: i64) -> Result<Vec<FileEntry>> {
    let rows = conn
        .query(
            "SELECT file_name, checksum, data_oid FROM files WHERE id_update = $1 ORDER BY file_name ASC",
            &[&id_update],
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| FileEntry { name: row.get(0), checksum: row.get(1), blob_id: row.get(2) })
        .collect())
}

fn row_to_record(row: &tokio_postgres::Row, files: Vec<FileEntry>) -> VersionRecord {
    VersionRecord {
        id: row.get("id"),
        channel: row.get("channel"),
        version: Version::new(
            row.get::<_, i32>("major") as u32,
            row.get::<_, i32>("minor") as u32,
            row.get::<_, i32>("patch") as u32,
            row.get::<_, i32>("revision") as u32,
        ),
        build_time: row.get("build_time"),
        record_time: row.get("record_time"),
        info: row.get("info"),
        enabled: row.get("enabled"),
        files,
    }
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn insert_version(
        &self,
        channel: &str,
        version: Version,
        build_time: DateTime<Utc>,
        info: &str,
        enabled: bool,
        files: Vec<StagedFile>,
    ) -> Result<i64> {
        if channel.is_empty() {
            return Err(Error::InvalidArgument("channel must not be empty".into()));
        }
        if files.is_empty() {
            return Err(Error::InvalidArgument("a version must have at least one file".into()));
        }
        let mut seen = HashSet::with_capacity(files.len());
        for f in &files {
            if f.name.is_empty() {
                return Err(Error::InvalidArgument("file name must not be empty".into()));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(Error::InvalidArgument(format!("duplicate file name in upload: {}", f.name)));
            }
        }

        let mut conn = self.db.acquire_write().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_one(
                "INSERT INTO updates (channel, major, minor, patch, revision, build_time, info, enabled)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 RETURNING id",
                &[
                    &channel,
                    &(version.major as i32),
                    &(version.minor as i32),
                    &(version.patch as i32),
                    &(version.revision as i32),
                    &build_time,
                    &info,
                    &enabled,
                ],
            )
            .await?;
        let id_update: i64 = row.get(0);

        for f in &files {
            let checksum = hex::encode(Sha256::digest(&f.data));
            let blob_id = crate::blob::put(&tx, &f.data).await?;
            tx.execute(
                "INSERT INTO files (id_update, file_name, checksum, data_oid) VALUES ($1, $2, $3, $4)",
                &[&id_update, &f.name, &checksum, &blob_id],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(id_update)
    }

    async fn apply_retention(&self, channel: &str) -> Result<Vec<Version>> {
        let mut conn = self.db.acquire_write().await?;
        let tx = conn.transaction().await?;

        let rows = tx
            .query(
                "WITH ranked AS (
                     SELECT id, major, minor, patch, revision,
                            extract(day FROM now() - record_time)::bigint AS age_days,
                            row_number() OVER (ORDER BY major DESC, minor DESC, patch DESC, revision DESC) AS rn
                     FROM updates
                     WHERE channel = $1
                 ),
                 to_delete AS (
                     SELECT id, major, minor, patch, revision FROM ranked WHERE rn > $2 AND age_days > $3
                 )
                 DELETE FROM updates WHERE id IN (SELECT id FROM to_delete)
                 RETURNING major, minor, patch, revision",
                &[&channel, &self.max_version_count, &self.min_version_age_days],
            )
            .await?;

        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                Version::new(
                    row.get::<_, i32>(0) as u32,
                    row.get::<_, i32>(1) as u32,
                    row.get::<_, i32>(2) as u32,
                    row.get::<_, i32>(3) as u32,
                )
            })
            .collect())
    }

    async fn latest_newer(&self, channel: &str, client_version: Version) -> Result<Option<VersionRecord>> {
        let conn = self.db.acquire_read().await?;

        let row = conn
            .query_opt(
                "SELECT id, channel, major, minor, patch, revision, build_time, record_time, info, enabled
                 FROM updates
                 WHERE enabled = TRUE AND channel = $1
                 AND (major, minor, patch, revision) > ($2, $3, $4, $5)
                 ORDER BY major DESC, minor DESC, patch DESC, revision DESC
                 LIMIT 1",
                &[
                    &channel,
                    &(client_version.major as i32),
                    &(client_version.minor as i32),
                    &(client_version.patch as i32),
                    &(client_version.revision as i32),
                ],
            )
            .await?;

        let Some(row) = row else { return Ok(None) };
        let id: i64 = row.get("id");
        let files = load_files(&conn, id).await?;
        Ok(Some(row_to_record(&row, files)))
    }

    async fn get_by_version(&self, channel: &str, version: Version) -> Result<Option<VersionRecord>> {
        let conn = self.db.acquire_read().await?;

        let row = conn
            .query_opt(
                "SELECT id, channel, major, minor, patch, revision, build_time, record_time, info, enabled
                 FROM updates
                 WHERE enabled = TRUE AND channel = $1 AND major = $2 AND minor = $3 AND patch = $4 AND revision = $5",
                &[
                    &channel,
                    &(version.major as i32),
                    &(version.minor as i32),
                    &(version.patch as i32),
                    &(version.revision as i32),
                ],
            )
            .await?;

        let Some(row) = row else { return Ok(None) };
        let id: i64 = row.get("id");
        let files = load_files(&conn, id).await?;
        Ok(Some(row_to_record(&row, files)))
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<VersionRecord>> {
        let conn = self.db.acquire_read().await?;

        let row = conn
            .query_opt(
                "SELECT id, channel, major, minor, patch, revision, build_time, record_time, info, enabled
                 FROM updates WHERE id = $1",
                &[&id],
            )
            .await?;

        let Some(row) = row else { return Ok(None) };
        let files = load_files(&conn, id).await?;
        Ok(Some(row_to_record(&row, files)))
    }

    async fn resolve_id(&self, channel: &str, version: Version) -> Result<Option<i64>> {
        let conn = self.db.acquire_read().await?;

        let row = conn
            .query_opt(
                "SELECT id FROM updates
                 WHERE channel = $1 AND major = $2 AND minor = $3 AND patch = $4 AND revision = $5",
                &[
                    &channel,
                    &(version.major as i32),
                    &(version.minor as i32),
                    &(version.patch as i32),
                    &(version.revision as i32),
                ],
            )
            .await?;

        Ok(row.map(|row| row.get(0)))
    }
}
