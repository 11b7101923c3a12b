//! The content store: opaque byte sequences keyed by an integer object id.
//!
//! Backed by a `blobs(id BIGSERIAL PRIMARY KEY, data BYTEA NOT NULL)` table
//! reached through whatever transaction the caller already holds — `put` and
//! `get` never open their own transaction, so they compose with the
//! catalog's and diff cache's write transactions atomically.

use tokio_postgres::Transaction;

use crate::error::{Error, Result};

/// Writes `data` as a new blob inside `tx`'s transaction and returns its id.
pub async fn put(tx: &Transaction<'_>, data: &[u8]) -> Result<i64> {
    let row = tx
        .query_one("INSERT INTO blobs (data) VALUES ($1) RETURNING id", &[&data])
        .await?;
    Ok(row.get(0))
}

/// Reads back the bytes for `blob_id`. Fails with `NotFound` if absent.
pub async fn get(tx: &Transaction<'_>, blob_id: i64) -> Result<Vec<u8>> {
    let row = tx
        .query_opt("SELECT data FROM blobs WHERE id = $1", &[&blob_id])
        .await?
        .ok_or_else(|| Error::NotFound(format!("blob {blob_id}")))?;
    Ok(row.get(0))
}

pub const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS blobs (
    id   BIGSERIAL PRIMARY KEY,
    data BYTEA NOT NULL
)";
