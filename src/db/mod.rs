//! The shared connection pool and per-call timeout configuration.
//!
//! Every catalog, blob-store, and diff-cache round-trip acquires its own
//! connection from this pool, opens a transaction on it, and is responsible
//! for calling `tx.commit()` on success. `tokio_postgres::Transaction`
//! already issues a best-effort `ROLLBACK` from its own `Drop` impl, so any
//! non-commit exit path (an early `?`, a panic unwind) rolls back without
//! each call site having to arrange it by hand — the same guarantee the
//! original service got from `defer tx.Rollback()`.
//!
//! `DATABASE_URL` is connected to over TLS whenever it carries an `sslmode`
//! parameter other than `disable`; otherwise a plain connection is used. Both
//! paths yield the same `tokio_postgres::Client` underneath, so callers never
//! see the difference.

use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;
use std::time::Duration;

use bb8::{Pool, PooledConnection};
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::NoTls;
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::error::{Error, Result};

static CRYPTO_PROVIDER: OnceLock<()> = OnceLock::new();

enum DbPool {
    Plain(Pool<PostgresConnectionManager<NoTls>>),
    Tls(Pool<PostgresConnectionManager<MakeRustlsConnect>>),
}

/// A checked-out connection from either pool variant. Derefs to
/// `tokio_postgres::Client` so call sites never match on it.
pub enum Connection<'a> {
    Plain(PooledConnection<'a, PostgresConnectionManager<NoTls>>),
    Tls(PooledConnection<'a, PostgresConnectionManager<MakeRustlsConnect>>),
}

impl Deref for Connection<'_> {
    type Target = tokio_postgres::Client;

    fn deref(&self) -> &Self::Target {
        match self {
            Connection::Plain(c) => c,
            Connection::Tls(c) => c,
        }
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Connection::Plain(c) => c,
            Connection::Tls(c) => c,
        }
    }
}

/// The shared pool plus the per-call timeouts applied to every caller.
#[derive(Clone)]
pub struct Db {
    pool: std::sync::Arc<DbPool>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Db {
    pub async fn connect(
        database_url: &str,
        max_sessions: u32,
        max_idle_time: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self> {
        let pool = if wants_tls(database_url) {
            let manager = PostgresConnectionManager::new_from_stringlike(database_url, make_rustls_connect()?)
                .map_err(|e| Error::Internal(format!("invalid DATABASE_URL: {e}")))?;
            let pool = Pool::builder()
                .max_size(max_sessions)
                .idle_timeout(Some(max_idle_time))
                .build(manager)
                .await
                .map_err(|e| Error::Internal(format!("failed to build connection pool: {e}")))?;
            DbPool::Tls(pool)
        } else {
            let manager = PostgresConnectionManager::new_from_stringlike(database_url, NoTls)
                .map_err(|e| Error::Internal(format!("invalid DATABASE_URL: {e}")))?;
            let pool = Pool::builder()
                .max_size(max_sessions)
                .idle_timeout(Some(max_idle_time))
                .build(manager)
                .await
                .map_err(|e| Error::Internal(format!("failed to build connection pool: {e}")))?;
            DbPool::Plain(pool)
        };
        Ok(Self { pool: std::sync::Arc::new(pool), read_timeout, write_timeout })
    }

    /// Checks a connection out of the pool, bounded by the read timeout.
    /// Used by `check`/`update`-path queries (`latest_newer`,
    /// `get_by_version`, cache lookups).
    pub async fn acquire_read(&self) -> Result<Connection<'_>> {
        match self.pool.as_ref() {
            DbPool::Plain(p) => Ok(Connection::Plain(tokio::time::timeout(self.read_timeout, p.get()).await??)),
            DbPool::Tls(p) => Ok(Connection::Tls(tokio::time::timeout(self.read_timeout, p.get()).await??)),
        }
    }

    /// Checks a connection out of the pool, bounded by the write timeout.
    /// Used by `add`/retention and cache-materialization writes.
    pub async fn acquire_write(&self) -> Result<Connection<'_>> {
        match self.pool.as_ref() {
            DbPool::Plain(p) => Ok(Connection::Plain(tokio::time::timeout(self.write_timeout, p.get()).await??)),
            DbPool::Tls(p) => Ok(Connection::Tls(tokio::time::timeout(self.write_timeout, p.get()).await??)),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }
}

fn wants_tls(database_url: &str) -> bool {
    database_url.split(['?', '&']).any(|part| match part.strip_prefix("sslmode=") {
        Some("" | "disable") => false,
        Some(_) => true,
        None => false,
    })
}

fn make_rustls_connect() -> Result<MakeRustlsConnect> {
    CRYPTO_PROVIDER.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = root_store.add(cert);
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(MakeRustlsConnect::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wants_tls_detects_non_disable_sslmode() {
        assert!(wants_tls("postgres://host/db?sslmode=require"));
        assert!(wants_tls("postgres://host/db?sslmode=verify-full"));
        assert!(!wants_tls("postgres://host/db?sslmode=disable"));
        assert!(!wants_tls("postgres://host/db"));
    }
}
