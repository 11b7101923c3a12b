//! The diff cache: single-flight coordination plus a persistent
//! (channel, from, to) -> archive mapping, so the same diff is computed at
//! most once per process even under concurrent load (§4.5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::admission::AdmissionController;
use crate::archive;
use crate::blob;
use crate::catalog::{Catalog, Version};
use crate::db::Db;
use crate::diff::{self, DiffEntry};
use crate::error::{Error, Result};

type CacheKey = (String, Version, Version);

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a cache row remembers about its target version, enough to answer a
/// hit without the catalog: the version identity the client needs in its
/// response headers, plus the diff that produced the archive bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub to_version: Version,
    pub build_time: DateTime<Utc>,
    pub info: String,
    pub entries: Vec<DiffEntry>,
}

/// The persistence side of the diff cache: the `cache`/`blobs` round-trips
/// and archive assembly that `DiffCache` needs, behind a trait so tests can
/// substitute an in-memory store instead of a live Postgres connection.
/// `PostgresCacheStore` is the production implementation.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Looks up a persisted archive for an exact `(from_id, to_id)` pair;
    /// `from_id` of `None` means "full archive for `to_id`".
    async fn lookup(&self, from_id: Option<i64>, to_id: i64) -> Result<Option<(CacheMetadata, Vec<u8>)>>;

    /// Persists a computed archive under `(from_id, to_id)`.
    async fn persist(
        &self,
        from_id: Option<i64>,
        to_id: i64,
        metadata: &CacheMetadata,
        archive_bytes: &[u8],
    ) -> Result<()>;

    /// Assembles the ZIP archive for `entries`, reading changed files out of
    /// whatever blob store backs this implementation.
    async fn build_archive(&self, entries: &[DiffEntry]) -> Result<Vec<u8>>;
}

/// The production `CacheStore`: the `cache` table plus the shared blob store,
/// both reached through `Db`.
pub struct PostgresCacheStore {
    db: Db,
}

impl PostgresCacheStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CacheStore for PostgresCacheStore {
    async fn lookup(&self, from_id: Option<i64>, to_id: i64) -> Result<Option<(CacheMetadata, Vec<u8>)>> {
        let row = {
            let conn = self.db.acquire_read().await?;
            match from_id {
                Some(from_id) => {
                    conn.query_opt(
                        "SELECT diff_oid, diff_info FROM cache WHERE id_update_from = $1 AND id_update_to = $2",
                        &[&from_id, &to_id],
                    )
                    .await?
                }
                None => {
                    conn.query_opt(
                        "SELECT diff_oid, diff_info FROM cache WHERE id_update_from IS NULL AND id_update_to = $1",
                        &[&to_id],
                    )
                    .await?
                }
            }
        };

        let Some(row) = row else { return Ok(None) };
        let diff_oid: i64 = row.get(0);
        let diff_info: serde_json::Value = row.get(1);
        let metadata: CacheMetadata = match serde_json::from_value(diff_info) {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };

        let mut conn = self.db.acquire_read().await?;
        let tx = conn.transaction().await?;
        let bytes = blob::get(&tx, diff_oid).await?;
        tx.commit().await?;

        Ok(Some((metadata, bytes)))
    }

    async fn persist(
        &self,
        from_id: Option<i64>,
        to_id: i64,
        metadata: &CacheMetadata,
        archive_bytes: &[u8],
    ) -> Result<()> {
        let mut conn = self.db.acquire_write().await?;
        let tx = conn.transaction().await?;

        let blob_id = blob::put(&tx, archive_bytes).await?;
        let diff_info = serde_json::to_value(metadata)
            .map_err(|e| Error::Internal(format!("failed to serialize cache metadata: {e}")))?;

        // Two distinct unique indexes back this table (see catalog::postgres
        // CREATE_TABLE_SQL) — a full-row one for `from_id` present, a partial
        // one for `from_id IS NULL` — so the conflict target differs by case.
        match from_id {
            Some(from_id) => {
                tx.execute(
                    "INSERT INTO cache (id_update_from, id_update_to, diff_oid, diff_info)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (id_update_from, id_update_to) DO UPDATE
                     SET diff_oid = EXCLUDED.diff_oid, diff_info = EXCLUDED.diff_info",
                    &[&from_id, &to_id, &blob_id, &diff_info],
                )
                .await?;
            }
            None => {
                tx.execute(
                    "INSERT INTO cache (id_update_from, id_update_to, diff_oid, diff_info)
                     VALUES (NULL, $1, $2, $3)
                     ON CONFLICT (id_update_to) WHERE id_update_from IS NULL DO UPDATE
                     SET diff_oid = EXCLUDED.diff_oid, diff_info = EXCLUDED.diff_info",
                    &[&to_id, &blob_id, &diff_info],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn build_archive(&self, entries: &[DiffEntry]) -> Result<Vec<u8>> {
        let mut conn = self.db.acquire_read().await?;
        let tx = conn.transaction().await?;
        let bytes = archive::build(&tx, entries).await?;
        tx.commit().await?;
        Ok(bytes)
    }
}

pub struct DiffCache {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn CacheStore>,
    admission: AdmissionController,
    in_flight: DashMap<CacheKey, u32>,
}

impl DiffCache {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<dyn CacheStore>, admission: AdmissionController) -> Self {
        Self { catalog, store, admission, in_flight: DashMap::new() }
    }

    /// Resolves `(channel, from_version, to_version)` to an archive, computing
    /// and persisting it on a miss. Returns `Ok(None)` only when `to_version`
    /// itself does not exist in the catalog — every other failure is an
    /// `Err`.
    pub async fn get(
        &self,
        channel: &str,
        from_version: Version,
        to_version: Version,
        deadline: Instant,
    ) -> Result<Option<(CacheMetadata, Vec<u8>)>> {
        self.admission.admit().await?;

        let key: CacheKey = (channel.to_string(), from_version, to_version);

        self.wait_in_flight(&key, deadline).await?;

        if let Some(hit) = self.lookup(channel, from_version, to_version).await? {
            return Ok(Some(hit));
        }

        let _guard = InFlightGuard::enter(&self.in_flight, key);

        let from_record = self.catalog.get_by_version(channel, from_version).await?;
        let Some(to_record) = self.catalog.get_by_version(channel, to_version).await? else {
            return Ok(None);
        };

        let (entries, from_id) = match &from_record {
            Some(from) => (diff::diff(&from.files, &to_record.files), Some(from.id)),
            None => (diff::full(&to_record.files), None),
        };

        let archive_bytes = self.store.build_archive(&entries).await?;

        let metadata = CacheMetadata {
            to_version: to_record.version,
            build_time: to_record.build_time,
            info: to_record.info.clone(),
            entries,
        };

        if let Err(e) = self.store.persist(from_id, to_record.id, &metadata, &archive_bytes).await {
            tracing::warn!(error = %e, channel, %from_version, %to_version, "failed to persist diff cache entry");
        }

        Ok(Some((metadata, archive_bytes)))
    }

    async fn wait_in_flight(&self, key: &CacheKey, deadline: Instant) -> Result<()> {
        loop {
            let busy = self.in_flight.get(key).map(|count| *count > 0).unwrap_or(false);
            if !busy {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeadlineExceeded);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Steps 4-5 of §4.5 combined: a direct hit requires `from_version` to
    /// resolve to a real id; otherwise only a `from_id IS NULL` row for the
    /// same target counts.
    async fn lookup(
        &self,
        channel: &str,
        from_version: Version,
        to_version: Version,
    ) -> Result<Option<(CacheMetadata, Vec<u8>)>> {
        let from_id = self.catalog.resolve_id(channel, from_version).await?;
        let Some(to_id) = self.catalog.resolve_id(channel, to_version).await? else {
            return Ok(None);
        };

        self.store.lookup(from_id, to_id).await
    }
}

struct InFlightGuard<'a> {
    map: &'a DashMap<CacheKey, u32>,
    key: CacheKey,
}

impl<'a> InFlightGuard<'a> {
    fn enter(map: &'a DashMap<CacheKey, u32>, key: CacheKey) -> Self {
        *map.entry(key.clone()).or_insert(0) += 1;
        Self { map, key }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut count) = self.map.get_mut(&self.key) {
            if *count <= 1 {
                remove = true;
            } else {
                *count -= 1;
            }
        }
        if remove {
            self.map.remove(&self.key);
        }
    }
}

/// An in-memory `CacheStore`, enough to drive `DiffCache::get` in tests
/// without a database. `lookup`/`persist` share a map keyed by
/// `(from_id, to_id)`; `build_archive` concatenates each entry's bytes out of
/// a preloaded blob map instead of producing a real ZIP — tests only care
/// that it ran with the right entries and that its output round-trips
/// through `persist`/`lookup`.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryCacheStore {
        rows: Mutex<HashMap<(Option<i64>, i64), (CacheMetadata, Vec<u8>)>>,
        blobs: Mutex<HashMap<i64, Vec<u8>>>,
        build_archive_calls: AtomicU32,
    }

    impl InMemoryCacheStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_blob(self, blob_id: i64, data: Vec<u8>) -> Self {
            self.blobs.lock().unwrap().insert(blob_id, data);
            self
        }

        pub fn seed_row(&self, from_id: Option<i64>, to_id: i64, metadata: CacheMetadata, archive_bytes: Vec<u8>) {
            self.rows.lock().unwrap().insert((from_id, to_id), (metadata, archive_bytes));
        }

        pub fn row_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }

        pub fn build_archive_calls(&self) -> u32 {
            self.build_archive_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CacheStore for InMemoryCacheStore {
        async fn lookup(&self, from_id: Option<i64>, to_id: i64) -> Result<Option<(CacheMetadata, Vec<u8>)>> {
            Ok(self.rows.lock().unwrap().get(&(from_id, to_id)).cloned())
        }

        async fn persist(
            &self,
            from_id: Option<i64>,
            to_id: i64,
            metadata: &CacheMetadata,
            archive_bytes: &[u8],
        ) -> Result<()> {
            self.rows.lock().unwrap().insert((from_id, to_id), (metadata.clone(), archive_bytes.to_vec()));
            Ok(())
        }

        async fn build_archive(&self, entries: &[DiffEntry]) -> Result<Vec<u8>> {
            self.build_archive_calls.fetch_add(1, Ordering::SeqCst);
            let blobs = self.blobs.lock().unwrap();
            let mut bytes = Vec::new();
            for entry in entries {
                if matches!(entry.status, crate::diff::FileStatus::Created | crate::diff::FileStatus::Modified) {
                    if let Some(data) = blobs.get(&entry.blob_id) {
                        bytes.extend_from_slice(data);
                    }
                }
            }
            Ok(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::FakeCatalog;
    use crate::catalog::StagedFile;
    use fake::InMemoryCacheStore;

    fn generous_admission() -> AdmissionController {
        AdmissionController::new(1_000.0, 1_000)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    async fn seed_two_versions(catalog: &FakeCatalog) -> (i64, i64) {
        let from_id = catalog
            .insert_version(
                "stable",
                Version::new(1, 0, 0, 0),
                Utc::now(),
                "v1",
                true,
                vec![StagedFile { name: "a.txt".into(), data: b"A".to_vec() }],
            )
            .await
            .unwrap();
        let to_id = catalog
            .insert_version(
                "stable",
                Version::new(1, 1, 0, 0),
                Utc::now(),
                "v2",
                true,
                vec![
                    StagedFile { name: "a.txt".into(), data: b"A2".to_vec() },
                    StagedFile { name: "b.txt".into(), data: b"B".to_vec() },
                ],
            )
            .await
            .unwrap();
        (from_id, to_id)
    }

    #[tokio::test]
    async fn get_returns_persisted_entry_without_recomputing() {
        let catalog = Arc::new(FakeCatalog::new());
        let (from_id, to_id) = seed_two_versions(&catalog).await;

        let store = Arc::new(InMemoryCacheStore::new());
        let metadata = CacheMetadata {
            to_version: Version::new(1, 1, 0, 0),
            build_time: Utc::now(),
            info: "v2".into(),
            entries: vec![],
        };
        store.seed_row(Some(from_id), to_id, metadata, b"cached-bytes".to_vec());

        let cache = DiffCache::new(catalog.clone(), store.clone(), generous_admission());
        let (metadata, bytes) = cache
            .get("stable", Version::new(1, 0, 0, 0), Version::new(1, 1, 0, 0), far_deadline())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(bytes, b"cached-bytes");
        assert_eq!(metadata.to_version, Version::new(1, 1, 0, 0));
        assert_eq!(store.build_archive_calls(), 0);
    }

    #[tokio::test]
    async fn get_falls_back_to_full_archive_on_cache_and_catalog_miss() {
        let catalog = Arc::new(FakeCatalog::new());
        let (_from_id, to_id) = seed_two_versions(&catalog).await;

        let store = Arc::new(
            InMemoryCacheStore::new()
                .with_blob(to_id * 1000, b"A2".to_vec())
                .with_blob(to_id * 1000 + 1, b"B".to_vec()),
        );

        let cache = DiffCache::new(catalog, store.clone(), generous_admission());
        // 0.1.0.0 was never inserted, so `from_record` resolves to None and
        // the cache must fall back to a full archive of the target version.
        let (metadata, bytes) = cache
            .get("stable", Version::new(0, 1, 0, 0), Version::new(1, 1, 0, 0), far_deadline())
            .await
            .unwrap()
            .unwrap();

        assert!(metadata.entries.iter().all(|e| e.status == crate::diff::FileStatus::Created));
        assert_eq!(metadata.entries.len(), 2);
        assert!(!bytes.is_empty());
        assert_eq!(store.build_archive_calls(), 1);
        assert_eq!(store.row_count(), 1);
    }

    #[tokio::test]
    async fn get_returns_none_when_to_version_unknown() {
        let catalog = Arc::new(FakeCatalog::new());
        seed_two_versions(&catalog).await;

        let store = Arc::new(InMemoryCacheStore::new());
        let cache = DiffCache::new(catalog, store, generous_admission());

        let result = cache
            .get("stable", Version::new(1, 0, 0, 0), Version::new(9, 9, 9, 9), far_deadline())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn get_times_out_waiting_on_an_in_flight_key() {
        let catalog = Arc::new(FakeCatalog::new());
        seed_two_versions(&catalog).await;

        let store = Arc::new(InMemoryCacheStore::new());
        let cache = DiffCache::new(catalog, store, generous_admission());

        let key: CacheKey = ("stable".to_string(), Version::new(1, 0, 0, 0), Version::new(1, 1, 0, 0));
        cache.in_flight.insert(key, 1);

        let deadline = Instant::now() + Duration::from_millis(50);
        let result = cache.get("stable", Version::new(1, 0, 0, 0), Version::new(1, 1, 0, 0), deadline).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }

    #[test]
    fn in_flight_guard_removes_key_at_zero() {
        let map: DashMap<CacheKey, u32> = DashMap::new();
        let key: CacheKey = ("stable".to_string(), Version::new(1, 0, 0, 0), Version::new(1, 1, 0, 0));
        {
            let _g1 = InFlightGuard::enter(&map, key.clone());
            assert_eq!(*map.get(&key).unwrap(), 1);
            {
                let _g2 = InFlightGuard::enter(&map, key.clone());
                assert_eq!(*map.get(&key).unwrap(), 2);
            }
            assert_eq!(*map.get(&key).unwrap(), 1);
        }
        assert!(map.get(&key).is_none());
    }
}
