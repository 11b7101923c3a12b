//! The catalog: versions per channel, their files, and the retention policy.

mod postgres;

pub use postgres::{PostgresCatalog, CREATE_TABLE_SQL};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Four non-negative integers compared lexicographically. Any component
/// missing from client input defaults to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    #[serde(default)]
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
    #[serde(default)]
    pub patch: u32,
    #[serde(default)]
    pub revision: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32, revision: u32) -> Self {
        Self { major, minor, patch, revision }
    }

    /// Parses a 1-4 component dotted version string (`"1.2"`, `"1.2.3.4"`).
    /// Missing trailing components default to 0.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.is_empty() || parts.len() > 4 {
            return Err(Error::InvalidArgument(format!("invalid version: {s}")));
        }
        let mut components = [0u32; 4];
        for (i, part) in parts.iter().enumerate() {
            components[i] = part
                .parse::<u32>()
                .map_err(|_| Error::InvalidArgument(format!("invalid version: {s}")))?;
        }
        Ok(Self::new(components[0], components[1], components[2], components[3]))
    }

    fn tuple(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.patch, self.revision)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.revision)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tuple().cmp(&other.tuple())
    }
}

/// A single file within a version: name, checksum, and a reference into the
/// blob store. `name` is unique within one version's file list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub checksum: String,
    #[serde(skip)]
    pub blob_id: i64,
}

/// An uploaded file's raw bytes, staged before it is persisted. Carried
/// separately from `FileEntry` because `insert_version` needs the bytes to
/// compute the checksum and populate the blob store.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// A version record as stored in the catalog, including its ordered file
/// list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: i64,
    pub channel: String,
    pub version: Version,
    pub build_time: DateTime<Utc>,
    pub record_time: DateTime<Utc>,
    pub info: String,
    pub enabled: bool,
    pub files: Vec<FileEntry>,
}

/// The catalog's contract. A Postgres-backed implementation is provided by
/// `PostgresCatalog`; tests may substitute an in-memory fake.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn insert_version(
        &self,
        channel: &str,
        version: Version,
        build_time: DateTime<Utc>,
        info: &str,
        enabled: bool,
        files: Vec<StagedFile>,
    ) -> Result<i64>;

    /// Enforces retention for `channel`; returns the versions that were
    /// deleted, for logging. Cascade-deletes their file and cache rows.
    async fn apply_retention(&self, channel: &str) -> Result<Vec<Version>>;

    async fn latest_newer(&self, channel: &str, client_version: Version) -> Result<Option<VersionRecord>>;

    async fn get_by_version(&self, channel: &str, version: Version) -> Result<Option<VersionRecord>>;

    /// Looks a record up by its catalog id, used by the diff cache to
    /// resolve a cached `from_id`/`to_id` pair back to file lists.
    async fn get_by_id(&self, id: i64) -> Result<Option<VersionRecord>>;

    /// Resolves `(channel, version)` to a catalog id without filtering on
    /// `enabled`. Used by the diff cache to match persisted cache rows
    /// against a client's declared version even after that version has been
    /// disabled (§4.5) — unlike `get_by_version`, which is the client-facing
    /// lookup and must honor `enabled`.
    async fn resolve_id(&self, channel: &str, version: Version) -> Result<Option<i64>>;
}

/// An in-memory `Catalog`, enough to drive `cache`/`service` tests without a
/// database. Ids are assigned sequentially starting at 1; a `FileEntry`'s
/// `blob_id` is derived from its version id so tests can predict it
/// (`id * 1000 + position`).
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeCatalog {
        records: Mutex<Vec<VersionRecord>>,
        next_id: Mutex<i64>,
        fail_retention: AtomicBool,
    }

    impl FakeCatalog {
        pub fn new() -> Self {
            Self { records: Mutex::new(Vec::new()), next_id: Mutex::new(1), fail_retention: AtomicBool::new(false) }
        }

        /// Makes the next `apply_retention` call return an error, to exercise
        /// the "retention failure is non-fatal" path in `service`.
        pub fn fail_next_retention(&self) {
            self.fail_retention.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Catalog for FakeCatalog {
        async fn insert_version(
            &self,
            channel: &str,
            version: Version,
            build_time: DateTime<Utc>,
            info: &str,
            enabled: bool,
            files: Vec<StagedFile>,
        ) -> Result<i64> {
            if files.is_empty() {
                return Err(Error::InvalidArgument("a version must have at least one file".into()));
            }

            let mut records = self.records.lock().unwrap();
            if records.iter().any(|r| r.channel == channel && r.version == version) {
                return Err(Error::AlreadyExists(format!("{channel} {version}")));
            }

            let id = {
                let mut next_id = self.next_id.lock().unwrap();
                let id = *next_id;
                *next_id += 1;
                id
            };

            let file_entries = files
                .into_iter()
                .enumerate()
                .map(|(i, f)| {
                    use sha2::{Digest, Sha256};
                    FileEntry { name: f.name, checksum: hex::encode(Sha256::digest(&f.data)), blob_id: id * 1000 + i as i64 }
                })
                .collect();

            records.push(VersionRecord {
                id,
                channel: channel.to_string(),
                version,
                build_time,
                record_time: Utc::now(),
                info: info.to_string(),
                enabled,
                files: file_entries,
            });
            Ok(id)
        }

        async fn apply_retention(&self, _channel: &str) -> Result<Vec<Version>> {
            if self.fail_retention.swap(false, Ordering::SeqCst) {
                return Err(Error::Internal("retention pass failed".into()));
            }
            Ok(Vec::new())
        }

        async fn latest_newer(&self, channel: &str, client_version: Version) -> Result<Option<VersionRecord>> {
            let records = self.records.lock().unwrap();
            Ok(records
                .iter()
                .filter(|r| r.channel == channel && r.enabled && r.version > client_version)
                .max_by_key(|r| r.version)
                .cloned())
        }

        async fn get_by_version(&self, channel: &str, version: Version) -> Result<Option<VersionRecord>> {
            let records = self.records.lock().unwrap();
            Ok(records.iter().find(|r| r.channel == channel && r.version == version && r.enabled).cloned())
        }

        async fn get_by_id(&self, id: i64) -> Result<Option<VersionRecord>> {
            let records = self.records.lock().unwrap();
            Ok(records.iter().find(|r| r.id == id).cloned())
        }

        async fn resolve_id(&self, channel: &str, version: Version) -> Result<Option<i64>> {
            let records = self.records.lock().unwrap();
            Ok(records.iter().find(|r| r.channel == channel && r.version == version).map(|r| r.id))
        }
    }
}
