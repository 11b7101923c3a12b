//! Pure diff computation between two file lists. No I/O, no async: this is
//! the deterministic core that makes archive bytes reproducible regardless
//! of which peer computed them (§5 ordering guarantee).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::FileEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Created,
    Modified,
    Removed,
}

impl FileStatus {
    /// The single-character mark used in `.update_file_info.txt`.
    pub fn mark(self) -> char {
        match self {
            FileStatus::Created => '+',
            FileStatus::Modified => '*',
            FileStatus::Removed => '-',
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEntry {
    pub name: String,
    pub checksum: String,
    #[serde(skip)]
    pub blob_id: i64,
    pub status: FileStatus,
}

/// Computes the file-level diff from `from` to `to`, ordered by name
/// ascending so that two independent computations over the same inputs
/// produce byte-identical output.
pub fn diff(from: &[FileEntry], to: &[FileEntry]) -> Vec<DiffEntry> {
    let from_by_name: BTreeMap<&str, &FileEntry> =
        from.iter().map(|f| (f.name.as_str(), f)).collect();
    let to_by_name: BTreeMap<&str, &FileEntry> = to.iter().map(|f| (f.name.as_str(), f)).collect();

    let mut entries = Vec::new();

    for (name, to_entry) in &to_by_name {
        match from_by_name.get(name) {
            None => entries.push(DiffEntry {
                name: to_entry.name.clone(),
                checksum: to_entry.checksum.clone(),
                blob_id: to_entry.blob_id,
                status: FileStatus::Created,
            }),
            Some(from_entry) if from_entry.checksum != to_entry.checksum => {
                entries.push(DiffEntry {
                    name: to_entry.name.clone(),
                    checksum: to_entry.checksum.clone(),
                    blob_id: to_entry.blob_id,
                    status: FileStatus::Modified,
                })
            }
            Some(_) => {}
        }
        let _ = name;
    }

    for (name, from_entry) in &from_by_name {
        if !to_by_name.contains_key(name) {
            entries.push(DiffEntry {
                name: from_entry.name.clone(),
                checksum: from_entry.checksum.clone(),
                blob_id: 0,
                status: FileStatus::Removed,
            });
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Treats every file in `to` as newly created — used when the client's
/// current version has no catalog record and a full archive is served
/// instead of a diff.
pub fn full(to: &[FileEntry]) -> Vec<DiffEntry> {
    let mut entries: Vec<DiffEntry> = to
        .iter()
        .map(|f| DiffEntry {
            name: f.name.clone(),
            checksum: f.checksum.clone(),
            blob_id: f.blob_id,
            status: FileStatus::Created,
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}
