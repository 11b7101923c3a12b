//! Builds the ZIP archive delivered to clients: the changed files plus the
//! `.update_file_info.txt` manifest.

use std::io::{Read, Seek, SeekFrom, Write};

use tokio_postgres::Transaction;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::blob;
use crate::diff::{DiffEntry, FileStatus};
use crate::error::{Error, Result};

/// Assembles the ZIP for `entries`, reading Created/Modified blob contents
/// through `tx`. Assembly happens in a scoped temporary file so a large
/// archive never has to live twice over in memory (once as blob reads, once
/// as the finished ZIP) — the file is anonymous and removed by the OS as
/// soon as it is closed, on every exit path including panics.
pub async fn build(tx: &Transaction<'_>, entries: &[DiffEntry]) -> Result<Vec<u8>> {
    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        if matches!(entry.status, FileStatus::Created | FileStatus::Modified) {
            let data = blob::get(tx, entry.blob_id).await?;
            files.push((entry.name.clone(), data));
        }
    }
    let manifest = manifest_text(entries);

    tokio::task::spawn_blocking(move || build_zip(files, manifest))
        .await
        .map_err(|e| Error::Internal(format!("archive task panicked: {e}")))?
}

fn build_zip(files: Vec<(String, Vec<u8>)>, manifest: Vec<u8>) -> Result<Vec<u8>> {
    let scratch = tempfile::tempfile()?;
    let mut zip = ZipWriter::new(scratch);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, data) in files {
        zip.start_file(name, options)?;
        zip.write_all(&data)?;
    }

    zip.start_file(".update_file_info.txt", options)?;
    zip.write_all(&manifest)?;

    let mut scratch = zip.finish()?;
    scratch.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    scratch.read_to_end(&mut buf)?;
    Ok(buf)
}

/// One line per entry in input order: `<mark> <name>\n`.
fn manifest_text(entries: &[DiffEntry]) -> Vec<u8> {
    let mut out = String::new();
    for entry in entries {
        out.push(entry.status.mark());
        out.push(' ');
        out.push_str(&entry.name);
        out.push('\n');
    }
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_uses_mark_per_status_in_input_order() {
        let entries = vec![
            DiffEntry { name: "a.txt".into(), checksum: "x".into(), blob_id: 1, status: FileStatus::Modified },
            DiffEntry { name: "b.txt".into(), checksum: "y".into(), blob_id: 2, status: FileStatus::Created },
            DiffEntry { name: "c.txt".into(), checksum: "z".into(), blob_id: 0, status: FileStatus::Removed },
        ];
        let text = String::from_utf8(manifest_text(&entries)).unwrap();
        assert_eq!(text, "* a.txt\n+ b.txt\n- c.txt\n");
    }

    #[test]
    fn zip_contains_changed_members_and_manifest() {
        let files = vec![("a.txt".to_string(), b"A2".to_vec()), ("c.txt".to_string(), b"C".to_vec())];
        let entries = vec![
            DiffEntry { name: "a.txt".into(), checksum: "A2".into(), blob_id: 1, status: FileStatus::Modified },
            DiffEntry { name: "c.txt".into(), checksum: "C".into(), blob_id: 2, status: FileStatus::Created },
            DiffEntry { name: "b.txt".into(), checksum: "B".into(), blob_id: 0, status: FileStatus::Removed },
        ];
        let manifest = manifest_text(&entries);
        let bytes = build_zip(files, manifest).unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec![".update_file_info.txt", "a.txt", "c.txt"]);

        let mut manifest_file = archive.by_name(".update_file_info.txt").unwrap();
        let mut content = String::new();
        manifest_file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "* a.txt\n+ c.txt\n- b.txt\n");
    }

    #[test]
    fn determinism_two_builds_produce_identical_manifest() {
        let entries = vec![
            DiffEntry { name: "a.txt".into(), checksum: "A".into(), blob_id: 1, status: FileStatus::Created },
        ];
        let m1 = manifest_text(&entries);
        let m2 = manifest_text(&entries);
        assert_eq!(m1, m2);
    }
}
