//! Directory scanner: walks watched roots and produces idempotent Asset
//! records keyed by deterministic IDs. A directory scanned twice without
//! filesystem changes reports every file as unchanged and writes nothing.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::ids;
use crate::model::{Asset, AssetStatus};
use crate::store::Store;

/// Aggregate result of one scan pass.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ScanCounters {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ScanCounters {
    pub fn merge(&mut self, other: &ScanCounters) {
        self.new += other.new;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }

    pub fn total_processed(&self) -> usize {
        self.new + self.updated + self.unchanged
    }
}

struct FileMeta {
    path: PathBuf,
    size: u64,
    mtime_ns: i64,
}

/// Walk one root depth-first (dot-entries skipped) and upsert Asset records.
pub fn scan_path(store: &Store, root: &Path, max_file_size: u64) -> AppResult<ScanCounters> {
    let mut counters = ScanCounters::default();
    let mut candidates: Vec<FileMeta> = Vec::new();

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(true)
        .follow_links(false)
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "walk error");
                counters.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "stat failed");
                counters.errors += 1;
                continue;
            }
        };
        let size = metadata.len();
        if size == 0 || size > max_file_size {
            counters.skipped += 1;
            continue;
        }
        let mtime_ns = mtime_nanos(&metadata);
        candidates.push(FileMeta {
            path: entry.into_path(),
            size,
            mtime_ns,
        });
    }

    // Fast path first: files whose stored (mtime, size) still match need no
    // read at all. The rest get a streaming content hash, in parallel.
    let mut to_hash: Vec<(FileMeta, Option<Asset>)> = Vec::new();
    for meta in candidates {
        let abs = meta.path.to_string_lossy().to_string();
        match store.get_asset_by_path(&abs)? {
            Some(existing)
                if existing.mtime_ns == meta.mtime_ns && existing.size_bytes == meta.size =>
            {
                counters.unchanged += 1;
            }
            existing => to_hash.push((meta, existing)),
        }
    }

    let hashed: Vec<(FileMeta, Option<Asset>, std::io::Result<String>)> = to_hash
        .into_par_iter()
        .map(|(meta, existing)| {
            let hash = streaming_sha256(&meta.path);
            (meta, existing, hash)
        })
        .collect();

    for (meta, existing, hash) in hashed {
        let content_hash = match hash {
            Ok(h) => h,
            Err(e) => {
                warn!(path = %meta.path.display(), error = %e, "hash failed");
                counters.errors += 1;
                continue;
            }
        };

        // touch-without-modify: mtime moved but the bytes did not. The
        // stored record (including its mtime) is left alone.
        if let Some(ref prior) = existing {
            if prior.content_hash == content_hash {
                counters.unchanged += 1;
                continue;
            }
        }

        let abs = meta.path.to_string_lossy().to_string();
        let filename = meta
            .path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| abs.clone());
        let now = Utc::now();
        let asset = Asset {
            id: ids::asset_id(&abs, meta.mtime_ns, meta.size),
            path: abs,
            filename: filename.clone(),
            size_bytes: meta.size,
            mtime_ns: meta.mtime_ns,
            content_hash,
            mime_type: guess_mime(&meta.path).to_string(),
            scan_version: existing.as_ref().map(|a| a.scan_version + 1).unwrap_or(1),
            status: AssetStatus::Pending,
            last_error: None,
            created_at: existing.as_ref().map(|a| a.created_at).unwrap_or(now),
            updated_at: now,
        };

        if let Err(e) = store.upsert_asset(&asset) {
            warn!(path = %asset.path, error = %e, "asset upsert failed");
            counters.errors += 1;
            continue;
        }
        if existing.is_some() {
            debug!(path = %asset.path, "asset updated");
            counters.updated += 1;
        } else {
            debug!(path = %asset.path, "asset discovered");
            counters.new += 1;
        }
    }

    info!(
        root = %root.display(),
        new = counters.new,
        updated = counters.updated,
        unchanged = counters.unchanged,
        skipped = counters.skipped,
        errors = counters.errors,
        "scan complete"
    );
    Ok(counters)
}

fn mtime_nanos(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// SHA-256 of the file contents, streamed in 64 KiB reads so large files
/// never land in memory whole.
fn streaming_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extension-based MIME guess; the extractor registry makes the real call.
pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "rtf" => "text/rtf",
        "pdf" => "application/pdf",
        "epub" => "application/epub+zip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" | "heif" => "image/heic",
        "tiff" | "tif" => "image/tiff",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" | "tgz" => "application/gzip",
        "dcm" | "dicom" => "application/dicom",
        "json" => "application/json",
        "xml" => "application/xml",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn fresh_scan_discovers_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");
        write(dir.path(), "b.md", "# beta");
        let store = Store::open_in_memory().unwrap();

        let counters = scan_path(&store, dir.path(), 1024).unwrap();
        assert_eq!(counters.new, 2);
        assert_eq!(counters.unchanged, 0);
        assert_eq!(
            store
                .list_assets_by_status(AssetStatus::Pending)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn rescan_without_changes_is_all_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");
        let store = Store::open_in_memory().unwrap();

        scan_path(&store, dir.path(), 1024).unwrap();
        let second = scan_path(&store, dir.path(), 1024).unwrap();
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.new + second.updated + second.errors, 0);
    }

    #[test]
    fn touch_without_modify_is_unchanged_and_keeps_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.txt", "alpha");
        let store = Store::open_in_memory().unwrap();
        scan_path(&store, dir.path(), 1024).unwrap();
        let before = store
            .get_asset_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();

        // Rewrite identical bytes: mtime moves, content hash does not.
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&path, "alpha").unwrap();
        let counters = scan_path(&store, dir.path(), 1024).unwrap();
        assert_eq!(counters.unchanged, 1);
        assert_eq!(counters.updated, 0);

        let after = store
            .get_asset_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(after.mtime_ns, before.mtime_ns);
        assert_eq!(after.id, before.id);
    }

    #[test]
    fn modified_file_is_updated_with_new_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.txt", "alpha");
        let store = Store::open_in_memory().unwrap();
        scan_path(&store, dir.path(), 1024).unwrap();
        let before = store
            .get_asset_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&path, "alpha and more").unwrap();
        let counters = scan_path(&store, dir.path(), 1024).unwrap();
        assert_eq!(counters.updated, 1);

        let after = store
            .get_asset_by_path(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_ne!(after.id, before.id);
        assert_eq!(after.scan_version, 2);
        assert_eq!(after.status, AssetStatus::Pending);
    }

    #[test]
    fn zero_byte_oversize_and_hidden_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "empty.txt", "");
        write(dir.path(), "big.txt", "0123456789");
        write(dir.path(), ".hidden.txt", "secret");
        let store = Store::open_in_memory().unwrap();

        let counters = scan_path(&store, dir.path(), 5).unwrap();
        // empty + oversize counted as skipped; the dot-file never enters the walk
        assert_eq!(counters.skipped, 2);
        assert_eq!(counters.new, 0);
    }
}
