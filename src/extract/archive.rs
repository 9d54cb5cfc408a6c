//! Archive extractor: ZIP, TAR, and TAR.GZ with bomb guards.
//!
//! Security ceilings: entry count, total uncompressed bytes, per-entry
//! bytes, and nesting depth. Entries whose cleaned path is absolute or
//! escapes the archive root are rejected (zip-slip). A breached ceiling
//! abandons the rest of the archive but keeps the atoms produced before the
//! cap.

use std::fs::File;
use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{AppError, AppResult};
use crate::model::{Asset, ContentAtom, EvidenceAnchor};

use super::{text_atom, Extraction, Extractor};

const MAX_ENTRIES: usize = 10_000;
const MAX_TOTAL_BYTES: u64 = 500 * 1024 * 1024;
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const MAX_DEPTH: usize = 3;

/// Extensions read as text from inside archives: source code, markup, and
/// plain text.
const TEXT_LIKE: [&str; 30] = [
    "txt", "md", "markdown", "rst", "html", "htm", "xml", "json", "yaml", "yml", "toml", "csv",
    "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "rb", "php", "swift", "kt", "sh", "sql",
    "ini", "cfg", "log",
];

pub struct ArchiveExtractor;

impl Extractor for ArchiveExtractor {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn can_handle(&self, asset: &Asset) -> bool {
        matches!(archive_kind(&asset.path), Some(_))
    }

    fn extract(&self, asset: &Asset) -> AppResult<Extraction> {
        let kind = archive_kind(&asset.path)
            .ok_or_else(|| AppError::Extract(format!("{} is not an archive", asset.path)))?;
        let mut bytes = Vec::new();
        File::open(&asset.path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| AppError::Extract(format!("read {}: {}", asset.path, e)))?;

        let mut walk = Walk {
            asset,
            atoms: Vec::new(),
            seq: 0,
            entries: 0,
            total_bytes: 0,
        };
        let violation = walk.descend(kind, bytes, &[], 1).err();
        if let Some(ref v) = violation {
            warn!(asset = %asset.path, violation = %v, "archive abandoned");
        }
        Ok(Extraction {
            atoms: walk.atoms,
            violation,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

fn archive_kind(path: &str) -> Option<ArchiveKind> {
    let lower = path.to_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if lower.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else if lower.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else {
        None
    }
}

struct Walk<'a> {
    asset: &'a Asset,
    atoms: Vec<ContentAtom>,
    seq: i64,
    entries: usize,
    total_bytes: u64,
}

impl Walk<'_> {
    /// Recurse into one archive payload. `chain` names the enclosing
    /// archive entries; `depth` counts archives, outermost = 1.
    fn descend(
        &mut self,
        kind: ArchiveKind,
        bytes: Vec<u8>,
        chain: &[String],
        depth: usize,
    ) -> Result<(), String> {
        if depth > MAX_DEPTH {
            return Err(format!("archive nesting exceeds depth {}", MAX_DEPTH));
        }
        match kind {
            ArchiveKind::Zip => self.walk_zip(bytes, chain, depth),
            ArchiveKind::Tar => self.walk_tar(Box::new(Cursor::new(bytes)), chain, depth),
            ArchiveKind::TarGz => {
                let decoder = GzDecoder::new(Cursor::new(bytes));
                self.walk_tar(Box::new(decoder), chain, depth)
            }
        }
    }

    fn walk_zip(&mut self, bytes: Vec<u8>, chain: &[String], depth: usize) -> Result<(), String> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| format!("corrupt zip: {}", e))?;
        for index in 0..archive.len() {
            self.entries += 1;
            if self.entries > MAX_ENTRIES {
                return Err(format!("entry count exceeds {}", MAX_ENTRIES));
            }
            let mut entry = match archive.by_index(index) {
                Ok(e) => e,
                Err(e) => {
                    debug!(index, error = %e, "unreadable zip entry");
                    continue;
                }
            };
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let Some(clean) = clean_entry_path(&name) else {
                debug!(entry = %name, "rejecting escaping entry path");
                continue;
            };

            let size = entry.size();
            self.charge(size)?;

            if let Some(inner_kind) = archive_kind(&clean) {
                let mut inner = Vec::new();
                if entry.read_to_end(&mut inner).is_err() {
                    continue;
                }
                let mut inner_chain = chain.to_vec();
                inner_chain.push(clean);
                self.descend(inner_kind, inner, &inner_chain, depth + 1)?;
                continue;
            }

            if !is_text_like(&clean) {
                continue;
            }
            let mut contents = Vec::new();
            if entry.read_to_end(&mut contents).is_err() {
                continue;
            }
            self.emit_text(&clean, &contents, chain);
        }
        Ok(())
    }

    fn walk_tar(
        &mut self,
        reader: Box<dyn Read + '_>,
        chain: &[String],
        depth: usize,
    ) -> Result<(), String> {
        let mut archive = tar::Archive::new(reader);
        let entries = archive
            .entries()
            .map_err(|e| format!("corrupt tar: {}", e))?;
        for entry in entries {
            self.entries += 1;
            if self.entries > MAX_ENTRIES {
                return Err(format!("entry count exceeds {}", MAX_ENTRIES));
            }
            let mut entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "unreadable tar entry");
                    continue;
                }
            };
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = match entry.path() {
                Ok(p) => p.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            let Some(clean) = clean_entry_path(&name) else {
                debug!(entry = %name, "rejecting escaping entry path");
                continue;
            };

            let size = entry.header().size().unwrap_or(0);
            self.charge(size)?;

            if let Some(inner_kind) = archive_kind(&clean) {
                let mut inner = Vec::new();
                if entry.read_to_end(&mut inner).is_err() {
                    continue;
                }
                let mut inner_chain = chain.to_vec();
                inner_chain.push(clean);
                self.descend(inner_kind, inner, &inner_chain, depth + 1)?;
                continue;
            }

            if !is_text_like(&clean) {
                continue;
            }
            let mut contents = Vec::new();
            if entry.read_to_end(&mut contents).is_err() {
                continue;
            }
            self.emit_text(&clean, &contents, chain);
        }
        Ok(())
    }

    fn charge(&mut self, size: u64) -> Result<(), String> {
        if size > MAX_ENTRY_BYTES {
            return Err(format!("entry exceeds {} bytes", MAX_ENTRY_BYTES));
        }
        self.total_bytes += size;
        if self.total_bytes > MAX_TOTAL_BYTES {
            return Err(format!(
                "total uncompressed size exceeds {} bytes",
                MAX_TOTAL_BYTES
            ));
        }
        Ok(())
    }

    fn emit_text(&mut self, entry_path: &str, contents: &[u8], chain: &[String]) {
        let text = String::from_utf8_lossy(contents).trim().to_string();
        if text.is_empty() {
            return;
        }
        let mut full_chain = chain.to_vec();
        full_chain.push(entry_path.to_string());
        let mut anchor = EvidenceAnchor::for_asset(&self.asset.id);
        anchor.archive_chain = Some(full_chain);
        self.atoms.push(text_atom(self.asset, self.seq, text, anchor));
        self.seq += 1;
    }
}

/// Normalize an entry path, rejecting absolute paths and any path whose
/// cleaned form escapes the archive root.
fn clean_entry_path(raw: &str) -> Option<String> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || normalized.len() >= 2 && normalized.as_bytes()[1] == b':' {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return None;
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn is_text_like(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|ext| TEXT_LIKE.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::super::test_asset;
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_with(entries: &[(&str, &str)], path: &std::path::Path) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_text_entries_with_archive_chain_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        zip_with(
            &[
                ("docs/readme.md", "hello from inside"),
                ("binary.dat", "ignored payload"),
            ],
            &path,
        );

        let asset = test_asset(&path.to_string_lossy());
        let extraction = ArchiveExtractor.extract(&asset).unwrap();
        assert!(extraction.violation.is_none());
        assert_eq!(extraction.atoms.len(), 1);
        assert_eq!(
            extraction.atoms[0].anchor.archive_chain.as_deref(),
            Some(&["docs/readme.md".to_string()][..])
        );
    }

    #[test]
    fn zip_slip_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evil.zip");
        zip_with(
            &[
                ("../escape.txt", "nope"),
                ("ok.txt", "fine"),
            ],
            &path,
        );

        let asset = test_asset(&path.to_string_lossy());
        let extraction = ArchiveExtractor.extract(&asset).unwrap();
        assert_eq!(extraction.atoms.len(), 1);
        assert!(extraction.atoms[0].anchor.archive_chain.as_ref().unwrap()[0].contains("ok.txt"));
    }

    #[test]
    fn entry_count_bomb_keeps_partial_atoms_and_reports_violation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bomb.zip");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for i in 0..(MAX_ENTRIES + 5) {
            writer.start_file(format!("f{}.txt", i), options).unwrap();
            writer.write_all(b"x").unwrap();
        }
        writer.finish().unwrap();

        let asset = test_asset(&path.to_string_lossy());
        let extraction = ArchiveExtractor.extract(&asset).unwrap();
        assert!(extraction.violation.is_some());
        assert_eq!(extraction.atoms.len(), MAX_ENTRIES);
    }

    #[test]
    fn nested_archive_contributes_with_chained_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let inner_path = dir.path().join("inner.zip");
        zip_with(&[("note.txt", "nested text")], &inner_path);
        let inner_bytes = std::fs::read(&inner_path).unwrap();

        let outer_path = dir.path().join("outer.zip");
        let file = File::create(&outer_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer.start_file("inner.zip", options).unwrap();
        writer.write_all(&inner_bytes).unwrap();
        writer.finish().unwrap();

        let asset = test_asset(&outer_path.to_string_lossy());
        let extraction = ArchiveExtractor.extract(&asset).unwrap();
        assert_eq!(extraction.atoms.len(), 1);
        assert_eq!(
            extraction.atoms[0].anchor.archive_chain.as_deref(),
            Some(&["inner.zip".to_string(), "note.txt".to_string()][..])
        );
    }

    #[test]
    fn tar_gz_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar.gz");
        let file = File::create(&path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = b"tar text contents";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "doc.txt", &data[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let asset = test_asset(&path.to_string_lossy());
        let extraction = ArchiveExtractor.extract(&asset).unwrap();
        assert_eq!(extraction.atoms.len(), 1);
        assert_eq!(
            extraction.atoms[0].text.as_deref(),
            Some("tar text contents")
        );
    }
}
