//! EPUB extractor: resolves the OCF container to the OPF package document,
//! then emits one text atom per spine item in reading order. The spine item
//! id is carried as the chapter coordinate of the evidence anchor.

use std::fs::File;
use std::io::Read;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;
use zip::ZipArchive;

use crate::error::{AppError, AppResult};
use crate::model::{Asset, EvidenceAnchor};

use super::text::strip_html;
use super::{asset_extension, text_atom, Extraction, Extractor};

pub struct EpubExtractor;

impl Extractor for EpubExtractor {
    fn name(&self) -> &'static str {
        "epub"
    }

    fn priority(&self) -> i32 {
        18
    }

    fn can_handle(&self, asset: &Asset) -> bool {
        asset_extension(asset) == "epub"
    }

    fn extract(&self, asset: &Asset) -> AppResult<Extraction> {
        let file = File::open(&asset.path)
            .map_err(|e| AppError::Extract(format!("open {}: {}", asset.path, e)))?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| AppError::Extract(format!("not a zip container: {}", e)))?;

        let container = read_entry(&mut archive, "META-INF/container.xml")?;
        let opf_path = parse_container(&container)
            .ok_or_else(|| AppError::Extract("container.xml names no rootfile".to_string()))?;

        let opf = read_entry(&mut archive, &opf_path)?;
        let package = parse_opf(&opf);
        let opf_dir = match opf_path.rfind('/') {
            Some(idx) => &opf_path[..idx],
            None => "",
        };

        let mut atoms = Vec::new();
        let mut seq = 0i64;
        for idref in &package.spine {
            let Some(href) = package.manifest.get(idref) else {
                debug!(idref, "spine item missing from manifest");
                continue;
            };
            let entry_path = join_entry_path(opf_dir, href);
            let html = match read_entry(&mut archive, &entry_path) {
                Ok(html) => html,
                Err(e) => {
                    debug!(entry = %entry_path, error = %e, "spine entry unreadable");
                    continue;
                }
            };
            let text = strip_html(&html).trim().to_string();
            if text.is_empty() {
                continue;
            }
            let mut anchor = EvidenceAnchor::for_asset(&asset.id);
            anchor.chapter = Some(idref.clone());
            atoms.push(text_atom(asset, seq, text, anchor));
            seq += 1;
        }
        Ok(Extraction::complete(atoms))
    }
}

#[derive(Debug, Default)]
struct Package {
    /// manifest item id → href
    manifest: std::collections::HashMap<String, String>,
    /// spine itemref idrefs, in reading order
    spine: Vec<String>,
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> AppResult<String> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| AppError::Extract(format!("missing entry {}: {}", name, e)))?;
    let mut contents = String::new();
    entry
        .read_to_string(&mut contents)
        .map_err(|e| AppError::Extract(format!("read entry {}: {}", name, e)))?;
    Ok(contents)
}

/// Pull the `full-path` of the first rootfile out of container.xml.
fn parse_container(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.name().local_name().as_ref() == b"rootfile" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"full-path" {
                        return Some(String::from_utf8_lossy(&attr.value).into_owned());
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Collect the manifest id→href map and the spine order from the OPF.
fn parse_opf(xml: &str) -> Package {
    let mut package = Package::default();
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                match e.name().local_name().as_ref() {
                    b"item" => {
                        let mut id = None;
                        let mut href = None;
                        for attr in e.attributes().flatten() {
                            match attr.key.local_name().as_ref() {
                                b"id" => id = Some(String::from_utf8_lossy(&attr.value).into_owned()),
                                b"href" => {
                                    href = Some(String::from_utf8_lossy(&attr.value).into_owned())
                                }
                                _ => {}
                            }
                        }
                        if let (Some(id), Some(href)) = (id, href) {
                            package.manifest.insert(id, href);
                        }
                    }
                    b"itemref" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"idref" {
                                package
                                    .spine
                                    .push(String::from_utf8_lossy(&attr.value).into_owned());
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    package
}

/// Join an href onto the OPF directory, resolving `..` segments within the
/// archive.
fn join_entry_path(dir: &str, href: &str) -> String {
    let mut parts: Vec<&str> = if dir.is_empty() {
        Vec::new()
    } else {
        dir.split('/').collect()
    };
    for segment in href.split('/') {
        match segment {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::super::test_asset;
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_epub(path: &std::path::Path) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        writer.start_file("META-INF/container.xml", options).unwrap();
        writer
            .write_all(
                br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
            )
            .unwrap();

        writer.start_file("OEBPS/content.opf", options).unwrap();
        writer
            .write_all(
                br#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <manifest>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch2" href="ch2.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine><itemref idref="ch1"/><itemref idref="ch2"/></spine>
</package>"#,
            )
            .unwrap();

        writer.start_file("OEBPS/ch1.xhtml", options).unwrap();
        writer
            .write_all(b"<html><body><p>Chapter one text.</p></body></html>")
            .unwrap();
        writer.start_file("OEBPS/ch2.xhtml", options).unwrap();
        writer
            .write_all(b"<html><body><p>Chapter two text.</p></body></html>")
            .unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_spine_items_in_order_with_chapter_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        build_epub(&path);

        let asset = test_asset(&path.to_string_lossy());
        let extraction = EpubExtractor.extract(&asset).unwrap();
        assert_eq!(extraction.atoms.len(), 2);
        assert_eq!(extraction.atoms[0].text.as_deref(), Some("Chapter one text."));
        assert_eq!(extraction.atoms[0].anchor.chapter.as_deref(), Some("ch1"));
        assert_eq!(extraction.atoms[1].anchor.chapter.as_deref(), Some("ch2"));
        assert_eq!(extraction.atoms[1].seq, 1);
    }

    #[test]
    fn join_resolves_relative_segments() {
        assert_eq!(join_entry_path("OEBPS", "ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(join_entry_path("OEBPS", "../root.xhtml"), "root.xhtml");
        assert_eq!(join_entry_path("", "ch1.xhtml"), "ch1.xhtml");
    }

    #[test]
    fn rejects_non_zip_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.epub");
        std::fs::write(&path, "not a zip").unwrap();
        let asset = test_asset(&path.to_string_lossy());
        assert!(EpubExtractor.extract(&asset).is_err());
    }
}
