//! Pluggable extractor registry.
//!
//! Each format handler implements [`Extractor`]; the registry walks handlers
//! in descending priority and the first whose `can_handle` returns true owns
//! extraction. A lowest-priority fallback accepts everything, so every asset
//! yields an extraction attempt.

use tracing::debug;

use crate::error::AppResult;
use crate::ids;
use crate::model::{Asset, AtomType, ContentAtom, EvidenceAnchor};

mod archive;
mod dicom;
mod epub;
mod fallback;
mod image;
mod pdf;
mod text;

pub use archive::ArchiveExtractor;
pub use dicom::DicomExtractor;
pub use epub::EpubExtractor;
pub use fallback::FallbackExtractor;
pub use image::ImageExtractor;
pub use pdf::PdfExtractor;
pub use text::TextExtractor;

/// Result of one extraction. Archive bomb guards may abandon an archive
/// midway; the atoms produced before the cap are kept and the violation is
/// reported alongside them.
#[derive(Debug, Default)]
pub struct Extraction {
    pub atoms: Vec<ContentAtom>,
    pub violation: Option<String>,
}

impl Extraction {
    pub fn complete(atoms: Vec<ContentAtom>) -> Self {
        Self {
            atoms,
            violation: None,
        }
    }
}

pub trait Extractor: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &'static str;

    /// Higher priority wins.
    fn priority(&self) -> i32;

    fn can_handle(&self, asset: &Asset) -> bool;

    fn extract(&self, asset: &Asset) -> AppResult<Extraction>;
}

pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Registry with the full production extractor set, sorted by priority
    /// at construction.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Box::new(PdfExtractor),
            Box::new(EpubExtractor),
            Box::new(ImageExtractor),
            Box::new(DicomExtractor),
            Box::new(TextExtractor),
            Box::new(ArchiveExtractor),
            Box::new(FallbackExtractor),
        ])
    }

    pub fn new(mut extractors: Vec<Box<dyn Extractor>>) -> Self {
        extractors.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { extractors }
    }

    /// Dispatch to the highest-priority extractor claiming the asset.
    pub fn extract(&self, asset: &Asset) -> AppResult<Extraction> {
        for extractor in &self.extractors {
            if extractor.can_handle(asset) {
                debug!(asset = %asset.path, extractor = extractor.name(), "extracting");
                return extractor.extract(asset);
            }
        }
        // Unreachable with the fallback registered, but the registry does
        // not assume its own construction.
        Ok(Extraction::default())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }
}

/// Lowercased extension of the asset path.
pub(crate) fn asset_extension(asset: &Asset) -> String {
    std::path::Path::new(&asset.path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

pub(crate) fn text_atom(
    asset: &Asset,
    seq: i64,
    text: String,
    anchor: EvidenceAnchor,
) -> ContentAtom {
    ContentAtom {
        id: ids::atom_id(&asset.id, AtomType::Text.as_str(), seq),
        asset_id: asset.id.clone(),
        atom_type: AtomType::Text,
        seq,
        text: Some(text),
        payload_ref: None,
        metadata: None,
        anchor,
    }
}

pub(crate) fn image_ref_atom(asset: &Asset, seq: i64) -> ContentAtom {
    ContentAtom {
        id: ids::atom_id(&asset.id, AtomType::Image.as_str(), seq),
        asset_id: asset.id.clone(),
        atom_type: AtomType::Image,
        seq,
        text: None,
        payload_ref: Some(asset.path.clone()),
        metadata: None,
        anchor: EvidenceAnchor::for_asset(&asset.id),
    }
}

pub(crate) fn metadata_atom(asset: &Asset, seq: i64, metadata: serde_json::Value) -> ContentAtom {
    ContentAtom {
        id: ids::atom_id(&asset.id, AtomType::Metadata.as_str(), seq),
        asset_id: asset.id.clone(),
        atom_type: AtomType::Metadata,
        seq,
        text: None,
        payload_ref: None,
        metadata: Some(metadata),
        anchor: EvidenceAnchor::for_asset(&asset.id),
    }
}

#[cfg(test)]
pub(crate) fn test_asset(path: &str) -> Asset {
    use crate::model::AssetStatus;
    use chrono::Utc;
    Asset {
        id: ids::asset_id(path, 0, 1),
        path: path.to_string(),
        filename: std::path::Path::new(path)
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default(),
        size_bytes: 1,
        mtime_ns: 0,
        content_hash: "test".to_string(),
        mime_type: "application/octet-stream".to_string(),
        scan_version: 1,
        status: AssetStatus::Pending,
        last_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_orders_by_priority_and_first_match_wins() {
        let registry = ExtractorRegistry::with_defaults();
        let names = registry.names();
        assert_eq!(names.first(), Some(&"pdf"));
        assert_eq!(names.last(), Some(&"fallback"));
    }

    #[test]
    fn atom_ids_are_deterministic_per_type_and_seq() {
        let asset = test_asset("/tmp/x.bin");
        let a = text_atom(&asset, 0, "t".into(), EvidenceAnchor::for_asset(&asset.id));
        let b = text_atom(&asset, 0, "t".into(), EvidenceAnchor::for_asset(&asset.id));
        let c = image_ref_atom(&asset, 0);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }
}
