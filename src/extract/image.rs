//! Image extractor: runs the host OCR facility over the image and emits the
//! recognized text (when any) plus an image-reference atom pointing back at
//! the file.

use std::process::Command;

use tracing::debug;

use crate::error::AppResult;
use crate::model::{Asset, EvidenceAnchor};

use super::{asset_extension, image_ref_atom, text_atom, Extraction, Extractor};

const EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "webp", "heic", "heif", "tiff", "tif"];

pub struct ImageExtractor;

impl Extractor for ImageExtractor {
    fn name(&self) -> &'static str {
        "image"
    }

    fn priority(&self) -> i32 {
        15
    }

    fn can_handle(&self, asset: &Asset) -> bool {
        EXTENSIONS.contains(&asset_extension(asset).as_str())
    }

    fn extract(&self, asset: &Asset) -> AppResult<Extraction> {
        let mut atoms = Vec::new();
        let mut seq = 0i64;

        if let Some(text) = ocr_image(&asset.path) {
            let text = text.trim().to_string();
            if !text.is_empty() {
                atoms.push(text_atom(
                    asset,
                    seq,
                    text,
                    EvidenceAnchor::for_asset(&asset.id),
                ));
                seq += 1;
            }
        }

        atoms.push(image_ref_atom(asset, seq));
        Ok(Extraction::complete(atoms))
    }
}

/// OCR through whatever the host provides on the PATH. Vision has no CLI
/// surface, so the probe order is the tesseract CLI, then nothing: an image
/// without an OCR tool still yields its reference atom.
fn ocr_image(path: &str) -> Option<String> {
    let output = Command::new("tesseract")
        .args([path, "stdout", "--psm", "3"])
        .output()
        .ok()?;
    if !output.status.success() {
        debug!(path, status = ?output.status.code(), "ocr exited nonzero");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::super::test_asset;
    use super::*;
    use crate::model::AtomType;

    #[test]
    fn claims_image_extensions_case_insensitively() {
        assert!(ImageExtractor.can_handle(&test_asset("/tmp/scan.PNG")));
        assert!(ImageExtractor.can_handle(&test_asset("/tmp/photo.heic")));
        assert!(!ImageExtractor.can_handle(&test_asset("/tmp/doc.pdf")));
    }

    #[test]
    fn always_emits_image_reference_atom() {
        let asset = test_asset("/nonexistent/photo.jpg");
        let extraction = ImageExtractor.extract(&asset).unwrap();
        assert_eq!(extraction.atoms.len(), 1);
        let atom = &extraction.atoms[0];
        assert_eq!(atom.atom_type, AtomType::Image);
        assert_eq!(atom.payload_ref.as_deref(), Some("/nonexistent/photo.jpg"));
    }
}
