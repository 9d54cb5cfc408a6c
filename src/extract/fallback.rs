//! Generic fallback extractor: accepts everything the specialized handlers
//! declined. Tries the platform `textutil` converter first; otherwise reads
//! the raw bytes and emits text only when the head of the file looks like
//! text.

use crate::error::{AppError, AppResult};
use crate::model::{Asset, EvidenceAnchor};

use super::pdf::textutil_convert;
use super::{text_atom, Extraction, Extractor};

/// Share of NUL/control bytes in the first KiB above which the payload is
/// treated as binary.
const BINARY_RATIO: f64 = 0.10;

pub struct FallbackExtractor;

impl Extractor for FallbackExtractor {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_handle(&self, _asset: &Asset) -> bool {
        true
    }

    fn extract(&self, asset: &Asset) -> AppResult<Extraction> {
        if let Some(text) = textutil_convert(&asset.path) {
            let text = text.trim().to_string();
            if !text.is_empty() {
                return Ok(Extraction::complete(vec![text_atom(
                    asset,
                    0,
                    text,
                    EvidenceAnchor::for_asset(&asset.id),
                )]));
            }
        }

        let bytes = std::fs::read(&asset.path)
            .map_err(|e| AppError::Extract(format!("read {}: {}", asset.path, e)))?;
        if !looks_like_text(&bytes) {
            return Ok(Extraction::default());
        }

        let text = String::from_utf8_lossy(&bytes).trim().to_string();
        if text.is_empty() {
            return Ok(Extraction::default());
        }
        Ok(Extraction::complete(vec![text_atom(
            asset,
            0,
            text,
            EvidenceAnchor::for_asset(&asset.id),
        )]))
    }
}

/// Inspect the first KiB: under 10% NUL/control bytes (tab, LF, CR exempt)
/// passes as text.
fn looks_like_text(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    if head.is_empty() {
        return false;
    }
    let control = head
        .iter()
        .filter(|&&b| b == 0 || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r'))
        .count();
    (control as f64) / (head.len() as f64) < BINARY_RATIO
}

#[cfg(test)]
mod tests {
    use super::super::test_asset;
    use super::*;

    #[test]
    fn accepts_everything() {
        assert!(FallbackExtractor.can_handle(&test_asset("/tmp/whatever.xyz")));
    }

    #[test]
    fn plain_bytes_become_a_text_atom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.unknownext");
        std::fs::write(&path, "readable content here").unwrap();

        let extraction = FallbackExtractor
            .extract(&test_asset(&path.to_string_lossy()))
            .unwrap();
        assert_eq!(extraction.atoms.len(), 1);
        assert_eq!(
            extraction.atoms[0].text.as_deref(),
            Some("readable content here")
        );
    }

    #[test]
    fn binary_heads_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let mut bytes = vec![0u8; 512];
        bytes.extend_from_slice(b"trailing text");
        std::fs::write(&path, &bytes).unwrap();

        let extraction = FallbackExtractor
            .extract(&test_asset(&path.to_string_lossy()))
            .unwrap();
        assert!(extraction.atoms.is_empty());
    }

    #[test]
    fn ratio_gate_boundaries() {
        assert!(looks_like_text(b"hello world"));
        assert!(!looks_like_text(&[0u8; 100]));
        assert!(looks_like_text(b"tabs\tand\nnewlines\rok"));
    }
}
