//! PDF extractor: shells out to `pdftotext -layout`, falling back to the
//! macOS `textutil` converter when the primary tool is missing or fails.

use std::process::Command;

use tracing::debug;

use crate::error::AppResult;
use crate::model::{Asset, EvidenceAnchor};

use super::{asset_extension, text_atom, Extraction, Extractor};

pub struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn can_handle(&self, asset: &Asset) -> bool {
        asset_extension(asset) == "pdf"
    }

    fn extract(&self, asset: &Asset) -> AppResult<Extraction> {
        let text = pdftotext(&asset.path)
            .or_else(|| textutil_convert(&asset.path))
            .unwrap_or_default();

        let text = text.trim().to_string();
        if text.is_empty() {
            debug!(asset = %asset.path, "pdf produced no text");
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

/// `pdftotext -layout <file> -` writes the layout-preserving text to stdout.
fn pdftotext(path: &str) -> Option<String> {
    run_capture("pdftotext", &["-layout", path, "-"])
}

/// macOS `textutil` converts many document formats to plain text on stdout.
pub(crate) fn textutil_convert(path: &str) -> Option<String> {
    run_capture("textutil", &["-convert", "txt", "-stdout", path])
}

fn run_capture(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        debug!(program, status = ?output.status.code(), "converter exited nonzero");
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_asset;
    use super::*;

    #[test]
    fn claims_only_pdf_extension() {
        assert!(PdfExtractor.can_handle(&test_asset("/tmp/doc.pdf")));
        assert!(!PdfExtractor.can_handle(&test_asset("/tmp/doc.txt")));
    }

    #[test]
    fn missing_file_yields_empty_extraction() {
        // Both converters fail on a nonexistent path; the extractor reports
        // an empty result rather than an error.
        let extraction = PdfExtractor
            .extract(&test_asset("/nonexistent/doc.pdf"))
            .unwrap();
        assert!(extraction.atoms.is_empty());
    }
}
