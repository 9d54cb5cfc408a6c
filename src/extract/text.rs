//! Plain-text family extractor: TXT, Markdown, HTML, RTF.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{AppError, AppResult};
use crate::model::{Asset, EvidenceAnchor};

use super::{asset_extension, text_atom, Extraction, Extractor};

const EXTENSIONS: [&str; 6] = ["txt", "md", "markdown", "html", "htm", "rtf"];

pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn name(&self) -> &'static str {
        "text"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn can_handle(&self, asset: &Asset) -> bool {
        EXTENSIONS.contains(&asset_extension(asset).as_str())
    }

    fn extract(&self, asset: &Asset) -> AppResult<Extraction> {
        let raw = std::fs::read_to_string(&asset.path)
            .map_err(|e| AppError::Extract(format!("read {}: {}", asset.path, e)))?;

        let text = match asset_extension(asset).as_str() {
            "html" | "htm" => strip_html(&raw),
            "rtf" => strip_rtf(&raw),
            _ => raw,
        };

        let text = text.trim().to_string();
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

/// Strip tags (script/style bodies included) and unescape the standard
/// entity set.
pub(crate) fn strip_html(html: &str) -> String {
    static SCRIPT_RE: OnceLock<Regex> = OnceLock::new();
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let script_re = SCRIPT_RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap()
    });
    let tag_re = TAG_RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").unwrap());

    let without_blocks = script_re.replace_all(html, " ");
    let without_tags = tag_re.replace_all(&without_blocks, " ");
    let unescaped = unescape_entities(&without_tags);
    collapse_blank_runs(&unescaped)
}

/// Unescape the standard named entities plus decimal numeric references.
pub(crate) fn unescape_entities(text: &str) -> String {
    static NUMERIC_RE: OnceLock<Regex> = OnceLock::new();
    let numeric_re = NUMERIC_RE.get_or_init(|| Regex::new(r"&#(\d+);").unwrap());

    let named = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&");

    numeric_re
        .replace_all(&named, |caps: &regex::Captures<'_>| {
            caps[1]
                .parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .map(|c| c.to_string())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Strip RTF control words, groups, and hex escapes, leaving the plain text.
pub(crate) fn strip_rtf(rtf: &str) -> String {
    static CONTROL_RE: OnceLock<Regex> = OnceLock::new();
    static HEX_RE: OnceLock<Regex> = OnceLock::new();
    let hex_re = HEX_RE.get_or_init(|| Regex::new(r"\\'[0-9a-fA-F]{2}").unwrap());
    let control_re = CONTROL_RE.get_or_init(|| Regex::new(r"\\[a-zA-Z]+-?\d* ?").unwrap());

    let without_hex = hex_re.replace_all(rtf, " ");
    let without_controls = control_re.replace_all(&without_hex, "");
    let without_braces: String = without_controls
        .chars()
        .filter(|&c| c != '{' && c != '}')
        .collect();
    collapse_blank_runs(&without_braces)
}

/// Collapse runs of spaces inside lines and runs of blank lines, keeping
/// paragraph structure intact for the chunker.
fn collapse_blank_runs(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0usize;
    for line in text.lines() {
        let compact = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if compact.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !lines.is_empty() {
                lines.push(String::new());
            }
        } else {
            blank_run = 0;
            lines.push(compact);
        }
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::super::test_asset;
    use super::*;
    use crate::model::AtomType;

    #[test]
    fn strips_html_tags_and_entities() {
        let html = "<html><body><p>Hello <b>world</b>!</p><p>A &amp; B &lt;ok&gt;</p></body></html>";
        let text = strip_html(html);
        assert_eq!(text, "Hello world ! A & B <ok>");
    }

    #[test]
    fn drops_script_and_style_bodies() {
        let html = "<style>p { color: red }</style><p>kept</p><script>var x = 1;</script>";
        assert_eq!(strip_html(html), "kept");
    }

    #[test]
    fn numeric_entities_decode() {
        assert_eq!(unescape_entities("&#65;&#66;"), "AB");
    }

    #[test]
    fn strips_rtf_control_words() {
        let rtf = r"{\rtf1\ansi\deff0 {\fonttbl {\f0 Times;}}Hello \b bold\b0  world.}";
        let text = strip_rtf(rtf);
        assert!(text.contains("Hello"));
        assert!(text.contains("world."));
        assert!(!text.contains('\\'));
        assert!(!text.contains('{'));
    }

    #[test]
    fn extracts_markdown_file_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "# Title\n\nBody text.").unwrap();

        let asset = test_asset(&path.to_string_lossy());
        let extraction = TextExtractor.extract(&asset).unwrap();
        assert_eq!(extraction.atoms.len(), 1);
        let atom = &extraction.atoms[0];
        assert_eq!(atom.atom_type, AtomType::Text);
        assert_eq!(atom.text.as_deref(), Some("# Title\n\nBody text."));
    }

    #[test]
    fn empty_file_yields_no_atoms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.txt");
        std::fs::write(&path, "   \n  ").unwrap();
        let asset = test_asset(&path.to_string_lossy());
        assert!(TextExtractor.extract(&asset).unwrap().atoms.is_empty());
    }
}
