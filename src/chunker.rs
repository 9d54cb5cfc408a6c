//! Token-aware, sentence-preserving chunker.
//!
//! Splits an asset's ordered text atoms into token-bounded chunks with a
//! sentence-overlap seed between neighbors, producing one chunk index series
//! across all atoms. Token counts come from the cl100k_base tokenizer, with
//! a word-count heuristic fallback when the tokenizer cannot be built.

use std::sync::OnceLock;

use regex::Regex;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::debug;

use crate::ids;
use crate::model::{Asset, AtomType, Chunk, ContentAtom, PIPELINE_VERSION};

const DEFAULT_TARGET_TOKENS: usize = 600;
const DEFAULT_MAX_TOKENS: usize = 800;
const DEFAULT_MIN_TOKENS: usize = 120;
const DEFAULT_OVERLAP_TOKENS: usize = 80;

/// Tokens reserved for the prompt scaffolding when adapting to a model
/// context window.
const CONTEXT_RESERVE: u64 = 2000;

/// Count tokens with cl100k_base; fall back to word count × 1.33.
pub fn count_tokens(text: &str) -> usize {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    let bpe = BPE.get_or_init(|| cl100k_base().ok());
    match bpe {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => (text.split_whitespace().count() as f64 * 1.33).ceil() as usize,
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    target_tokens: usize,
    max_tokens: usize,
    min_tokens: usize,
    overlap_tokens: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker {
    pub fn new() -> Self {
        Self {
            target_tokens: DEFAULT_TARGET_TOKENS,
            max_tokens: DEFAULT_MAX_TOKENS,
            min_tokens: DEFAULT_MIN_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }

    /// Tighten the chunk sizes to what the model context can hold. Values
    /// only ever shrink; a large context never enlarges the defaults.
    pub fn adapt_to_context(&mut self, ctx_tokens: u64) {
        let available = ctx_tokens.saturating_sub(CONTEXT_RESERVE).max(400) as usize;
        let proposed_target = available * 60 / 100;
        let proposed_max = available * 80 / 100;
        let proposed_min = proposed_target * 2 / 3;

        self.target_tokens = self.target_tokens.min(proposed_target);
        self.max_tokens = self.max_tokens.min(proposed_max);
        self.min_tokens = self.min_tokens.min(proposed_min);
        debug!(
            target = self.target_tokens,
            max = self.max_tokens,
            min = self.min_tokens,
            "chunker adapted to context"
        );
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Produce chunks for an asset from its ordered atoms. Non-text atoms
    /// are skipped; the chunk index runs across all atoms.
    pub fn chunk_atoms(&self, asset: &Asset, atoms: &[ContentAtom]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut index = 0i64;
        for atom in atoms {
            if atom.atom_type != AtomType::Text {
                continue;
            }
            let Some(text) = atom.text.as_deref() else {
                continue;
            };
            let anchor_json = atom.anchor.to_json();
            for piece in self.split_text(text) {
                let token_count = count_tokens(&piece);
                chunks.push(Chunk {
                    id: ids::chunk_id(&asset.id, &anchor_json, &piece),
                    atom_id: atom.id.clone(),
                    asset_id: asset.id.clone(),
                    text: piece,
                    token_count,
                    chunk_index: index,
                    anchor: atom.anchor.clone(),
                    embedding_ref: None,
                    pipeline_version: PIPELINE_VERSION.to_string(),
                });
                index += 1;
            }
        }
        chunks
    }

    /// Split one atom's text into chunk strings.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if count_tokens(trimmed) <= self.max_tokens {
            return vec![trimmed.to_string()];
        }

        let mut sentences = split_sentences(trimmed);
        if sentences.len() <= 1 {
            sentences = trimmed
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }
        if sentences.is_empty() {
            return vec![trimmed.to_string()];
        }

        // A single sentence above max is split on newlines once more. A lone
        // overlong line survives intact and exceeds max; observed behavior,
        // kept.
        let mut units: Vec<String> = Vec::new();
        for sentence in sentences {
            if count_tokens(&sentence) > self.max_tokens && sentence.contains('\n') {
                units.extend(
                    sentence
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string),
                );
            } else {
                units.push(sentence);
            }
        }

        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;

        for unit in units {
            let unit_tokens = count_tokens(&unit);
            if !current.is_empty()
                && current_tokens + unit_tokens > self.max_tokens
                && current_tokens >= self.min_tokens
            {
                chunks.push(current.join(" "));
                let seed = self.overlap_suffix(&current);
                current_tokens = seed.iter().map(|s| count_tokens(s)).sum();
                current = seed;
            }
            current_tokens += unit_tokens;
            current.push(unit);
        }

        // Residual is emitted regardless of the minimum.
        if !current.is_empty() {
            let residual = current.join(" ");
            // The overlap seed alone re-emits the previous tail; only keep a
            // residual that adds something.
            if chunks.last().map(|last| last != &residual).unwrap_or(true) {
                chunks.push(residual);
            }
        }
        chunks
    }

    /// Trailing whole sentences of the emitted chunk totalling at most the
    /// overlap budget, used to seed the next chunk.
    fn overlap_suffix(&self, sentences: &[String]) -> Vec<String> {
        let mut suffix: Vec<String> = Vec::new();
        let mut tokens = 0usize;
        for sentence in sentences.iter().rev() {
            let t = count_tokens(sentence);
            if tokens + t > self.overlap_tokens {
                break;
            }
            tokens += t;
            suffix.push(sentence.clone());
        }
        suffix.reverse();
        suffix
    }
}

/// Split on ASCII sentence terminators followed by whitespace, keeping the
/// terminator attached to the preceding sentence.
fn split_sentences(text: &str) -> Vec<String> {
    static SENTENCE_RE: OnceLock<Regex> = OnceLock::new();
    let re = SENTENCE_RE.get_or_init(|| Regex::new(r"[.!?]\s+").unwrap());

    let mut sentences = Vec::new();
    let mut last = 0usize;
    for m in re.find_iter(text) {
        let end = m.start() + 1;
        let sentence = text[last..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        last = m.end();
    }
    let tail = text[last..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EvidenceAnchor;

    fn text_atom(asset_id: &str, seq: i64, text: &str) -> ContentAtom {
        ContentAtom {
            id: ids::atom_id(asset_id, "text", seq),
            asset_id: asset_id.to_string(),
            atom_type: AtomType::Text,
            seq,
            text: Some(text.to_string()),
            payload_ref: None,
            metadata: None,
            anchor: EvidenceAnchor::for_asset(asset_id),
        }
    }

    fn test_asset(id: &str) -> Asset {
        use crate::model::AssetStatus;
        use chrono::Utc;
        Asset {
            id: id.to_string(),
            path: "/tmp/a.txt".to_string(),
            filename: "a.txt".to_string(),
            size_bytes: 1,
            mtime_ns: 0,
            content_hash: "h".to_string(),
            mime_type: "text/plain".to_string(),
            scan_version: 1,
            status: AssetStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunker = Chunker::new();
        let chunks = chunker.split_text("The mitochondria is the powerhouse of the cell.");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn sentences_keep_their_terminators() {
        let sentences = split_sentences("First one. Second one! Third one? Tail without end");
        assert_eq!(
            sentences,
            vec![
                "First one.",
                "Second one!",
                "Third one?",
                "Tail without end"
            ]
        );
    }

    #[test]
    fn long_text_splits_with_sentence_overlap() {
        let mut chunker = Chunker::new();
        chunker.max_tokens = 40;
        chunker.min_tokens = 10;
        chunker.overlap_tokens = 12;

        let text = (0..20)
            .map(|i| format!("Sentence number {} carries a handful of tokens.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunker.split_text(&text);
        assert!(chunks.len() > 1);

        // Each boundary repeats the trailing sentence of the previous
        // chunk as the overlap seed.
        for pair in chunks.windows(2) {
            let last_sentence = pair[0].rsplit(". ").next().unwrap();
            assert!(
                pair[1].starts_with(last_sentence),
                "expected {:?} to start with {:?}",
                pair[1],
                last_sentence
            );
        }

        // Full coverage: every sentence index appears somewhere.
        for i in 0..20 {
            let marker = format!("number {}", i);
            assert!(chunks.iter().any(|c| c.contains(&marker)));
        }
    }

    #[test]
    fn newline_fallback_when_no_terminators() {
        let mut chunker = Chunker::new();
        chunker.max_tokens = 10;
        chunker.min_tokens = 2;
        chunker.overlap_tokens = 0;
        let text = "alpha beta gamma delta\nepsilon zeta eta theta\niota kappa lambda mu\nnu xi omicron pi";
        let chunks = chunker.split_text(text);
        assert!(chunks.len() > 1);
    }

    #[test]
    fn single_overlong_line_is_emitted_whole() {
        let mut chunker = Chunker::new();
        chunker.max_tokens = 5;
        let text = "one two three four five six seven eight nine ten";
        let chunks = chunker.split_text(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], text);
    }

    #[test]
    fn adapt_to_context_only_tightens() {
        let mut chunker = Chunker::new();
        chunker.adapt_to_context(131072);
        assert_eq!(chunker.max_tokens, DEFAULT_MAX_TOKENS);

        let mut small = Chunker::new();
        small.adapt_to_context(2400);
        // available = 400 → target 240, max 320, min 160
        assert_eq!(small.max_tokens, 320);
        assert_eq!(small.target_tokens, 240);
        assert_eq!(small.min_tokens, 120);
    }

    #[test]
    fn chunk_ids_are_stable_across_runs() {
        let chunker = Chunker::new();
        let asset = test_asset("abc");
        let atoms = vec![text_atom("abc", 0, "Hello, world.")];
        let first = chunker.chunk_atoms(&asset, &atoms);
        let second = chunker.chunk_atoms(&asset, &atoms);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].id.len(), 32);
    }

    #[test]
    fn index_series_runs_across_atoms_and_skips_non_text() {
        let chunker = Chunker::new();
        let asset = test_asset("abc");
        let mut image = text_atom("abc", 1, "ignored");
        image.atom_type = AtomType::Image;
        let atoms = vec![
            text_atom("abc", 0, "First atom text."),
            image,
            text_atom("abc", 2, "Second atom text."),
        ];
        let chunks = chunker.chunk_atoms(&asset, &atoms);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[1].chunk_index, 1);
    }
}
