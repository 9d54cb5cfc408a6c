//! Deterministic record identifiers.
//!
//! Every persistent record is keyed by 32 hex characters derived from the
//! SHA-256 of a stable `:`-joined tuple, so identical inputs across runs
//! produce identical IDs and re-processing is a no-op at the store layer.

use sha2::{Digest, Sha256};

/// Full 64-hex SHA-256 digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn short_id(joined: &str) -> String {
    let mut id = sha256_hex(joined.as_bytes());
    id.truncate(32);
    id
}

/// Asset ID: `sha256(path:mtime_ns:size)[..32]`.
pub fn asset_id(path: &str, mtime_ns: i64, size: u64) -> String {
    short_id(&format!("{}:{}:{}", path, mtime_ns, size))
}

/// Atom ID: `sha256(asset_id:atom_type:seq)[..32]`.
pub fn atom_id(asset_id: &str, atom_type: &str, seq: i64) -> String {
    short_id(&format!("{}:{}:{}", asset_id, atom_type, seq))
}

/// Chunk text normalization: case-folded with whitespace collapsed to
/// single spaces. Keeps chunk IDs stable when extraction order or
/// incidental spacing differs between runs.
pub fn normalize_chunk_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Chunk ID: `sha256(asset_id:anchor_json:hex(sha256(normalized_text)))[..32]`.
pub fn chunk_id(asset_id: &str, anchor_json: &str, text: &str) -> String {
    let text_hash = sha256_hex(normalize_chunk_text(text).as_bytes());
    short_id(&format!("{}:{}:{}", asset_id, anchor_json, text_hash))
}

/// Annotation ID: `sha256(chunk_id:model:prompt_id:prompt_version)[..32]`.
pub fn annotation_id(chunk_id: &str, model: &str, prompt_id: &str, prompt_version: &str) -> String {
    short_id(&format!("{}:{}:{}:{}", chunk_id, model, prompt_id, prompt_version))
}

/// Concept ID: `sha256("concept:level:cluster_idx:pipeline_version")[..32]`.
pub fn concept_id(level: i64, cluster_idx: usize, pipeline_version: &str) -> String {
    short_id(&format!("concept:{}:{}:{}", level, cluster_idx, pipeline_version))
}

/// Sub-concept ID from a refinement pass, additionally scoped by the parent
/// so two refinements at the same level cannot collide.
pub fn sub_concept_id(
    level: i64,
    parent_id: &str,
    cluster_idx: usize,
    pipeline_version: &str,
) -> String {
    short_id(&format!(
        "concept:{}:{}:{}:{}",
        level, parent_id, cluster_idx, pipeline_version
    ))
}

/// Edge ID, deterministic in (type, source, target).
pub fn edge_id(edge_type: &str, source: &str, target: &str) -> String {
    short_id(&format!("edge:{}:{}:{}", edge_type, source, target))
}

/// Watched-root ID, deterministic in the canonical path.
pub fn root_id(path: &str) -> String {
    short_id(&format!("root:{}", path))
}

/// Random 16-hex job ID for one pipeline run.
pub fn new_job_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_32_hex() {
        let id = asset_id("/tmp/a.txt", 123, 456);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_inputs_identical_ids() {
        assert_eq!(asset_id("/a", 1, 2), asset_id("/a", 1, 2));
        assert_ne!(asset_id("/a", 1, 2), asset_id("/a", 1, 3));
    }

    #[test]
    fn normalization_folds_case_and_whitespace() {
        assert_eq!(normalize_chunk_text("Hello,   World.\n\tBye"), "hello, world. bye");
    }

    #[test]
    fn chunk_id_matches_reference_formula() {
        // Reference vector: asset "abc", anchor {"asset_id":"abc"},
        // text "Hello, world." normalizing to "hello, world.".
        let anchor_json = r#"{"asset_id":"abc"}"#;
        let inner = sha256_hex("hello, world.".as_bytes());
        let expected = {
            let mut h = sha256_hex(format!("abc:{}:{}", anchor_json, inner).as_bytes());
            h.truncate(32);
            h
        };
        assert_eq!(chunk_id("abc", anchor_json, "Hello, world."), expected);
    }

    #[test]
    fn job_ids_are_16_hex_and_random() {
        let a = new_job_id();
        let b = new_job_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
