//! DICOM extractor: verifies the DICM magic at byte offset 128 and walks the
//! data set with explicit-VR / implicit-VR heuristics, pulling the known
//! patient, study, modality, and manufacturer fields. Emits a human-readable
//! summary atom, a metadata atom holding the full parsed dictionary, and an
//! image-reference atom.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;

use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::model::{Asset, EvidenceAnchor};

use super::{asset_extension, image_ref_atom, metadata_atom, text_atom, Extraction, Extractor};

/// VRs whose explicit form carries a 2-byte reserved block and a 32-bit
/// length.
const LONG_VRS: [&[u8; 2]; 6] = [b"OB", b"OW", b"OF", b"SQ", b"UT", b"UN"];

/// VRs whose values are character data worth keeping in the dictionary.
const TEXT_VRS: [&[u8; 2]; 12] = [
    b"AE", b"AS", b"CS", b"DA", b"DS", b"DT", b"IS", b"LO", b"PN", b"SH", b"TM", b"UI",
];

/// (group, element) pairs surfaced by name in the summary.
const KNOWN_TAGS: [((u16, u16), &str); 8] = [
    ((0x0010, 0x0010), "patient_name"),
    ((0x0010, 0x0020), "patient_id"),
    ((0x0010, 0x0030), "patient_birth_date"),
    ((0x0008, 0x0020), "study_date"),
    ((0x0008, 0x1030), "study_description"),
    ((0x0008, 0x0060), "modality"),
    ((0x0008, 0x0070), "manufacturer"),
    ((0x0008, 0x0080), "institution"),
];

pub struct DicomExtractor;

impl Extractor for DicomExtractor {
    fn name(&self) -> &'static str {
        "dicom"
    }

    fn priority(&self) -> i32 {
        15
    }

    fn can_handle(&self, asset: &Asset) -> bool {
        match asset_extension(asset).as_str() {
            "dcm" | "dicom" => true,
            // DICOM files frequently ship without an extension; probe the
            // magic only in that case to avoid touching every asset.
            "" => has_dicm_magic(&asset.path),
            _ => false,
        }
    }

    fn extract(&self, asset: &Asset) -> AppResult<Extraction> {
        let mut bytes = Vec::new();
        File::open(&asset.path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| AppError::Extract(format!("read {}: {}", asset.path, e)))?;

        if bytes.len() < 132 || &bytes[128..132] != b"DICM" {
            return Err(AppError::Extract(format!(
                "{} lacks the DICM magic",
                asset.path
            )));
        }

        let dict = walk_elements(&bytes[132..]);
        if dict.is_empty() {
            debug!(asset = %asset.path, "no textual elements parsed");
        }

        let mut named: BTreeMap<&str, &str> = BTreeMap::new();
        for ((group, element), name) in KNOWN_TAGS {
            if let Some(value) = dict.get(&tag_key(group, element)) {
                named.insert(name, value.as_str());
            }
        }

        let mut summary = String::from("DICOM object");
        for (name, value) in &named {
            summary.push('\n');
            summary.push_str(&format!("{}: {}", name.replace('_', " "), value));
        }

        let metadata = serde_json::to_value(&dict)?;
        let atoms = vec![
            text_atom(asset, 0, summary, EvidenceAnchor::for_asset(&asset.id)),
            metadata_atom(asset, 1, metadata),
            image_ref_atom(asset, 2),
        ];
        Ok(Extraction::complete(atoms))
    }
}

fn has_dicm_magic(path: &str) -> bool {
    let mut head = [0u8; 132];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut head))
        .map(|_| &head[128..132] == b"DICM")
        .unwrap_or(false)
}

fn tag_key(group: u16, element: u16) -> String {
    format!("({:04x},{:04x})", group, element)
}

/// Walk data elements, collecting textual values keyed by `(gggg,eeee)`.
/// Explicit VR is detected by two ASCII uppercase letters in the VR slot;
/// anything else is treated as implicit VR with a 32-bit length. The walk
/// stops at undefined lengths (sequences) and at any structural misfit.
fn walk_elements(data: &[u8]) -> BTreeMap<String, String> {
    let mut dict = BTreeMap::new();
    let mut pos = 0usize;

    while pos + 8 <= data.len() {
        let group = u16::from_le_bytes([data[pos], data[pos + 1]]);
        let element = u16::from_le_bytes([data[pos + 2], data[pos + 3]]);
        pos += 4;

        let vr = [data[pos], data[pos + 1]];
        let explicit = vr.iter().all(|b| b.is_ascii_uppercase());

        let (value_len, textual) = if explicit {
            if LONG_VRS.iter().any(|&known| *known == vr) {
                if pos + 8 > data.len() {
                    break;
                }
                let len = u32::from_le_bytes([
                    data[pos + 4],
                    data[pos + 5],
                    data[pos + 6],
                    data[pos + 7],
                ]);
                pos += 8;
                (len, false)
            } else {
                let len = u16::from_le_bytes([data[pos + 2], data[pos + 3]]) as u32;
                pos += 4;
                (len, TEXT_VRS.iter().any(|&known| *known == vr))
            }
        } else {
            if pos + 4 > data.len() {
                break;
            }
            let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            pos += 4;
            (len, true)
        };

        if value_len == 0xFFFF_FFFF {
            // Undefined-length sequence: bail out rather than guessing.
            break;
        }
        let value_len = value_len as usize;
        if pos + value_len > data.len() {
            break;
        }

        if textual && value_len > 0 && value_len < 1024 {
            let raw = &data[pos..pos + value_len];
            if raw.iter().all(|&b| b == 0 || b.is_ascii()) {
                let value = String::from_utf8_lossy(raw)
                    .trim_matches(|c: char| c.is_whitespace() || c == '\0')
                    .to_string();
                if !value.is_empty() {
                    dict.insert(tag_key(group, element), value);
                }
            }
        }
        pos += value_len;
    }
    dict
}

#[cfg(test)]
mod tests {
    use super::super::test_asset;
    use super::*;
    use crate::model::AtomType;

    fn element(group: u16, elem: u16, vr: &[u8; 2], value: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&group.to_le_bytes());
        out.extend_from_slice(&elem.to_le_bytes());
        out.extend_from_slice(vr);
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        out.extend_from_slice(value);
        out
    }

    fn build_dicom(path: &std::path::Path) {
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        bytes.extend(element(0x0008, 0x0060, b"CS", b"CT"));
        bytes.extend(element(0x0008, 0x0070, b"LO", b"Acme Medical"));
        bytes.extend(element(0x0010, 0x0010, b"PN", b"Doe^Jane"));
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn parses_known_tags_into_summary_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.dcm");
        build_dicom(&path);

        let asset = test_asset(&path.to_string_lossy());
        let extraction = DicomExtractor.extract(&asset).unwrap();
        assert_eq!(extraction.atoms.len(), 3);

        let summary = extraction.atoms[0].text.as_deref().unwrap();
        assert!(summary.contains("modality: CT"));
        assert!(summary.contains("patient name: Doe^Jane"));

        let metadata = extraction.atoms[1].metadata.as_ref().unwrap();
        assert_eq!(metadata["(0008,0070)"], "Acme Medical");
        assert_eq!(extraction.atoms[2].atom_type, AtomType::Image);
    }

    #[test]
    fn rejects_payload_without_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.dcm");
        std::fs::write(&path, b"just bytes").unwrap();
        let asset = test_asset(&path.to_string_lossy());
        assert!(DicomExtractor.extract(&asset).is_err());
    }

    #[test]
    fn magic_probe_only_claims_extensionless_files() {
        let dir = tempfile::tempdir().unwrap();
        let dicom_path = dir.path().join("series001");
        build_dicom(&dicom_path);
        let plain_path = dir.path().join("notes");
        std::fs::write(&plain_path, "plain").unwrap();

        assert!(DicomExtractor.can_handle(&test_asset(&dicom_path.to_string_lossy())));
        assert!(!DicomExtractor.can_handle(&test_asset(&plain_path.to_string_lossy())));
        assert!(!DicomExtractor.can_handle(&test_asset("/tmp/photo.png")));
    }
}
