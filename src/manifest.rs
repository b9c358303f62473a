//! # ManifestCodec
//!
//! Canonical serialize/deserialize of a version's file list, and the
//! canonical `manifest_hash` used for duplicate detection. The on-disk
//! format is bit-stable across implementations (§6 of the spec this engine
//! follows): UTF-8 JSON, keys sorted alphabetically within objects, entries
//! sorted by `path` ascending bytewise.
//!
//! The manifest is stored as a file through `FileStore`, never inline in a
//! database row — the same "manifest/metadata as files" layout the teacher
//! crate uses for its snapshots.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a file entry's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    Cas,
    Inline,
}

/// One file within a version. Field order is alphabetical to match the
/// on-disk key ordering the spec requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// The CAS entry this file's content lives under. Recorded as the
    /// blob's content hash (this store's only blob identifier — there is
    /// no separate integer id to allocate) rather than the `<int>` the
    /// wire format names; see `DESIGN.md`'s Open Question resolutions.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub blob_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    pub hash: String,
    pub path: String,
    pub size: u64,
    pub storage: Storage,
}

impl FileEntry {
    pub fn cas(path: impl Into<String>, hash: impl Into<String>, size: u64, blob_id: String) -> Self {
        Self {
            blob_id: Some(blob_id),
            content: None,
            hash: hash.into(),
            path: normalize_path(&path.into()),
            size,
            storage: Storage::Cas,
        }
    }

    pub fn inline(path: impl Into<String>, hash: impl Into<String>, size: u64, content_b64: String) -> Self {
        Self {
            blob_id: None,
            content: Some(content_b64),
            hash: hash.into(),
            path: normalize_path(&path.into()),
            size,
            storage: Storage::Inline,
        }
    }
}

/// Normalizes path separators to `/`, matching the spec's "forward-slash
/// relative" path requirement regardless of host OS.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// A version's file list plus the metadata the wire format carries
/// alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub cas_threshold_mb: f64,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileEntry>,
}

/// Canonical encode/decode/hash for a version's manifest.
pub struct ManifestCodec;

impl ManifestCodec {
    /// Sorts `entries` by path (bytewise) and serializes them with the
    /// given metadata into the canonical JSON document.
    pub fn encode(
        entries: &[FileEntry],
        cas_threshold_bytes: u64,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));
        let manifest = Manifest {
            cas_threshold_mb: cas_threshold_bytes as f64 / (1024.0 * 1024.0),
            created_at,
            files: sorted,
        };
        serde_json::to_vec_pretty(&manifest)
            .map_err(|e| EngineError::internal(format!("encoding manifest: {e}")))
    }

    /// Parses a manifest document previously produced by `encode`.
    pub fn decode(bytes: &[u8]) -> Result<Manifest> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::ManifestCorrupt(format!("invalid manifest JSON: {e}")))
    }

    /// SHA-256 over the sorted `path \0 hash \0 size \0` concatenation.
    /// Deliberately excludes storage class and inline content so logically
    /// identical content hashes identically regardless of the CAS
    /// threshold in effect when it was committed.
    pub fn manifest_hash(entries: &[FileEntry]) -> String {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));

        let mut hasher = Sha256::new();
        for entry in &sorted {
            hasher.update(entry.path.as_bytes());
            hasher.update(b"\0");
            hasher.update(entry.hash.as_bytes());
            hasher.update(b"\0");
            hasher.update(entry.size.to_string().as_bytes());
            hasher.update(b"\0");
        }
        let digest = hasher.finalize();
        let mut s = String::with_capacity(digest.len() * 2);
        for b in digest {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<FileEntry> {
        vec![
            FileEntry::inline("readme.txt", "bb", 12, "c29tZQ==".into()),
            FileEntry::cas("song.flp", "aa", 2_097_152, "aa".into()),
        ]
    }

    #[test]
    fn manifest_hash_is_order_independent() {
        let a = entries();
        let mut b = entries();
        b.reverse();
        assert_eq!(
            ManifestCodec::manifest_hash(&a),
            ManifestCodec::manifest_hash(&b)
        );
    }

    #[test]
    fn manifest_hash_ignores_storage_class() {
        let mut inline_version = entries();
        let mut cas_version = entries();
        // Flip storage class/blob_id/content on the first entry; the tuple
        // hash must not change.
        inline_version[0].storage = Storage::Inline;
        cas_version[0].storage = Storage::Cas;
        cas_version[0].blob_id = Some("bb".into());
        cas_version[0].content = None;
        assert_eq!(
            ManifestCodec::manifest_hash(&inline_version),
            ManifestCodec::manifest_hash(&cas_version)
        );
    }

    #[test]
    fn encode_then_decode_round_trips_sorted() {
        let encoded = ManifestCodec::encode(&entries(), 1_048_576, Utc::now()).unwrap();
        let decoded = ManifestCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.files.len(), 2);
        assert_eq!(decoded.files[0].path, "readme.txt");
        assert_eq!(decoded.files[1].path, "song.flp");
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = ManifestCodec::decode(b"not json").unwrap_err();
        assert!(matches!(err, EngineError::ManifestCorrupt(_)));
    }

    #[test]
    fn normalize_path_converts_backslashes() {
        assert_eq!(normalize_path("a\\b\\c.wav"), "a/b/c.wav");
    }
}
