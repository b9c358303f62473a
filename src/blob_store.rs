//! # BlobStore (CAS)
//!
//! Maps content hash to a stored blob, enforces at-most-one concurrent
//! writer per hash, and tracks reference counts via `BlobReference` rows so
//! a blob becomes eligible for deletion only once no completed version
//! still holds it.
//!
//! The reference index is persisted as one JSON document through
//! `FileStore` (there is no SQL database in this stack, matching the
//! teacher crate and the original service's "metadata as files" design) and
//! cached in memory behind a `parking_lot::Mutex` for the hot path.

use crate::error::{EngineError, Result};
use crate::file_store::FileStore;
use crate::hasher;
use crate::ids::Uid;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

const INDEX_KEY: &str = "cas/_index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobReference {
    pub blob_hash: String,
    pub version: Uid,
    pub project: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct BlobIndex {
    references: Vec<BlobReference>,
}

impl BlobIndex {
    fn ref_count(&self, hash: &str) -> u64 {
        self.references.iter().filter(|r| r.blob_hash == hash).count() as u64
    }
}

pub struct BlobStore {
    file_store: Arc<dyn FileStore>,
    index: Mutex<BlobIndex>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BlobStore {
    pub fn new(file_store: Arc<dyn FileStore>) -> Result<Self> {
        let index = if file_store.exists(INDEX_KEY) {
            let mut buf = Vec::new();
            file_store.open(INDEX_KEY)?.read_to_end(&mut buf)?;
            serde_json::from_slice(&buf)
                .map_err(|e| EngineError::internal(format!("loading CAS index: {e}")))?
        } else {
            BlobIndex::default()
        };

        Ok(Self {
            file_store,
            index: Mutex::new(index),
            write_locks: DashMap::new(),
        })
    }

    /// The `FileStore` key for a blob's payload: `cas/<hh>/<hash>`.
    pub fn key_for(hash: &str) -> String {
        let (prefix, _) = hasher::shard_path(hash);
        format!("cas/{prefix}/{hash}")
    }

    fn hash_lock(&self, hash: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn persist_index(&self, index: &BlobIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)
            .map_err(|e| EngineError::internal(format!("serializing CAS index: {e}")))?;
        self.file_store.put(INDEX_KEY, &bytes)?;
        Ok(())
    }

    /// Streams `reader`, computing its SHA-256 while copying it into a
    /// buffer. If `expected_hash` is given and disagrees with the computed
    /// hash, fails with `HashMismatch` before anything is written. If a
    /// blob with that hash already exists, returns it unchanged with
    /// `created = false`. Guarantees at-most-one writer per hash via a
    /// per-hash lock.
    pub fn store(
        &self,
        mut reader: impl Read,
        expected_hash: Option<&str>,
    ) -> Result<(String, u64, bool)> {
        let mut buf = Vec::new();
        let (hash, size) = hasher::hash_while_copying(&mut reader, &mut buf)?;

        if let Some(expected) = expected_hash {
            if expected != hash {
                return Err(EngineError::HashMismatch {
                    expected: expected.to_string(),
                    computed: hash,
                });
            }
        }

        let lock = self.hash_lock(&hash);
        let _guard = lock.lock();

        let key = Self::key_for(&hash);
        if self.file_store.exists(&key) {
            return Ok((hash, size, false));
        }
        self.file_store.put(&key, &buf)?;
        Ok((hash, size, true))
    }

    /// Opens a blob's payload for reading. Fails with `BlobMissing` if the
    /// payload is absent, regardless of whether the index still lists
    /// references to it (that drift is the reconciliation sweep's job to
    /// repair, not this call's).
    pub fn open(&self, hash: &str) -> Result<Box<dyn Read + Send>> {
        self.file_store
            .open(&Self::key_for(hash))
            .map_err(|_| EngineError::BlobMissing {
                hash: hash.to_string(),
            })
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.file_store.exists(&Self::key_for(hash))
    }

    /// Increments the reference count for `(hash, holder)`. Idempotent:
    /// acquiring the same `(blob, version)` pair twice is a no-op.
    pub fn acquire(&self, hash: &str, holder: &Uid, project: &str) -> Result<()> {
        let mut index = self.index.lock();
        let already = index
            .references
            .iter()
            .any(|r| r.blob_hash == hash && &r.version == holder);
        if !already {
            index.references.push(BlobReference {
                blob_hash: hash.to_string(),
                version: holder.clone(),
                project: project.to_string(),
            });
        }
        self.persist_index(&index)
    }

    /// Deletes the `(hash, holder)` reference. If the ref count reaches
    /// zero, the blob payload is deleted.
    pub fn release(&self, hash: &str, holder: &Uid) -> Result<()> {
        let zero;
        {
            let mut index = self.index.lock();
            index
                .references
                .retain(|r| !(r.blob_hash == hash && &r.version == holder));
            zero = index.ref_count(hash) == 0;
            self.persist_index(&index)?;
        }
        if zero {
            self.file_store.delete(&Self::key_for(hash))?;
        }
        Ok(())
    }

    /// Current reference count for `hash`, derived from `BlobReference`
    /// rows (the source of truth per the spec this engine follows).
    pub fn ref_count(&self, hash: &str) -> u64 {
        self.index.lock().ref_count(hash)
    }

    /// Recomputes nothing (the index already derives `ref_count` from rows
    /// on every call) but repairs the one drift this design allows: a
    /// crash between acquiring a reference and deleting a stale zero-ref
    /// payload. Removes any blob payload this process can see that has no
    /// surviving reference.
    pub fn sweep(&self) -> Result<u64> {
        let index = self.index.lock();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for r in &index.references {
            *counts.entry(r.blob_hash.clone()).or_insert(0) += 1;
        }
        let known_hashes: Vec<String> = counts.keys().cloned().collect();
        drop(index);

        let mut swept = 0u64;
        for prefix_entry in self.file_store.list_prefix("cas")? {
            let hash = match prefix_entry.rsplit('/').next() {
                Some(h) => h.to_string(),
                None => continue,
            };
            if hash == "_index.json" {
                continue;
            }
            if !known_hashes.contains(&hash) {
                self.file_store.delete(&prefix_entry)?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Removes references held by `holder` that were never attached to a
    /// completed version — used by the push worker's compensation routine
    /// on cancellation/failure, and by duplicate-detection's step 8c.
    pub fn release_all(&self, holder: &Uid, hashes: &[String]) -> Result<()> {
        for hash in hashes {
            self.release(hash, holder)?;
        }
        Ok(())
    }

    /// Every distinct blob hash `holder` currently references.
    fn hashes_for_holder(&self, holder: &Uid) -> Vec<String> {
        self.index
            .lock()
            .references
            .iter()
            .filter(|r| &r.version == holder)
            .map(|r| r.blob_hash.clone())
            .collect()
    }

    /// Releases every reference `holder` holds — the CAS side of deleting a
    /// `Version` (`spec.md` §3: "`BlobReference` ... deleted when the
    /// owning `Version` is deleted. ... deletion decrements [ref_count]").
    /// A blob whose count reaches zero has its payload deleted, same as any
    /// other `release`.
    pub fn release_version(&self, holder: &Uid) -> Result<()> {
        for hash in self.hashes_for_holder(holder) {
            self.release(&hash, holder)?;
        }
        Ok(())
    }
}
