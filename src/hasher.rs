//! # Content Hashing
//!
//! Every content hash in this engine — blob keys, manifest entry hashes, and
//! the manifest hash itself — is SHA-256, hex-encoded lowercase, per the
//! on-disk manifest format. Streaming reads keep memory bounded regardless
//! of file size.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Size of the read buffer for streaming hash computation (64 KiB).
const BUF_SIZE: usize = 64 * 1024;

/// Computes the SHA-256 hash of a file's contents, returning a lowercase hex
/// string.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let bytes_read = file.read(&mut buf)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buf[..bytes_read]);
    }

    Ok(hex_lower(&hasher.finalize()))
}

/// Computes the SHA-256 hash of a byte slice already in memory.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_lower(&hasher.finalize())
}

/// Streams an arbitrary reader through SHA-256 while copying it to `sink`,
/// returning the hex digest and byte count. Used by the blob store so
/// content never needs to be buffered twice (once to hash, once to store).
pub fn hash_while_copying<R: Read, W: std::io::Write>(
    mut reader: R,
    mut sink: W,
) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = reader.read(&mut buf)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buf[..bytes_read]);
        sink.write_all(&buf[..bytes_read])?;
        total += bytes_read as u64;
    }

    Ok((hex_lower(&hasher.finalize()), total))
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Returns the first `n` characters of a hash for display/logging purposes.
pub fn short_hash(hash: &str, n: usize) -> &str {
    &hash[..n.min(hash.len())]
}

/// Splits a hash into a 2-char prefix and remaining suffix for directory
/// sharding: `cas/<hh>/<hash>`. Content-addressable stores use this to
/// avoid placing millions of files in a single directory.
pub fn shard_path(hash: &str) -> (&str, &str) {
    hash.split_at(2.min(hash.len()))
}
