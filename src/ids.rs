//! # Identifiers
//!
//! `Version`, `Push`, and `DownloadRequest` each carry a random external id.
//! The spec describing this engine calls for "a 128-bit random identifier,
//! 16-hex-char external form" — internally inconsistent, since 128 bits
//! needs 32 hex characters to render. This crate follows the stated
//! external form: 16 lowercase hex characters, drawn from 8 random bytes
//! (64 bits of entropy), the same width git uses for short object ids. See
//! `DESIGN.md` for the reasoning.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(String);

impl Uid {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let mut s = String::with_capacity(16);
        for b in bytes {
            s.push_str(&format!("{b:02x}"));
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(s)
    }
}
