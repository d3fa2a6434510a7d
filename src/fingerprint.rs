//! Content fingerprints.
//!
//! A [`Fingerprint`] is the lowercase hex SHA-256 digest of a page's raw
//! content bytes. The special [`Fingerprint::unknown`] value marks entries whose
//! content was never hashed (state rebuilt from disk); it can never equal a
//! real digest, so those entries always reclassify as updated.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const UNKNOWN_CONTENT: &str = "existing_file";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash raw content bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn of_str(content: &str) -> Self {
        Self::of_bytes(content.as_bytes())
    }

    /// Sentinel for content that exists locally but was never hashed.
    pub fn unknown() -> Self {
        Self(UNKNOWN_CONTENT.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CONTENT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
