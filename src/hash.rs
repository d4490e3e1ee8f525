//! Content hashing and cache key derivation.
//!
//! Every cache identity in the crate is a SHA-256 digest of input bytes:
//! template source, render contexts, and compiled programs.

use crate::value::RenderContext;
use crate::FORMAT_VERSION;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest of some byte content. Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid hash '{s}': {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("invalid hash '{s}': expected 32 bytes"))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ContentHash::from_hex(&value)
    }
}

pub fn content_hash(bytes: &[u8]) -> ContentHash {
    ContentHash::of(bytes)
}

/// Digest of a render context's canonical JSON form.
pub fn context_hash(context: &RenderContext) -> ContentHash {
    // serde_json maps are ordered by key, so the encoding is canonical.
    let canonical = context.to_canonical_json().to_string();
    ContentHash::of(canonical.as_bytes())
}

// ─── Cache keys ───────────────────────────────────────────────

/// `hex(sha256(template_path || content || serialized_options)) + "-" + FORMAT_VERSION`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a compiled template. `options` is anything that influences
    /// the produced bytecode.
    pub fn derive<O: Serialize>(
        template_path: &str,
        content: &[u8],
        options: &O,
    ) -> Result<Self, serde_json::Error> {
        let serialized = serde_json::to_vec(options)?;
        let mut hasher = Sha256::new();
        hasher.update(template_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(content);
        hasher.update([0u8]);
        hasher.update(&serialized);
        Ok(Self(format!(
            "{}-{}",
            hex::encode(hasher.finalize()),
            FORMAT_VERSION
        )))
    }

    /// Key for rendered output of a compiled template under one context.
    pub fn for_render(compiled: &CacheKey, context: &ContentHash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"render\0");
        hasher.update(compiled.0.as_bytes());
        hasher.update(context.as_bytes());
        Self(format!("{}-{}", hex::encode(hasher.finalize()), FORMAT_VERSION))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Format-version suffix of the key.
    pub fn version(&self) -> Option<u32> {
        self.0.rsplit_once('-').and_then(|(_, v)| v.parse().ok())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blob name of a key in the persisted tier: hex digest of the key.
pub fn blob_name(key: &str) -> String {
    ContentHash::of(key.as_bytes()).to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_round_trips_through_hex() {
        let h = content_hash(b"hello");
        assert_eq!(ContentHash::from_hex(&h.to_hex()), Ok(h));
        assert!(ContentHash::from_hex("abc").is_err());
    }

    #[test]
    fn key_is_deterministic_and_versioned() {
        let opts = json!({"level": "basic"});
        let a = CacheKey::derive("a.tpl", b"{{ x }}", &opts).unwrap();
        let b = CacheKey::derive("a.tpl", b"{{ x }}", &opts).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.version(), Some(FORMAT_VERSION));
    }

    #[test]
    fn key_changes_with_any_input() {
        let opts = json!({"level": "basic"});
        let base = CacheKey::derive("a.tpl", b"x", &opts).unwrap();
        assert_ne!(base, CacheKey::derive("b.tpl", b"x", &opts).unwrap());
        assert_ne!(base, CacheKey::derive("a.tpl", b"y", &opts).unwrap());
        assert_ne!(
            base,
            CacheKey::derive("a.tpl", b"x", &json!({"level": "maximum"})).unwrap()
        );
    }

    #[test]
    fn path_and_content_boundary_is_unambiguous() {
        let opts = json!(null);
        let a = CacheKey::derive("ab", b"c", &opts).unwrap();
        let b = CacheKey::derive("a", b"bc", &opts).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn context_hash_ignores_insertion_order() {
        let a = RenderContext::new().with("x", 1).with("y", "two");
        let b = RenderContext::new().with("y", "two").with("x", 1);
        assert_eq!(context_hash(&a), context_hash(&b));
    }
}
