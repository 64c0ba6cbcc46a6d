//! Deterministic content addressing for synthesized audio.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content address of a synthesized audio artifact.
///
/// Derived from the (text, voice, provider) triple. Identical triples
/// always yield the same fingerprint; fields are length-prefixed before
/// hashing so no shifting of bytes between fields can collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint for a (text, voice, provider) triple.
    ///
    /// Text is trimmed first so incidental surrounding whitespace does
    /// not fragment the cache. No salt; stable across restarts.
    pub fn derive(text: &str, voice: &str, provider: &str) -> Self {
        let mut hasher = Sha256::new();
        for field in [text.trim(), voice, provider] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Parse a fingerprint from a stored artifact file stem.
    ///
    /// Returns `None` for anything that is not a 64-char lowercase hex
    /// digest, so foreign files in the cache directory are ignored.
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == 64
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Fingerprint(s.to_string()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = Fingerprint::derive("Breathe in.", "alloy", "openai");
        let b = Fingerprint::derive("Breathe in.", "alloy", "openai");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn any_field_change_changes_the_fingerprint() {
        let base = Fingerprint::derive("Breathe in.", "alloy", "openai");
        assert_ne!(base, Fingerprint::derive("Breathe out.", "alloy", "openai"));
        assert_ne!(base, Fingerprint::derive("Breathe in.", "nova", "openai"));
        assert_ne!(base, Fingerprint::derive("Breathe in.", "alloy", "elevenlabs"));
    }

    #[test]
    fn field_boundaries_cannot_shift() {
        // "ab" + "c" must not collide with "a" + "bc".
        let a = Fingerprint::derive("ab", "c", "p");
        let b = Fingerprint::derive("a", "bc", "p");
        assert_ne!(a, b);
    }

    #[test]
    fn surrounding_whitespace_is_normalized() {
        let a = Fingerprint::derive("  Breathe in.\n", "alloy", "openai");
        let b = Fingerprint::derive("Breathe in.", "alloy", "openai");
        assert_eq!(a, b);
    }

    #[test]
    fn from_hex_round_trips() {
        let fp = Fingerprint::derive("hello", "alloy", "openai");
        assert_eq!(Fingerprint::from_hex(fp.as_str()), Some(fp));
    }

    #[test]
    fn from_hex_rejects_foreign_names() {
        assert!(Fingerprint::from_hex("not-a-hash").is_none());
        assert!(Fingerprint::from_hex(&"A".repeat(64)).is_none());
        assert!(Fingerprint::from_hex(&"0".repeat(63)).is_none());
    }
}
