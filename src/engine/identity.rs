//! Canary identity derivation and name validation
//!
//! A canary's identity `{name, hash, path}` is immutable after construction
//! and derives every persisted-state location. The hash is SHA-256 over the
//! first readable candidate source file supplied by the registering caller;
//! when no candidate is readable the name alone is hashed and the weaker
//! guarantee is logged.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{IdentityError, IdentityResult};

/// Maximum canary name length
pub const MAX_NAME_LEN: usize = 50;

/// Immutable identity of one registered canary
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanaryIdentifiers {
    name: String,
    hash: String,
    path: PathBuf,
    /// True when the hash fell back to the name-only fingerprint
    degraded: bool,
}

impl CanaryIdentifiers {
    /// Derive an identity from a name and caller-supplied candidate files
    ///
    /// Candidates are tried in order (typically the compiled artifact first,
    /// then the raw source, e.g. via `file!()`). The first readable one
    /// contributes the content hash and the resolved path. An unreadable set
    /// degrades to a name-only hash, logged as a warning.
    pub fn derive(name: impl Into<String>, candidates: &[&Path]) -> IdentityResult<Self> {
        let name = name.into();
        validate_name(&name)?;

        for candidate in candidates {
            match fs::read(candidate) {
                Ok(bytes) => {
                    let path = candidate
                        .canonicalize()
                        .unwrap_or_else(|_| candidate.to_path_buf());
                    return Ok(Self {
                        name,
                        hash: hex_sha256(&bytes),
                        path,
                        degraded: false,
                    });
                }
                Err(err) => {
                    tracing::debug!(
                        candidate = %candidate.display(),
                        error = %err,
                        "identity candidate unreadable, trying next"
                    );
                }
            }
        }

        tracing::warn!(
            name = %name,
            "no identity candidate readable, falling back to name-only hash"
        );
        Ok(Self::fallback(name, candidates.first().map(|p| p.to_path_buf())))
    }

    /// Derive a degraded identity from the name alone
    ///
    /// Useful for tests and for activities with no backing source file.
    pub fn from_name_only(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::fallback(name, None)
    }

    fn fallback(name: String, path: Option<PathBuf>) -> Self {
        let hash = hex_sha256(name.as_bytes());
        Self {
            name,
            hash,
            path: path.unwrap_or_default(),
            degraded: true,
        }
    }

    /// The user-supplied name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hex-encoded SHA-256 content fingerprint
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The first 12 hex characters of the fingerprint, for filenames
    pub fn short_hash(&self) -> &str {
        &self.hash[..12]
    }

    /// The resolved location of the registering source
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the hash fell back to the name-only fingerprint
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

impl fmt::Display for CanaryIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.short_hash())
    }
}

/// Validate a canary name against the filesystem-safety pattern
///
/// Names must be non-empty, at most [`MAX_NAME_LEN`] characters, and drawn
/// from `[A-Za-z0-9_-]`. Identity values feed directly into file names, so
/// this is a configuration error, not a recoverable one.
pub fn validate_name(name: &str) -> IdentityResult<()> {
    if name.is_empty() {
        return Err(IdentityError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(IdentityError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
            limit: MAX_NAME_LEN,
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(IdentityError::UnsafeName(name.to_string()));
    }
    Ok(())
}

/// Hex-encoded SHA-256 digest of a byte slice
pub(crate) fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_derive_from_readable_file() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("canary.rs");
        let mut file = std::fs::File::create(&source).unwrap();
        writeln!(file, "fn main() {{}}").unwrap();

        let ids = CanaryIdentifiers::derive("login_check", &[&source]).unwrap();
        assert_eq!(ids.name(), "login_check");
        assert_eq!(ids.hash().len(), 64);
        assert!(!ids.is_degraded());
        assert!(ids.path().ends_with("canary.rs"));
    }

    #[test]
    fn test_derive_falls_back_through_candidates() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("compiled.bin");
        let source = temp.path().join("canary.rs");
        std::fs::write(&source, b"tick").unwrap();

        let ids = CanaryIdentifiers::derive("c1", &[&missing, &source]).unwrap();
        assert!(!ids.is_degraded());
        assert_eq!(ids.hash(), &hex_sha256(b"tick"));
    }

    #[test]
    fn test_derive_degrades_to_name_hash() {
        let missing = Path::new("/nonexistent/canary.rs");
        let ids = CanaryIdentifiers::derive("c2", &[missing]).unwrap();
        assert!(ids.is_degraded());
        assert_eq!(ids.hash(), &hex_sha256(b"c2"));
    }

    #[test]
    fn test_same_content_same_hash() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.rs");
        let b = temp.path().join("b.rs");
        std::fs::write(&a, b"identical").unwrap();
        std::fs::write(&b, b"identical").unwrap();

        let ia = CanaryIdentifiers::derive("a", &[&a]).unwrap();
        let ib = CanaryIdentifiers::derive("b", &[&b]).unwrap();
        assert_eq!(ia.hash(), ib.hash());
        assert_ne!(ia.name(), ib.name());
    }

    #[test]
    fn test_validate_name_rejects_unsafe() {
        assert!(validate_name("ok_name-1").is_ok());
        assert!(matches!(
            validate_name("bad/name"),
            Err(IdentityError::UnsafeName(_))
        ));
        assert!(matches!(
            validate_name("space name"),
            Err(IdentityError::UnsafeName(_))
        ));
        assert!(matches!(validate_name(""), Err(IdentityError::EmptyName)));
        assert!(matches!(
            validate_name(&"x".repeat(51)),
            Err(IdentityError::NameTooLong { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_valid_names_roundtrip(name in "[A-Za-z0-9_-]{1,50}") {
            prop_assert!(validate_name(&name).is_ok());
            let ids = CanaryIdentifiers::from_name_only(name.clone());
            prop_assert_eq!(ids.name(), name.as_str());
            prop_assert_eq!(ids.hash().len(), 64);
        }

        #[test]
        fn prop_names_with_unsafe_chars_rejected(
            prefix in "[A-Za-z0-9_-]{0,10}",
            bad in "[^A-Za-z0-9_-]",
            suffix in "[A-Za-z0-9_-]{0,10}",
        ) {
            let name = format!("{prefix}{bad}{suffix}");
            prop_assert!(validate_name(&name).is_err());
        }
    }
}
