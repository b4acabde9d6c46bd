//! Cache keys and the codec that maps application keys onto them.
//!
//! Both tiers are addressed with the same canonical key, so a value written to
//! Tier-2 by one process is found under the same slot by every other process
//! that uses the same namespace.
//!
//! ## Key Format
//!
//! `{namespace}:{application key}`, or the bare application key when no
//! namespace is configured.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use crate::error::CacheError;

/// Default upper bound on canonical key length in bytes.
pub const DEFAULT_MAX_KEY_LEN: usize = 1024;

/// Canonical, immutable cache key. Cloning is a reference-count bump.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Returns the canonical key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:?})", &*self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Maps application keys into the key space shared by both tiers.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    namespace: Option<String>,
    max_len: usize,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self {
            namespace: None,
            max_len: DEFAULT_MAX_KEY_LEN,
        }
    }
}

impl KeyCodec {
    /// Create a codec that prefixes every key with `namespace`.
    ///
    /// An empty namespace is treated as no namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: (!namespace.is_empty()).then_some(namespace),
            max_len: DEFAULT_MAX_KEY_LEN,
        }
    }

    /// Override the maximum canonical key length.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// The configured namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Canonicalize an application key.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidKey` if the key is empty, contains control
    /// characters, or exceeds the maximum length once namespaced.
    pub fn encode(&self, key: &str) -> Result<CacheKey, CacheError> {
        if key.is_empty() {
            return Err(CacheError::invalid_key(key, "key must not be empty"));
        }
        if key.chars().any(char::is_control) {
            return Err(CacheError::invalid_key(
                key,
                "key must not contain control characters",
            ));
        }

        let canonical = match &self.namespace {
            Some(ns) => format!("{ns}:{key}"),
            None => key.to_string(),
        };

        if canonical.len() > self.max_len {
            return Err(CacheError::invalid_key(
                key,
                format!(
                    "canonical key is {} bytes, limit is {}",
                    canonical.len(),
                    self.max_len
                ),
            ));
        }

        Ok(CacheKey(Arc::from(canonical)))
    }

    /// Strip the namespace from a canonical key, returning the application key.
    pub fn decode<'a>(&self, key: &'a CacheKey) -> &'a str {
        let raw = key.as_str();
        match &self.namespace {
            Some(ns) => raw
                .strip_prefix(ns.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(raw),
            None => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_key() {
        let codec = KeyCodec::new("orders");
        let key = codec.encode("42").unwrap();
        assert_eq!(key.as_str(), "orders:42");
        assert_eq!(codec.decode(&key), "42");
    }

    #[test]
    fn test_same_key_same_slot() {
        let codec = KeyCodec::new("svc");
        let a = codec.encode("user:1").unwrap();
        let b = codec.encode("user:1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "svc:user:1");
    }

    #[test]
    fn test_empty_namespace_is_no_namespace() {
        let codec = KeyCodec::new("");
        assert_eq!(codec.namespace(), None);
        assert_eq!(codec.encode("k").unwrap().as_str(), "k");
    }

    #[test]
    fn test_rejects_empty_key() {
        let err = KeyCodec::default().encode("").unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[test]
    fn test_rejects_control_characters() {
        let err = KeyCodec::default().encode("a\nb").unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[test]
    fn test_rejects_too_long_key() {
        let codec = KeyCodec::new("ns").with_max_len(8);
        assert!(codec.encode("12345").is_ok());
        assert!(codec.encode("123456").is_err());
    }
}
