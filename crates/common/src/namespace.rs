//! Storage key namespacing.
//!
//! A single bucket can host several independent certificate stores as
//! long as every key is placed under the store's own prefix. Namespacing
//! is idempotent: a key that already lives under the prefix is returned
//! unchanged.

use std::borrow::Cow;

/// Path separator used between key segments
pub const SEPARATOR: char = '/';

/// Place `key` under `prefix`.
///
/// Returns `key` unchanged when it already starts with `prefix`. The
/// match is on raw text, not segments: with prefix `ssl` the key
/// `sslcert.pem` counts as namespaced. An empty prefix leaves every key
/// untouched.
pub fn namespace<'a>(prefix: &str, key: &'a str) -> Cow<'a, str> {
    let prefix = prefix.trim_end_matches(SEPARATOR);
    if prefix.is_empty() || key.starts_with(prefix) {
        return Cow::Borrowed(key);
    }

    let key = key.trim_start_matches(SEPARATOR);
    Cow::Owned(format!("{prefix}{SEPARATOR}{key}"))
}

/// A configured key prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches(SEPARATOR).to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Namespace a key under this prefix
    pub fn apply(&self, key: &str) -> String {
        namespace(&self.prefix, key).into_owned()
    }

    /// Namespace a listing prefix, ensuring it ends with a separator so
    /// that only keys below it match.
    ///
    /// With no prefix configured an empty listing prefix stays empty and
    /// matches every key.
    pub fn apply_dir(&self, prefix: &str) -> String {
        let mut dir = self.apply(prefix);
        if !dir.is_empty() && !dir.ends_with(SEPARATOR) {
            dir.push(SEPARATOR);
        }
        dir
    }
}
