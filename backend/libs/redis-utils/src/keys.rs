//! Hash-tag key construction.
//!
//! Redis Cluster hashes only the substring between the first `{` and the next `}`.
//! Every key a single script touches must share that tag, otherwise the script
//! fails with `CROSSSLOT` on a cluster.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key identifier must not be empty")]
    Empty,

    #[error("key identifier must not contain braces: {0}")]
    Braces(String),
}

/// Build `namespace:{id}`.
///
/// `namespace` may itself contain `:` separators (`coalesce:counter`).
pub fn hash_tagged(namespace: &str, id: &str) -> Result<String, KeyError> {
    if id.is_empty() {
        return Err(KeyError::Empty);
    }
    if id.contains('{') || id.contains('}') {
        return Err(KeyError::Braces(id.to_string()));
    }
    Ok(format!("{}:{{{}}}", namespace, id))
}

/// The substring Redis Cluster hashes for `key`, or the whole key if it has no tag.
pub fn hash_slot_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        let rest = &key[open + 1..];
        if let Some(close) = rest.find('}') {
            if close > 0 {
                return &rest[..close];
            }
        }
    }
    key
}
