//! PatchObject: JSON-Pointer-keyed patches applied atomically
//!
//! Keys are pointers without their leading `/`. A `null` value removes the
//! addressed property, any other value sets or replaces it. A patch is
//! checked as a whole before anything is applied, and application works on a
//! copy of the target, so a rejected patch never leaves partial changes.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Mapping of implicit-root JSON pointers to replacement values
pub type PatchObject = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("patch key must not be empty")]
    EmptyKey,
    #[error("patch key '{0}' must not end with the '-' array token")]
    AppendToken(String),
    #[error("patch key '{prefix}' is a prefix of patch key '{key}'")]
    OverlappingKeys { prefix: String, key: String },
    #[error("patch key '{0}' addresses a property whose parent does not exist")]
    MissingParent(String),
    #[error("patch key '{0}' addresses a child of a value that is neither an object nor an array")]
    NotAContainer(String),
    #[error("patch key '{0}' addresses an array element that does not exist")]
    InvalidIndex(String),
}

impl PatchError {
    /// Offending patch key, if the error is about a single key
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::EmptyKey => None,
            Self::AppendToken(k)
            | Self::MissingParent(k)
            | Self::NotAContainer(k)
            | Self::InvalidIndex(k) => Some(k),
            Self::OverlappingKeys { key, .. } => Some(key),
        }
    }
}

fn tokens(key: &str) -> Vec<&str> {
    key.split('/').collect()
}

/// Escape `token` for use inside a JSON pointer
pub fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Check the structural rules every patch must satisfy, independent of any target
///
/// # Errors
///
/// The first empty key, key ending in `-`, or pair of keys where one
/// addresses a prefix of the other.
pub fn check(patch: &PatchObject) -> Result<(), PatchError> {
    for key in patch.keys() {
        if key.is_empty() {
            return Err(PatchError::EmptyKey);
        }
        if tokens(key).last().is_some_and(|t| *t == "-") {
            return Err(PatchError::AppendToken(key.clone()));
        }
    }
    for prefix in patch.keys() {
        let covered = patch
            .keys()
            .find(|key| key.strip_prefix(prefix.as_str()).is_some_and(|rest| rest.starts_with('/')));
        if let Some(key) = covered {
            return Err(PatchError::OverlappingKeys {
                prefix: prefix.clone(),
                key: key.clone(),
            });
        }
    }
    Ok(())
}

/// Apply `patch` to a copy of `target`
///
/// # Errors
///
/// Any [`check`] violation, or a key whose parent path does not exist in
/// `target`. On error `target` is untouched and no result is produced.
pub fn apply(target: &Value, patch: &PatchObject) -> Result<Value, PatchError> {
    check(patch)?;
    let mut patched = target.clone();
    for (key, value) in patch {
        let parts = tokens(key);
        let (last, parents) = parts.split_last().ok_or(PatchError::EmptyKey)?;
        let parent_pointer: String = parents.iter().map(|t| format!("/{t}")).collect();
        let parent = patched
            .pointer_mut(&parent_pointer)
            .ok_or_else(|| PatchError::MissingParent(key.clone()))?;
        let last = unescape(last);
        match parent {
            Value::Object(map) => {
                if value.is_null() {
                    map.remove(&last);
                } else {
                    map.insert(last, value.clone());
                }
            }
            Value::Array(items) => {
                let index: usize = last
                    .parse()
                    .map_err(|_| PatchError::InvalidIndex(key.clone()))?;
                if index >= items.len() {
                    return Err(PatchError::InvalidIndex(key.clone()));
                }
                if value.is_null() {
                    items.remove(index);
                } else {
                    items[index] = value.clone();
                }
            }
            _ => return Err(PatchError::NotAContainer(key.clone())),
        }
    }
    Ok(patched)
}
