//! Key path validation and the `service/<tribe>/<service>/...` convention.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("static segment pattern"));

const SERVICE_ROOT: &str = "service";

#[derive(Debug, Error, PartialEq)]
pub enum PathError {
    #[error("key path is empty")]
    Empty,
    #[error("key path {path:?} has an empty segment")]
    EmptySegment { path: String },
    #[error("key path {path:?} has invalid segment {segment:?}")]
    InvalidSegment { path: String, segment: String },
    #[error("prefix {0:?} contains a control character")]
    InvalidPrefix(String),
}

/// A validated hierarchical key path such as `service/payments/ledger/default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyPath(String);

impl KeyPath {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        if path.is_empty() {
            return Err(PathError::Empty);
        }
        for segment in path.split('/') {
            if segment.is_empty() {
                return Err(PathError::EmptySegment {
                    path: path.to_string(),
                });
            }
            if !SEGMENT_RE.is_match(segment) {
                return Err(PathError::InvalidSegment {
                    path: path.to_string(),
                    segment: segment.to_string(),
                });
            }
        }
        Ok(Self(path.to_string()))
    }

    /// Default flag key created when a service is bootstrapped.
    pub fn service_default(tribe: &str, service: &str) -> Result<Self, PathError> {
        Self::parse(&format!("{SERVICE_ROOT}/{tribe}/{service}/default"))
    }

    /// Prefix every key of a service lives under.
    pub fn service_prefix(tribe: &str, service: &str) -> Result<Self, PathError> {
        Self::parse(&format!("{SERVICE_ROOT}/{tribe}/{service}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Service a key belongs to, used to look up recommended canary hosts.
    ///
    /// Paths with more than three segments follow `service/<tribe>/<service>/...`
    /// and yield the third segment; shorter paths yield their parent segment.
    pub fn service_name(&self) -> Option<&str> {
        let segments: Vec<&str> = self.0.split('/').collect();
        match segments.len() {
            n if n > 3 => Some(segments[2]),
            n if n >= 2 => Some(segments[n - 2]),
            _ => None,
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for KeyPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<KeyPath> for String {
    fn from(path: KeyPath) -> Self {
        path.0
    }
}

/// Check a scan prefix. Empty means "every key".
pub fn validate_prefix(prefix: &str) -> Result<(), PathError> {
    if prefix.chars().any(char::is_control) {
        return Err(PathError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}
