//! Server version probing helpers.
//!
//! Adapters confirm liveness with a version query on connect; the reported
//! string is kept verbatim alongside a parsed dotted version so feature
//! dispatch (Cassandra v2 vs v3, Redshift routine reconstruction) can compare
//! numerically.

use serde::{Deserialize, Serialize};

/// Version details captured by the connect-time probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Product name, e.g. "PostgreSQL".
    pub name: String,
    /// Dotted numeric version, e.g. "12.3".
    pub version: String,
    /// The raw string the server reported.
    pub string: String,
}

impl VersionInfo {
    /// Build version info from a raw probe result, extracting the first
    /// dotted number run. Falls back to "0" when nothing numeric appears.
    pub fn from_probe(name: impl Into<String>, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let version = extract_version(&raw).unwrap_or_else(|| "0".to_string());
        Self {
            name: name.into(),
            version,
            string: raw,
        }
    }
}

/// Pull the first `digits(.digits)*` run out of a version banner.
fn extract_version(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let start = bytes.iter().position(|b| b.is_ascii_digit())?;
    let mut end = start;
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        end += 1;
    }
    // Trim a trailing dot ("9.6." in some banners).
    let mut slice = &raw[start..end];
    while slice.ends_with('.') {
        slice = &slice[..slice.len() - 1];
    }
    if slice.is_empty() {
        None
    } else {
        Some(slice.to_string())
    }
}

/// Compare two dotted versions numerically, component by component.
///
/// Components beyond the shorter version are ignored, so `"8.0.2"` and `"8"`
/// compare equal. Non-numeric components compare as 0.
pub fn version_compare(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let av = parse(a);
    let bv = parse(b);

    for (x, y) in av.iter().zip(bv.iter()) {
        match x.cmp(y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}
