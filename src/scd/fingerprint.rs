//! Content fingerprints over tracked attributes.
//!
//! # Canonicalization
//!
//! ```text
//! Fingerprint = SHA256(
//!   "DIMFP_V2" || 0x00 ||
//!   for name in sorted(tracked): name || "=" || canonical_json(value) || 0x1f
//! )
//! ```
//!
//! An absent tracked attribute encodes as JSON `null`. Object values encode
//! with sorted keys (serde_json's default map ordering). Floats with an
//! integral value below 2^53 encode as integers, at any depth, so `5000` and
//! `5000.0` fingerprint alike.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::types::{Attributes, Measures};

/// Fingerprint version tag - change when the encoding changes.
pub const FINGERPRINT_VERSION: &str = "DIMFP_V2";

const FIELD_SEPARATOR: u8 = 0x1f;

/// 2^53: beyond this an f64 no longer holds every integer exactly.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// The attribute subset that participates in change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAttributes {
    names: Vec<String>,
}

impl TrackedAttributes {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }

    /// Hex SHA-256 over the tracked subset of `attrs`.
    pub fn fingerprint(&self, attrs: &Attributes) -> String {
        let encoding = encode_fields(
            self.names
                .iter()
                .map(|n| (n.as_str(), attrs.get(n).unwrap_or(&Value::Null))),
        );
        hash_hex(&encoding)
    }
}

/// Canonical encoding of every attribute. Used as a deterministic tie-break.
pub fn canonical_attributes(attrs: &Attributes) -> Vec<u8> {
    encode_fields(attrs.iter().map(|(k, v)| (k.as_str(), v)))
}

/// Canonical encoding of measures. Floats use their IEEE bit pattern so that
/// `0.1 + 0.2` and `0.3` stay distinct.
pub fn canonical_measures(measures: &Measures) -> Vec<u8> {
    let mut out = Vec::with_capacity(measures.len() * 24);
    for (name, value) in measures {
        out.extend_from_slice(name.as_bytes());
        out.push(b'=');
        out.extend_from_slice(&value.to_bits().to_be_bytes());
        out.push(FIELD_SEPARATOR);
    }
    out
}

fn encode_fields<'a, I>(fields: I) -> Vec<u8>
where
    I: Iterator<Item = (&'a str, &'a Value)>,
{
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(FINGERPRINT_VERSION.as_bytes());
    out.push(0);
    for (name, value) in fields {
        out.extend_from_slice(name.as_bytes());
        out.push(b'=');
        out.extend_from_slice(canonical_value(value).to_string().as_bytes());
        out.push(FIELD_SEPARATOR);
    }
    out
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_INTEGER => Value::from(f as i64),
            _ => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
