//! Content-addressed node fingerprints.
//!
//! A fingerprint is the SHA-256 digest of a node's semantic identity:
//! `(api_class, canonicalized params, provider name, ordered upstream
//! fingerprints)`. Two nodes with the same fingerprint are interchangeable,
//! which makes the fingerprint the cache key and the basis for duplicate
//! elimination.

use crate::error::{DfmError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 node fingerprint.
///
/// Format: `sha256:<64 hex characters>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest raw bytes into a fingerprint.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Parse from a hex string, with or without the `sha256:` prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let hex_str = s.strip_prefix("sha256:").unwrap_or(s);

        if hex_str.len() != 64 {
            return Err(DfmError::Internal(format!(
                "fingerprint: expected 64 hex characters, got {}",
                hex_str.len()
            )));
        }

        let bytes = hex::decode(hex_str)
            .map_err(|e| DfmError::Internal(format!("fingerprint: invalid hex: {e}")))?;

        let array: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            DfmError::Internal(format!(
                "fingerprint: must be exactly 32 bytes, got {}",
                v.len()
            ))
        })?;

        Ok(Self(array))
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding without the prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = DfmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = DfmError;

    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(&s)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

/// Canonical encoding of a JSON value, suitable for hashing.
///
/// Object keys are emitted in lexicographic order regardless of the in-memory
/// map order, floats with no fractional part are re-encoded as integers so
/// `1.0` and `1` hash identically, and non-finite numbers are rejected
/// (serde_json cannot represent NaN, but adapters hand us values through
/// enough layers that the check is kept explicit).
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.extend_from_slice(i.to_string().as_bytes());
            } else if let Some(u) = n.as_u64() {
                out.extend_from_slice(u.to_string().as_bytes());
            } else if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(DfmError::Internal(
                        "fingerprint: non-finite number in params".to_string(),
                    ));
                }
                if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) {
                    out.extend_from_slice((f as i64).to_string().as_bytes());
                } else {
                    out.extend_from_slice(f.to_string().as_bytes());
                }
            }
        }
        Value::String(s) => {
            let quoted = serde_json::to_string(s)?;
            out.extend_from_slice(quoted.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                let quoted = serde_json::to_string(key)?;
                out.extend_from_slice(quoted.as_bytes());
                out.push(b':');
                // Key came out of the map it is being looked up in.
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out)?;
                }
            }
            out.push(b'}');
        }
    }
    Ok(())
}

/// Compute the fingerprint of one node.
///
/// Fields are length-prefixed so that no concatenation of different tuples
/// can collide, and the encoding carries a version tag so a future change to
/// canonicalization invalidates old cache entries instead of aliasing them.
pub fn node_fingerprint(
    api_class: &str,
    params: &Value,
    provider: &str,
    upstream: &[Fingerprint],
) -> Result<Fingerprint> {
    let mut hasher = Sha256::new();
    hasher.update(b"dfm.fingerprint.v1");

    let mut field = |hasher: &mut Sha256, bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    };

    field(&mut hasher, api_class.as_bytes());
    field(&mut hasher, &canonical_bytes(params)?);
    field(&mut hasher, provider.as_bytes());
    hasher.update((upstream.len() as u64).to_be_bytes());
    for fp in upstream {
        hasher.update(fp.as_bytes());
    }

    Ok(Fingerprint(hasher.finalize().into()))
}
