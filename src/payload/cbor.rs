//! Deterministic CBOR.
//!
//! Values are serialized into a `ciborium::Value` tree first so map entries
//! can be put into the core deterministic order (bytewise order of each key's
//! own encoding) before the tree is written. Integers already use the
//! shortest form. Timestamps go through their serde representation
//! (RFC 3339 text for chrono), which is fixed per value.

use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::PayloadError;

pub(super) fn to_canonical_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, PayloadError> {
    let tree = Value::serialized(value).map_err(|e| PayloadError::Encode(e.to_string()))?;
    let tree = canonicalize(tree)?;
    write(&tree)
}

pub(super) fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, PayloadError> {
    ciborium::from_reader(data).map_err(|e| PayloadError::InvalidType(e.to_string()))
}

fn write(value: &Value) -> Result<Vec<u8>, PayloadError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| PayloadError::Encode(e.to_string()))?;
    Ok(buf)
}

fn canonicalize(value: Value) -> Result<Value, PayloadError> {
    Ok(match value {
        Value::Map(entries) => {
            let mut keyed = entries
                .into_iter()
                .map(|(k, v)| {
                    let k = canonicalize(k)?;
                    let v = canonicalize(v)?;
                    Ok((write(&k)?, k, v))
                })
                .collect::<Result<Vec<_>, PayloadError>>()?;
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Map(keyed.into_iter().map(|(_, k, v)| (k, v)).collect())
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(canonicalize)
                .collect::<Result<Vec<_>, PayloadError>>()?,
        ),
        Value::Tag(tag, inner) => Value::Tag(tag, Box::new(canonicalize(*inner)?)),
        other => other,
    })
}
