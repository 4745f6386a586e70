//! Versioned payload codec.
//!
//! Moves generically-typed values through RPC messages as a tagged byte blob:
//!
//! | tag | version    | body                                          |
//! |-----|------------|-----------------------------------------------|
//! | 0   | `JsonV1`   | plain JSON of the value                       |
//! | 1   | `JsonV2`   | JSON object envelope `{"value": ...}`         |
//! | 2   | `Cbor`     | deterministic CBOR (sorted map keys)          |
//!
//! The writer picks the tag; the reader never sniffs content and decodes with
//! whatever the payload's own tag names.

mod cbor;
pub mod registry;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Payload codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// The version tag is not one this build understands.
    #[error("unsupported encoding version: {0}")]
    UnsupportedVersion(u32),

    /// The payload content does not fit the destination type.
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// The value could not be serialized with the requested format.
    #[error("encode error: {0}")]
    Encode(String),
}

/// Sub-format named by a payload's version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingVersion {
    JsonV1,
    JsonV2,
    Cbor,
}

impl EncodingVersion {
    pub const ALL: [EncodingVersion; 3] = [
        EncodingVersion::JsonV1,
        EncodingVersion::JsonV2,
        EncodingVersion::Cbor,
    ];

    /// Wire tag.
    pub fn tag(self) -> u32 {
        match self {
            EncodingVersion::JsonV1 => 0,
            EncodingVersion::JsonV2 => 1,
            EncodingVersion::Cbor => 2,
        }
    }
}

impl TryFrom<u32> for EncodingVersion {
    type Error = PayloadError;

    fn try_from(tag: u32) -> Result<Self, PayloadError> {
        match tag {
            0 => Ok(EncodingVersion::JsonV1),
            1 => Ok(EncodingVersion::JsonV2),
            2 => Ok(EncodingVersion::Cbor),
            other => Err(PayloadError::UnsupportedVersion(other)),
        }
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncodingVersion::JsonV1 => "json_v1",
            EncodingVersion::JsonV2 => "json_v2",
            EncodingVersion::Cbor => "cbor",
        };
        f.write_str(name)
    }
}

/// Tagged byte blob. Wire shape: `{ version: u32, data: bytes }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedPayload {
    pub version: u32,
    pub data: Bytes,
}

impl VersionedPayload {
    /// Sub-format named by the tag.
    pub fn encoding(&self) -> Result<EncodingVersion, PayloadError> {
        EncodingVersion::try_from(self.version)
    }
}

#[derive(Serialize)]
struct JsonV2Out<'a, T: ?Sized> {
    value: &'a T,
}

#[derive(Deserialize)]
struct JsonV2In<T> {
    value: T,
}

/// Serialize `value` with the sub-format named by `version`.
pub fn encode<T>(value: &T, version: EncodingVersion) -> Result<VersionedPayload, PayloadError>
where
    T: Serialize + ?Sized,
{
    let data = match version {
        EncodingVersion::JsonV1 => {
            serde_json::to_vec(value).map_err(|e| PayloadError::Encode(e.to_string()))?
        }
        EncodingVersion::JsonV2 => serde_json::to_vec(&JsonV2Out { value })
            .map_err(|e| PayloadError::Encode(e.to_string()))?,
        EncodingVersion::Cbor => cbor::to_canonical_vec(value)?,
    };
    Ok(VersionedPayload {
        version: version.tag(),
        data: Bytes::from(data),
    })
}

/// Deserialize a payload according to its own version tag.
pub fn decode<T: DeserializeOwned>(payload: &VersionedPayload) -> Result<T, PayloadError> {
    match payload.encoding()? {
        EncodingVersion::JsonV1 => serde_json::from_slice(&payload.data)
            .map_err(|e| PayloadError::InvalidType(e.to_string())),
        EncodingVersion::JsonV2 => serde_json::from_slice::<JsonV2In<T>>(&payload.data)
            .map(|envelope| envelope.value)
            .map_err(|e| PayloadError::InvalidType(e.to_string())),
        EncodingVersion::Cbor => cbor::from_slice(&payload.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Report {
        feed: String,
        answer: i64,
        observers: Vec<u8>,
        at: chrono::DateTime<Utc>,
        extra: BTreeMap<String, Vec<u64>>,
    }

    fn sample() -> Report {
        let mut extra = BTreeMap::new();
        extra.insert("b".to_string(), vec![2, 3]);
        extra.insert("a".to_string(), vec![]);
        Report {
            feed: "ETH/USD".to_string(),
            answer: -12,
            observers: vec![0, 1, 255],
            at: Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
            extra,
        }
    }

    #[test]
    fn test_each_version_decodes_what_it_encoded() {
        for version in EncodingVersion::ALL {
            let payload = encode(&sample(), version).unwrap();
            assert_eq!(payload.version, version.tag());
            let back: Report = decode(&payload).unwrap();
            assert_eq!(back, sample(), "version {version}");
        }
    }

    #[test]
    fn test_reader_follows_payload_tag_not_its_default() {
        // Written as JSONv1 while everything else in the system defaults to CBOR.
        let payload = encode(&sample(), EncodingVersion::JsonV1).unwrap();
        assert_eq!(payload.encoding().unwrap(), EncodingVersion::JsonV1);
        let back: Report = decode(&payload).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_json_v2_is_an_envelope() {
        let payload = encode(&42u32, EncodingVersion::JsonV2).unwrap();
        assert_eq!(&payload.data[..], br#"{"value":42}"#);

        // Unknown sibling keys from newer writers are ignored.
        let newer = VersionedPayload {
            version: 1,
            data: Bytes::from_static(br#"{"value":42,"schema":"v3"}"#),
        };
        assert_eq!(decode::<u32>(&newer).unwrap(), 42);
    }

    #[test]
    fn test_unsupported_version() {
        let payload = VersionedPayload {
            version: 7,
            data: Bytes::from_static(b"{}"),
        };
        let err = decode::<u32>(&payload).unwrap_err();
        assert_eq!(err, PayloadError::UnsupportedVersion(7));
    }

    #[test]
    fn test_invalid_type_for_every_version() {
        for version in EncodingVersion::ALL {
            let payload = encode(&"not a number", version).unwrap();
            let err = decode::<u64>(&payload).unwrap_err();
            assert!(
                matches!(err, PayloadError::InvalidType(_)),
                "version {version}: {err:?}"
            );
        }
    }

    #[test]
    fn test_cbor_is_deterministic_for_hash_maps() {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for i in 0..64u32 {
            first.insert(format!("key-{i}"), i);
        }
        for i in (0..64u32).rev() {
            second.insert(format!("key-{i}"), i);
        }
        let a = encode(&first, EncodingVersion::Cbor).unwrap();
        let b = encode(&second, EncodingVersion::Cbor).unwrap();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_version_tags() {
        for version in EncodingVersion::ALL {
            assert_eq!(EncodingVersion::try_from(version.tag()).unwrap(), version);
        }
        assert_eq!(
            EncodingVersion::try_from(3).unwrap_err(),
            PayloadError::UnsupportedVersion(3)
        );
    }
}
