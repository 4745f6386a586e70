//! Property tests for the versioned payload codec.

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use relay_loop::payload::{decode, encode, EncodingVersion, PayloadError, VersionedPayload};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Report {
    feed: String,
    round: u64,
    answer: i64,
    tags: BTreeMap<String, bool>,
    signers: Vec<u8>,
    note: Option<String>,
}

fn any_version() -> impl Strategy<Value = EncodingVersion> {
    prop::sample::select(EncodingVersion::ALL.to_vec())
}

fn any_report() -> impl Strategy<Value = Report> {
    (
        ".{0,24}",
        any::<u64>(),
        any::<i64>(),
        prop::collection::btree_map("[a-z]{1,8}", any::<bool>(), 0..6),
        prop::collection::vec(any::<u8>(), 0..16),
        prop::option::of("[ -~]{0,16}"),
    )
        .prop_map(|(feed, round, answer, tags, signers, note)| Report {
            feed,
            round,
            answer,
            tags,
            signers,
            note,
        })
}

proptest! {
    #[test]
    fn decode_inverts_encode(report in any_report(), version in any_version()) {
        let payload = encode(&report, version).unwrap();
        prop_assert_eq!(payload.version, version.tag());
        prop_assert_eq!(decode::<Report>(&payload).unwrap(), report);
    }

    #[test]
    fn cbor_ignores_map_insertion_order(entries in prop::collection::btree_map("[a-z0-9]{1,12}", any::<i32>(), 0..24)) {
        let forward: HashMap<_, _> = entries.iter().collect();
        let mut reversed = HashMap::with_capacity(entries.len());
        for (k, v) in entries.iter().rev() {
            reversed.insert(k, v);
        }
        let a = encode(&forward, EncodingVersion::Cbor).unwrap();
        let b = encode(&reversed, EncodingVersion::Cbor).unwrap();
        prop_assert_eq!(a.data, b.data);
    }

    #[test]
    fn unknown_tags_are_rejected(tag in 3u32.., data in prop::collection::vec(any::<u8>(), 0..32)) {
        let payload = VersionedPayload { version: tag, data: data.into() };
        prop_assert_eq!(
            decode::<Report>(&payload).unwrap_err(),
            PayloadError::UnsupportedVersion(tag)
        );
    }

    #[test]
    fn json_v2_readers_skip_unknown_siblings(value in any::<i64>(), extra in "[a-z]{1,8}") {
        prop_assume!(extra != "value");
        let mut body = serde_json::Map::new();
        body.insert("value".to_string(), value.into());
        body.insert(extra, serde_json::json!([1, 2, 3]));
        let payload = VersionedPayload {
            version: EncodingVersion::JsonV2.tag(),
            data: serde_json::to_vec(&body).unwrap().into(),
        };
        prop_assert_eq!(decode::<i64>(&payload).unwrap(), value);
    }
}
