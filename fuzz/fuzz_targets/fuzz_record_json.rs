//! Fuzz target for record decoding and canonical encoding.
//!
//! Arbitrary JSON must never panic the decoder or the canonicalizer, and a
//! record that encodes must encode the same way after a JSON round trip.

#![no_main]

use collection_sync::codec::{canonicalize, ExclusionSet};
use collection_sync::record::{Record, DEFAULT_KEY_FIELD};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let Ok(record) = Record::from_json(json, DEFAULT_KEY_FIELD) else {
        return;
    };

    let excluded = ExclusionSet::default();
    let Ok(bytes) = canonicalize(&record, &excluded) else {
        return;
    };

    let again = Record::from_json(record.to_json(DEFAULT_KEY_FIELD), DEFAULT_KEY_FIELD)
        .expect("re-decoding an encoded record");
    assert_eq!(canonicalize(&again, &excluded).ok(), Some(bytes));
});
