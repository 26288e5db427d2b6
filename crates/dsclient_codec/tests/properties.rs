//! Property-based checks of the codec invariants.

use chrono::{DateTime, Utc};
use dsclient_codec::{
    load_entity, save_entity, Context, Cursor, DsError, FieldMismatchPolicy, Key, MultiError,
    Record, Schema,
};
use proptest::prelude::*;

fn kind() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z0-9]{0,11}").expect("valid regex")
}

fn element() -> impl Strategy<Value = (String, Option<i64>, Option<String>)> {
    (
        kind(),
        prop_oneof![
            (1i64..i64::MAX).prop_map(|id| (Some(id), None)),
            "[a-z0-9 _-]{1,16}".prop_map(|name| (None, Some(name))),
        ],
    )
        .prop_map(|(kind, (id, name))| (kind, id, name))
}

fn key() -> impl Strategy<Value = Key> {
    (
        prop::collection::vec(element(), 1..4),
        prop::string::string_regex("[a-z]{0,6}").expect("valid regex"),
    )
        .prop_map(|(path, namespace)| {
            let mut key: Option<Key> = None;
            for (kind, id, name) in path {
                let next = match (id, name) {
                    (Some(id), _) => Key::id_key(&kind, id, key.as_ref()),
                    (None, Some(name)) => Key::name_key(&kind, &name, key.as_ref()),
                    (None, None) => Key::incomplete_key(&kind, key.as_ref()),
                };
                key = Some(next);
            }
            key.expect("non-empty path").with_namespace(&namespace)
        })
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Sample {
    name: String,
    count: i64,
    small: i16,
    ratio: f64,
    flag: bool,
    at: DateTime<Utc>,
    labels: Vec<String>,
    parent: Option<Key>,
}

impl Record for Sample {
    fn describe(schema: &mut Schema<Self>) {
        schema
            .field("Name", "", |r| &r.name, |r| &mut r.name)
            .field("Count", "", |r| &r.count, |r| &mut r.count)
            .field("Small", ",noindex", |r| &r.small, |r| &mut r.small)
            .field("Ratio", "", |r| &r.ratio, |r| &mut r.ratio)
            .field("Flag", ",omitempty", |r| &r.flag, |r| &mut r.flag)
            .field("At", "", |r| &r.at, |r| &mut r.at)
            .field("Labels", "", |r| &r.labels, |r| &mut r.labels)
            .field("Parent", "", |r| &r.parent, |r| &mut r.parent);
    }
}

fn sample() -> impl Strategy<Value = Sample> {
    (
        ".{0,24}",
        any::<i64>(),
        any::<i16>(),
        -1e12f64..1e12f64,
        any::<bool>(),
        // 0001-01-01 ..= 9999-12-31 in microseconds
        -62_135_596_800_000_000i64..=253_402_300_799_999_999i64,
        prop::collection::vec("[a-z]{0,8}", 0..5),
        prop::option::of(key()),
    )
        .prop_map(|(name, count, small, ratio, flag, micros, labels, parent)| Sample {
            name,
            count,
            small,
            ratio,
            flag,
            at: DateTime::<Utc>::from_timestamp_micros(micros).expect("in range"),
            labels,
            parent,
        })
}

proptest! {
    #[test]
    fn key_encoding_roundtrips(k in key()) {
        prop_assert_eq!(Key::decode(&k.encode()).unwrap(), k.clone());
        prop_assert_eq!(Key::from_json(&k.to_json().unwrap()).unwrap(), k.clone());
        prop_assert_eq!(Key::from_binary(&k.to_binary().unwrap()).unwrap(), k);
    }

    #[test]
    fn cursor_encoding_roundtrips(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let cursor = Cursor::from_bytes(bytes);
        prop_assert_eq!(Cursor::decode(&cursor.to_string()).unwrap(), cursor);
    }

    #[test]
    fn record_save_load_roundtrips(original in sample(), k in key()) {
        let ctx = Context::background().with_value(FieldMismatchPolicy::Report);
        let entity = save_entity(&ctx, Some(&k), &original).unwrap();
        prop_assert_eq!(entity.key.as_ref(), Some(&k));
        let mut loaded = Sample::default();
        load_entity(&ctx, &mut loaded, entity).unwrap();
        prop_assert_eq!(loaded, original);
    }

    #[test]
    fn multi_error_stays_aligned(len in 0usize..32, failing in prop::collection::vec(any::<bool>(), 32)) {
        let mut errs = MultiError::new(len);
        for (i, fail) in failing.iter().take(len).enumerate() {
            if *fail {
                errs.set(i, DsError::NoSuchEntity);
            }
        }
        let outcome = errs.clone().into_result();
        let spread = MultiError::from_outcome(len, &outcome);
        prop_assert_eq!(spread.len(), len);
        for i in 0..len {
            prop_assert_eq!(spread.get(i).is_some(), failing[i]);
        }
    }
}
