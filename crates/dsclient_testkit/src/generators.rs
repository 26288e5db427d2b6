//! Property-based test generators using proptest.
//!
//! Provides strategies for keys and property lists that satisfy the
//! datastore's naming rules.

use dsclient_codec::{Key, PropertyList, Value};
use proptest::prelude::*;

/// Strategy for generating valid kind names.
pub fn kind_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z0-9]{0,15}").expect("Invalid regex")
}

/// Strategy for generating valid property names.
pub fn property_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-zA-Z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating complete root keys, by id or by name.
pub fn root_key_strategy() -> impl Strategy<Value = Key> {
    (
        kind_strategy(),
        prop_oneof![
            (1i64..i64::MAX).prop_map(Ok::<i64, String>),
            prop::string::string_regex("[a-zA-Z0-9 ._-]{1,24}")
                .expect("Invalid regex")
                .prop_map(Err::<i64, String>),
        ],
    )
        .prop_map(|(kind, id)| match id {
            Ok(id) => Key::id_key(&kind, id, None),
            Err(name) => Key::name_key(&kind, &name, None),
        })
}

/// Strategy for generating complete keys with up to two ancestors.
pub fn key_strategy() -> impl Strategy<Value = Key> {
    (root_key_strategy(), prop::collection::vec((kind_strategy(), 1i64..1_000_000), 0..3)).prop_map(
        |(root, path)| {
            path.into_iter()
                .fold(root, |parent, (kind, id)| Key::id_key(&kind, id, Some(&parent)))
        },
    )
}

/// Strategy for generating scalar property values.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Int),
        any::<bool>().prop_map(Value::Bool),
        prop::string::string_regex("[a-zA-Z0-9 ]{0,32}")
            .expect("Invalid regex")
            .prop_map(Value::String),
        (-1.0e9f64..1.0e9).prop_map(Value::Float),
    ]
}

/// Strategy for generating property lists with distinct names.
pub fn property_list_strategy() -> impl Strategy<Value = PropertyList> {
    prop::collection::btree_map(property_name_strategy(), value_strategy(), 0..8).prop_map(|map| {
        let mut props = PropertyList::new();
        for (name, value) in map {
            props.push_value(name, value, false);
        }
        props
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestClient;

    proptest! {
        #[test]
        fn generated_keys_are_valid(key in key_strategy()) {
            prop_assert!(key.valid());
            prop_assert!(!key.incomplete());
        }

        #[test]
        fn stored_properties_load_back(key in key_strategy(), props in property_list_strategy()) {
            let tc = TestClient::embedded();
            tc.put_properties(&tc.ctx, &[key.clone()], &[props.clone()]).unwrap();
            let mut loaded = vec![PropertyList::new()];
            tc.get_properties(&tc.ctx, &[key], &mut loaded).unwrap();
            prop_assert_eq!(loaded.pop().unwrap(), props);
        }
    }
}
