//! Sample record types.

use dsclient_codec::{Context, DsResult, Key, Record, Schema};
use dsclient_core::Client;

/// The kind used by [`Data`].
pub const DATA_KIND: &str = "Data";

/// A record with a single `Name` property.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Data {
    /// The stored name.
    pub name: String,
}

impl Data {
    /// Creates a record named `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Record for Data {
    fn describe(schema: &mut Schema<Self>) {
        schema.field("Name", "", |r| &r.name, |r| &mut r.name);
    }
}

/// Key of the `Data` entity with numeric id `id`.
pub fn data_key(id: i64) -> Key {
    Key::id_key(DATA_KIND, id, None)
}

/// Stores `Data { name: "#<id>" }` for every id and returns the keys.
pub fn seed_data(client: &Client, ctx: &Context, ids: impl IntoIterator<Item = i64>) -> DsResult<Vec<Key>> {
    let (keys, values): (Vec<Key>, Vec<Data>) = ids
        .into_iter()
        .map(|id| (data_key(id), Data::named(format!("#{id}"))))
        .unzip();
    client.put_multi(ctx, &keys, &values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::with_test_client;

    #[test]
    fn seeded_entities_load_back() {
        with_test_client(|tc| {
            let keys = seed_data(tc, &tc.ctx, 1..=3).unwrap();
            let mut loaded = vec![Data::default(); 3];
            tc.get_multi(&tc.ctx, &keys, &mut loaded).unwrap();
            assert_eq!(loaded[2], Data::named("#3"));
        });
    }
}
