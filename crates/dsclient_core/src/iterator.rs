//! Query iteration through the chain.

use crate::client::Client;
use crate::transaction::Transaction;
use dsclient_codec::{load_entity, Context, Cursor, DsResult, Entity, Key, PropertyList, PropertyLoadSaver, Query};
use dsclient_storage::RawIterator;
use std::fmt;

/// Iterator over the rows of a query.
///
/// Every step re-enters the middleware chain as its `next` operation, so
/// middlewares observe rows one at a time. Iteration ends with
/// [`DsError::Done`](dsclient_codec::DsError::Done).
pub struct QueryIterator {
    client: Client,
    context: Context,
    transaction: Option<Transaction>,
    query: Query,
    raw: Box<dyn RawIterator>,
}

impl QueryIterator {
    pub(crate) fn start(
        client: Client,
        context: Context,
        transaction: Option<Transaction>,
        query: Query,
    ) -> DsResult<Self> {
        query.validate()?;
        let info = client.info(&context, transaction.as_ref());
        let raw = info.next.run(&info, &query)?;
        Ok(Self {
            client,
            context,
            transaction,
            query,
            raw,
        })
    }

    /// The query being iterated.
    #[must_use]
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Advances to the next row and loads it into `dst`.
    ///
    /// Keys-only queries leave `dst` untouched.
    ///
    /// # Errors
    ///
    /// [`DsError::Done`](dsclient_codec::DsError::Done) after the last row;
    /// `InvalidOperation` once the bound transaction has finished; otherwise
    /// the chain's or the load's error.
    pub fn next<T: PropertyLoadSaver + ?Sized>(&mut self, dst: &mut T) -> DsResult<Key> {
        let mut properties = PropertyList::new();
        let key = self.step(&mut properties)?;
        if !self.query.is_keys_only() {
            load_entity(&self.context, dst, Entity::new(Some(key.clone()), properties))?;
        }
        Ok(key)
    }

    /// Advances to the next row, returning only its key.
    ///
    /// # Errors
    ///
    /// Same as [`next`](Self::next).
    pub fn next_key(&mut self) -> DsResult<Key> {
        let mut properties = PropertyList::new();
        self.step(&mut properties)
    }

    fn step(&mut self, dst: &mut PropertyList) -> DsResult<Key> {
        if let Some(tx) = &self.transaction {
            tx.ensure_active()?;
        }
        let info = self.client.info(&self.context, self.transaction.as_ref());
        info.next.next(&info, &self.query, self.raw.as_mut(), dst)
    }

    /// Cursor positioned after the last returned row.
    ///
    /// # Errors
    ///
    /// Returns the backend's error when no cursor is available.
    pub fn cursor(&self) -> DsResult<Cursor> {
        self.raw.cursor()
    }

    /// The backend iterator under the chain.
    pub fn raw_mut(&mut self) -> &mut dyn RawIterator {
        self.raw.as_mut()
    }
}

impl fmt::Debug for QueryIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIterator")
            .field("query", &self.query)
            .field("transaction", &self.transaction.as_ref().map(Transaction::id))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsclient_codec::DsError;
    use dsclient_storage::embedded::EmbeddedBackend;
    use dsclient_storage::{ClientOptions, Engine};
    use std::sync::Arc;

    fn seeded() -> (Client, Vec<Key>) {
        let ctx = Context::background();
        let client = Client::new(
            Arc::new(EmbeddedBackend::new(Arc::new(Engine::new()))),
            ClientOptions::default(),
        );
        let keys: Vec<Key> = (1..=4).map(|id| client.id_key("Data", id, None)).collect();
        let values: Vec<PropertyList> = (1..=4)
            .map(|id| {
                let mut props = PropertyList::new();
                props.push_value("Rank", id, false);
                props
            })
            .collect();
        client.put_multi(&ctx, &keys, &values).unwrap();
        (client, keys)
    }

    #[test]
    fn iterates_until_done() {
        let (client, keys) = seeded();
        let mut iter = client
            .run(&Context::background(), &client.new_query("Data"))
            .unwrap();
        let mut seen = Vec::new();
        let mut row = PropertyList::new();
        loop {
            match iter.next(&mut row) {
                Ok(key) => seen.push(key),
                Err(DsError::Done) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(seen, keys);
        assert_eq!(iter.next_key().unwrap_err(), DsError::Done);
    }

    #[test]
    fn cursor_resumes_iteration() {
        let (client, keys) = seeded();
        let ctx = Context::background();
        let mut iter = client.run(&ctx, &client.new_query("Data")).unwrap();
        iter.next_key().unwrap();
        let cursor = client.decode_cursor(&iter.cursor().unwrap().to_string()).unwrap();

        let mut resumed = client
            .run(&ctx, &client.new_query("Data").start(cursor))
            .unwrap();
        assert_eq!(resumed.next_key().unwrap(), keys[1]);
    }

    #[test]
    fn invalid_queries_fail_before_dispatch() {
        let (client, _) = seeded();
        let err = client
            .run(&Context::background(), &client.new_query("Data").filter("Rank =<", 1i64))
            .unwrap_err();
        assert!(matches!(err, DsError::InvalidArgument { .. }));
    }

    #[test]
    fn finished_transaction_stops_iteration() {
        let (client, keys) = seeded();
        let tx = client.new_transaction(&Context::background()).unwrap();
        let mut iter = tx.run(&client.new_query("Data").ancestor(&keys[0])).unwrap();
        tx.rollback().unwrap();

        let err = iter.next_key().unwrap_err();
        assert!(matches!(err, DsError::InvalidOperation { .. }));
    }
}
