//! Query evaluation over the engine's entity map.
//!
//! Results form one ordered stream per query: matching entities (exploded
//! per projected value), sorted by the query orders with the key as the last
//! tie-breaker, then deduplicated for distinct queries. Cursors are positions
//! in that stream, so start and end cursors are applied before offset and
//! limit.

use crate::error::{EngineError, EngineResult};
use dsclient_codec::{
    Cursor, Direction, Filter, FilterOp, Key, Property, PropertyList, Query, Value, KEY_PROPERTY,
};
use std::cmp::Ordering;

/// One query result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    /// Key of the matching entity.
    pub key: Key,
    /// Entity properties; only the projected ones for projection queries,
    /// none for keys-only queries.
    pub properties: PropertyList,
    /// Position of the row in the ordered result stream.
    pub position: usize,
}

impl QueryRow {
    /// Cursor pointing just past this row.
    #[must_use]
    pub fn cursor_after(&self) -> Cursor {
        position_cursor(self.position + 1)
    }
}

/// The window of a query's result stream selected by cursors, offset and
/// limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    /// Selected rows in order.
    pub rows: Vec<QueryRow>,
    /// Stream position before the first selected row.
    pub start_position: usize,
    /// Stream position after the last selected row.
    pub end_position: usize,
    /// Whether the stream holds rows past `end_position`.
    pub more: bool,
}

impl QueryRows {
    /// Cursor after `consumed` rows of the window.
    #[must_use]
    pub fn cursor_at(&self, consumed: usize) -> Cursor {
        match consumed.checked_sub(1).and_then(|i| self.rows.get(i)) {
            Some(row) => row.cursor_after(),
            None if consumed == 0 => position_cursor(self.start_position),
            None => position_cursor(self.end_position),
        }
    }
}

/// Encodes a stream position as a cursor.
#[must_use]
pub fn position_cursor(position: usize) -> Cursor {
    Cursor::from_bytes((position as u64).to_be_bytes().to_vec())
}

/// Decodes a cursor produced by [`position_cursor`]. The empty cursor is
/// the start of the stream.
///
/// # Errors
///
/// Returns [`EngineError::InvalidCursor`] for foreign cursors.
pub fn cursor_position(cursor: &Cursor) -> EngineResult<usize> {
    if cursor.is_empty() {
        return Ok(0);
    }
    let bytes: [u8; 8] = cursor
        .as_bytes()
        .try_into()
        .map_err(|_| EngineError::InvalidCursor)?;
    usize::try_from(u64::from_be_bytes(bytes)).map_err(|_| EngineError::InvalidCursor)
}

struct Candidate<'a> {
    key: &'a Key,
    properties: &'a PropertyList,
    projected: Vec<Value>,
    sort: Vec<Value>,
}

/// Evaluates `query` over `entities`, which must iterate in key order.
pub(crate) fn evaluate<'a, I>(entities: I, query: &Query) -> EngineResult<QueryRows>
where
    I: IntoIterator<Item = (&'a Key, &'a PropertyList)>,
{
    query
        .validate()
        .map_err(|err| EngineError::invalid_query(err.to_string()))?;

    let mut candidates = Vec::new();
    for (key, properties) in entities {
        if !in_scope(query, key) || !query.filters().iter().all(|f| matches(f, key, properties)) {
            continue;
        }
        for projected in explode(query.projection(), properties) {
            let mut candidate = Candidate {
                key,
                properties,
                projected,
                sort: Vec::new(),
            };
            if let Some(sort) = sort_values(query, &candidate) {
                candidate.sort = sort;
                candidates.push(candidate);
            }
        }
    }

    candidates.sort_by(|a, b| compare(query, a, b));
    if query.is_distinct() {
        candidates.dedup_by(|later, earlier| later.projected == earlier.projected);
    }

    window(query, candidates)
}

fn in_scope(query: &Query, key: &Key) -> bool {
    if key.namespace() != query.namespace_name() {
        return false;
    }
    if !query.kind_name().is_empty() && key.kind() != query.kind_name() {
        return false;
    }
    query.ancestor_key().map_or(true, |a| key.has_ancestor(a))
}

/// Indexed values of a property, list elements spread out.
fn indexed_values<'a>(properties: &'a PropertyList, name: &'a str) -> Vec<&'a Value> {
    properties
        .iter()
        .filter(|p| p.name == name && !p.no_index)
        .flat_map(|p| match &p.value {
            Value::List(values) => values.iter().collect::<Vec<_>>(),
            value => vec![value],
        })
        .collect()
}

fn op_holds(op: FilterOp, ord: Ordering) -> bool {
    match op {
        FilterOp::Equal => ord == Ordering::Equal,
        FilterOp::LessThan => ord == Ordering::Less,
        FilterOp::LessThanOrEqual => ord != Ordering::Greater,
        FilterOp::GreaterThan => ord == Ordering::Greater,
        FilterOp::GreaterThanOrEqual => ord != Ordering::Less,
    }
}

fn matches(filter: &Filter, key: &Key, properties: &PropertyList) -> bool {
    if filter.property == KEY_PROPERTY {
        let own = Value::Key(key.clone());
        return op_holds(filter.op, own.datastore_cmp(&filter.value));
    }
    indexed_values(properties, &filter.property)
        .into_iter()
        .any(|v| op_holds(filter.op, v.datastore_cmp(&filter.value)))
}

/// One projected tuple per combination of projected values. An entity
/// lacking a projected property yields nothing.
fn explode(projection: &[String], properties: &PropertyList) -> Vec<Vec<Value>> {
    let mut tuples: Vec<Vec<Value>> = vec![Vec::new()];
    for name in projection {
        let values = indexed_values(properties, name);
        let mut next = Vec::with_capacity(tuples.len() * values.len());
        for tuple in &tuples {
            for value in &values {
                let mut extended = tuple.clone();
                extended.push((*value).clone());
                next.push(extended);
            }
        }
        tuples = next;
    }
    tuples
}

/// Sort values per order, or `None` when the entity lacks an ordered
/// property. Lists sort by their smallest element ascending and their
/// largest descending.
fn sort_values(query: &Query, candidate: &Candidate<'_>) -> Option<Vec<Value>> {
    query
        .orders()
        .iter()
        .map(|order| {
            if order.property == KEY_PROPERTY {
                return Some(Value::Key(candidate.key.clone()));
            }
            if let Some(i) = query.projection().iter().position(|p| *p == order.property) {
                return candidate.projected.get(i).cloned();
            }
            let values = indexed_values(candidate.properties, &order.property).into_iter();
            let picked = match order.direction {
                Direction::Ascending => values.min_by(|a, b| a.datastore_cmp(b)),
                Direction::Descending => values.max_by(|a, b| a.datastore_cmp(b)),
            };
            picked.cloned()
        })
        .collect()
}

fn compare(query: &Query, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    for (i, order) in query.orders().iter().enumerate() {
        let ord = a.sort[i].datastore_cmp(&b.sort[i]);
        let ord = match order.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.key.cmp(b.key)
}

fn window(query: &Query, candidates: Vec<Candidate<'_>>) -> EngineResult<QueryRows> {
    let total = candidates.len();
    let start = query
        .start_cursor()
        .map(cursor_position)
        .transpose()?
        .unwrap_or(0)
        .min(total);
    let end = query
        .end_cursor()
        .map(cursor_position)
        .transpose()?
        .unwrap_or(total)
        .clamp(start, total);
    let offset = usize::try_from(query.offset_value()).unwrap_or(0);
    let first = (start + offset).min(end);
    let last = match query.limit_value() {
        Some(limit) => first.saturating_add(usize::try_from(limit).unwrap_or(0)).min(end),
        None => end,
    };

    let rows = candidates
        .into_iter()
        .enumerate()
        .skip(first)
        .take(last - first)
        .map(|(position, c)| QueryRow {
            key: c.key.clone(),
            properties: row_properties(query, &c),
            position,
        })
        .collect();

    Ok(QueryRows {
        rows,
        start_position: first,
        end_position: last,
        more: last < end,
    })
}

fn row_properties(query: &Query, candidate: &Candidate<'_>) -> PropertyList {
    if query.is_keys_only() {
        return PropertyList::new();
    }
    if query.projection().is_empty() {
        return candidate.properties.clone();
    }
    query
        .projection()
        .iter()
        .zip(&candidate.projected)
        .map(|(name, value)| Property::new(name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn store() -> BTreeMap<Key, PropertyList> {
        let mut entities = BTreeMap::new();
        for (id, name, age, tags) in [
            (1, "ann", 31, vec!["a", "b"]),
            (2, "bob", 25, vec!["b"]),
            (3, "cat", 40, vec![]),
            (4, "dan", 25, vec!["c", "a"]),
        ] {
            let mut props = PropertyList::new();
            props.push_value("Name", name, false);
            props.push_value("Age", age as i64, false);
            props.push_value(
                "Tags",
                Value::List(tags.into_iter().map(Value::from).collect()),
                false,
            );
            props.push_value("Note", "hidden", true);
            entities.insert(Key::id_key("Person", id, None), props);
        }
        entities.insert(Key::id_key("Other", 9, None), PropertyList::new());
        entities
    }

    fn run(query: &Query) -> QueryRows {
        let entities = store();
        evaluate(entities.iter(), query).unwrap()
    }

    fn ids(rows: &QueryRows) -> Vec<i64> {
        rows.rows.iter().map(|r| r.key.id()).collect()
    }

    #[test]
    fn kind_scopes_results_in_key_order() {
        assert_eq!(ids(&run(&Query::new("Person"))), vec![1, 2, 3, 4]);
    }

    #[test]
    fn orders_break_ties_by_key() {
        let rows = run(&Query::new("Person").order("Age"));
        assert_eq!(ids(&rows), vec![2, 4, 1, 3]);
        let rows = run(&Query::new("Person").order("-Age"));
        assert_eq!(ids(&rows), vec![3, 1, 2, 4]);
    }

    #[test]
    fn list_properties_match_any_element() {
        let rows = run(&Query::new("Person").filter("Tags =", "a"));
        assert_eq!(ids(&rows), vec![1, 4]);
    }

    #[test]
    fn unindexed_properties_never_match() {
        let rows = run(&Query::new("Person").filter("Note =", "hidden"));
        assert!(rows.rows.is_empty());
    }

    #[test]
    fn key_filters_compare_keys() {
        let pivot = Key::id_key("Person", 2, None);
        let rows = run(&Query::new("Person").filter("__key__ >", &pivot));
        assert_eq!(ids(&rows), vec![3, 4]);
    }

    #[test]
    fn ordering_on_missing_property_excludes_entity() {
        let rows = run(&Query::new("Person").order("Tags"));
        assert_eq!(ids(&rows), vec![1, 4, 2]);
    }

    #[test]
    fn projection_explodes_lists_and_distinct_dedups() {
        let rows = run(&Query::new("Person").project(&["Tags"]).order("Tags"));
        let tags: Vec<_> = rows
            .rows
            .iter()
            .map(|r| r.properties.get("Tags").cloned().unwrap())
            .collect();
        assert_eq!(
            tags,
            vec![
                Value::from("a"),
                Value::from("a"),
                Value::from("b"),
                Value::from("b"),
                Value::from("c"),
            ]
        );

        let rows = run(&Query::new("Person").project(&["Tags"]).order("Tags").distinct());
        assert_eq!(rows.rows.len(), 3);
    }

    #[test]
    fn cursors_offset_and_limit_select_a_window() {
        let all = run(&Query::new("Person"));
        let after_first = all.cursor_at(1);

        let rows = run(&Query::new("Person").start(after_first.clone()));
        assert_eq!(ids(&rows), vec![2, 3, 4]);

        let rows = run(&Query::new("Person").start(after_first).offset(1).limit(1));
        assert_eq!(ids(&rows), vec![3]);
        assert!(rows.more);
        assert_eq!(cursor_position(&rows.cursor_at(1)).unwrap(), 3);

        let rows = run(&Query::new("Person").end(position_cursor(2)));
        assert_eq!(ids(&rows), vec![1, 2]);
        assert!(!rows.more);
    }

    #[test]
    fn keys_only_rows_carry_no_properties() {
        let rows = run(&Query::new("Person").keys_only());
        assert!(rows.rows.iter().all(|r| r.properties.is_empty()));
    }

    #[test]
    fn foreign_cursor_is_rejected() {
        let entities = store();
        let query = Query::new("Person").start(Cursor::from_bytes(vec![1, 2]));
        assert_eq!(
            evaluate(entities.iter(), &query).unwrap_err(),
            EngineError::InvalidCursor
        );
    }
}
