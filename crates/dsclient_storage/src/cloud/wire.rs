//! The cloud wire model and its conversions.
//!
//! Shapes follow the datastore REST resources: keys are partitioned and
//! carry path elements, values are tagged by type and carry their own index
//! exclusion, entities hold named values. Field names serialise in
//! camelCase.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dsclient_codec::{
    Direction, DsError, DsResult, Entity, FilterOp, GeoPoint, Key, Property, PropertyList, Query,
    Value, KEY_PROPERTY,
};
use serde::{Deserialize, Serialize};

/// Project and namespace of a key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionId {
    /// Project the entity lives in.
    pub project_id: String,
    /// Namespace, empty for the default one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace_id: String,
}

/// One element of a key path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathElement {
    /// Entity kind.
    pub kind: String,
    /// Numeric id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// String name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A wire key: partition plus root-first path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireKey {
    /// Partition of the key.
    pub partition_id: PartitionId,
    /// Path from the root ancestor to the entity.
    pub path: Vec<PathElement>,
}

impl WireKey {
    /// Converts a client key.
    #[must_use]
    pub fn from_key(key: &Key, project_id: &str) -> Self {
        let path = key
            .path()
            .into_iter()
            .map(|k| PathElement {
                kind: k.kind().to_string(),
                id: (k.id() != 0).then_some(k.id()),
                name: (!k.name().is_empty()).then(|| k.name().to_string()),
            })
            .collect();
        Self {
            partition_id: PartitionId {
                project_id: project_id.to_string(),
                namespace_id: key.namespace().to_string(),
            },
            path,
        }
    }

    /// Converts back to a client key. The project is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidKey`] for an empty path or an element
    /// carrying both an id and a name.
    pub fn to_key(&self) -> DsResult<Key> {
        let mut key: Option<Key> = None;
        for element in &self.path {
            key = Some(match (element.id, element.name.as_deref()) {
                (Some(_), Some(_)) => return Err(DsError::InvalidKey),
                (Some(id), None) => Key::id_key(&element.kind, id, key.as_ref()),
                (None, Some(name)) => Key::name_key(&element.kind, name, key.as_ref()),
                (None, None) => Key::incomplete_key(&element.kind, key.as_ref()),
            });
        }
        let key = key.ok_or(DsError::InvalidKey)?;
        Ok(key.with_namespace(&self.partition_id.namespace_id))
    }
}

/// A geographic point on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// Typed payload of a wire value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueType {
    /// Null.
    NullValue(()),
    /// Boolean.
    BooleanValue(bool),
    /// 64-bit integer.
    IntegerValue(i64),
    /// Double.
    DoubleValue(f64),
    /// Instant.
    TimestampValue(DateTime<Utc>),
    /// Key.
    KeyValue(WireKey),
    /// UTF-8 string.
    StringValue(String),
    /// Byte string.
    BlobValue(Bytes),
    /// Geographic point.
    GeoPointValue(LatLng),
    /// Embedded entity.
    EntityValue(WireEntity),
    /// Array of values.
    ArrayValue(Vec<WireValue>),
}

/// A wire value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireValue {
    /// The payload.
    #[serde(flatten)]
    pub value_type: ValueType,
    /// Excludes the value from indexes.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exclude_from_indexes: bool,
}

impl WireValue {
    /// Converts a client value.
    #[must_use]
    pub fn from_value(value: &Value, exclude: bool, project_id: &str) -> Self {
        let value_type = match value {
            Value::Null => ValueType::NullValue(()),
            Value::Int(i) => ValueType::IntegerValue(*i),
            Value::Bool(b) => ValueType::BooleanValue(*b),
            Value::String(s) => ValueType::StringValue(s.clone()),
            Value::Float(f) => ValueType::DoubleValue(*f),
            Value::Bytes(b) => ValueType::BlobValue(b.clone()),
            Value::Time(t) => ValueType::TimestampValue(*t),
            Value::GeoPoint(g) => ValueType::GeoPointValue(LatLng {
                latitude: g.lat,
                longitude: g.lng,
            }),
            Value::Key(k) => ValueType::KeyValue(WireKey::from_key(k, project_id)),
            Value::Entity(e) => ValueType::EntityValue(WireEntity::from_entity(e, project_id)),
            Value::List(values) => ValueType::ArrayValue(
                values
                    .iter()
                    .map(|v| Self::from_value(v, exclude, project_id))
                    .collect(),
            ),
        };
        Self {
            value_type,
            exclude_from_indexes: exclude,
        }
    }

    /// Converts back to a client value.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidKey`] for malformed embedded keys.
    pub fn to_value(&self) -> DsResult<Value> {
        Ok(match &self.value_type {
            ValueType::NullValue(()) => Value::Null,
            ValueType::BooleanValue(b) => Value::Bool(*b),
            ValueType::IntegerValue(i) => Value::Int(*i),
            ValueType::DoubleValue(f) => Value::Float(*f),
            ValueType::TimestampValue(t) => Value::Time(*t),
            ValueType::KeyValue(k) => Value::Key(k.to_key()?),
            ValueType::StringValue(s) => Value::String(s.clone()),
            ValueType::BlobValue(b) => Value::Bytes(b.clone()),
            ValueType::GeoPointValue(g) => Value::GeoPoint(GeoPoint::new(g.latitude, g.longitude)),
            ValueType::EntityValue(e) => Value::Entity(Box::new(e.to_entity()?)),
            ValueType::ArrayValue(values) => Value::List(
                values
                    .iter()
                    .map(WireValue::to_value)
                    .collect::<DsResult<_>>()?,
            ),
        })
    }
}

/// A named wire value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireProperty {
    /// Property name.
    pub name: String,
    /// Property value.
    pub value: WireValue,
}

/// A wire entity.
///
/// Property names are unique: repeated client properties of one name are
/// merged into a single array value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntity {
    /// Entity key, absent for some embedded entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<WireKey>,
    /// Properties in first-occurrence order.
    pub properties: Vec<WireProperty>,
}

impl WireEntity {
    /// Converts a property list under `key`.
    #[must_use]
    pub fn from_properties(key: Option<&Key>, properties: &PropertyList, project_id: &str) -> Self {
        let mut merged: Vec<WireProperty> = Vec::new();
        for property in properties {
            let value = WireValue::from_value(&property.value, property.no_index, project_id);
            match merged.iter_mut().find(|p| p.name == property.name) {
                Some(existing) => {
                    let previous = std::mem::replace(
                        &mut existing.value.value_type,
                        ValueType::ArrayValue(Vec::new()),
                    );
                    let mut items = match previous {
                        ValueType::ArrayValue(items) => items,
                        single => vec![WireValue {
                            value_type: single,
                            exclude_from_indexes: existing.value.exclude_from_indexes,
                        }],
                    };
                    match value.value_type {
                        ValueType::ArrayValue(more) => items.extend(more),
                        single => items.push(WireValue {
                            value_type: single,
                            exclude_from_indexes: value.exclude_from_indexes,
                        }),
                    }
                    existing.value.value_type = ValueType::ArrayValue(items);
                    existing.value.exclude_from_indexes &= value.exclude_from_indexes;
                }
                None => merged.push(WireProperty {
                    name: property.name.clone(),
                    value,
                }),
            }
        }
        Self {
            key: key.map(|k| WireKey::from_key(k, project_id)),
            properties: merged,
        }
    }

    /// Converts a client entity.
    #[must_use]
    pub fn from_entity(entity: &Entity, project_id: &str) -> Self {
        Self::from_properties(entity.key.as_ref(), &entity.properties, project_id)
    }

    /// Converts back to a property list.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidKey`] for malformed embedded keys.
    pub fn to_properties(&self) -> DsResult<PropertyList> {
        self.properties
            .iter()
            .map(|p| {
                Ok(Property {
                    name: p.name.clone(),
                    value: p.value.to_value()?,
                    no_index: p.value.exclude_from_indexes,
                })
            })
            .collect()
    }

    /// Converts back to a client entity.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidKey`] for malformed keys.
    pub fn to_entity(&self) -> DsResult<Entity> {
        let key = self.key.as_ref().map(WireKey::to_key).transpose()?;
        Ok(Entity::new(key, self.to_properties()?))
    }
}

/// Read consistency of a lookup or query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadConsistency {
    /// Strongly consistent reads.
    #[default]
    Strong,
    /// Eventually consistent reads.
    Eventual,
}

/// Read options of a lookup or query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOptions {
    /// Consistency outside transactions.
    #[serde(default)]
    pub read_consistency: ReadConsistency,
    /// Transaction handle the read belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Bytes>,
}

/// Filter operator on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    /// `=`
    Equal,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// Key has the given ancestor.
    HasAncestor,
}

impl Operator {
    fn from_op(op: FilterOp) -> Self {
        match op {
            FilterOp::Equal => Self::Equal,
            FilterOp::LessThan => Self::LessThan,
            FilterOp::LessThanOrEqual => Self::LessThanOrEqual,
            FilterOp::GreaterThan => Self::GreaterThan,
            FilterOp::GreaterThanOrEqual => Self::GreaterThanOrEqual,
        }
    }

    /// The client operator, `None` for [`Operator::HasAncestor`].
    #[must_use]
    pub fn to_op(self) -> Option<FilterOp> {
        match self {
            Self::Equal => Some(FilterOp::Equal),
            Self::LessThan => Some(FilterOp::LessThan),
            Self::LessThanOrEqual => Some(FilterOp::LessThanOrEqual),
            Self::GreaterThan => Some(FilterOp::GreaterThan),
            Self::GreaterThanOrEqual => Some(FilterOp::GreaterThanOrEqual),
            Self::HasAncestor => None,
        }
    }
}

/// A property filter; the query's filters are combined with AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    /// Property name, or `__key__`.
    pub property: String,
    /// Operator.
    pub op: Operator,
    /// Operand.
    pub value: WireValue,
}

/// Sort direction on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    /// Ascending.
    Ascending,
    /// Descending.
    Descending,
}

/// A sort order on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyOrder {
    /// Property name, or `__key__`.
    pub property: String,
    /// Direction.
    pub direction: SortDirection,
}

/// A wire query. Keys-only queries project `__key__`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireQuery {
    /// Kind, absent for kindless queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Conjunction of filters.
    #[serde(default)]
    pub filter: Vec<PropertyFilter>,
    /// Sort orders.
    #[serde(default)]
    pub order: Vec<PropertyOrder>,
    /// Projected properties.
    #[serde(default)]
    pub projection: Vec<String>,
    /// Properties results are distinct on.
    #[serde(default)]
    pub distinct_on: Vec<String>,
    /// Start of the result window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_cursor: Option<Bytes>,
    /// End of the result window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_cursor: Option<Bytes>,
    /// Results to skip.
    #[serde(default)]
    pub offset: i32,
    /// Maximum results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i32>,
}

impl WireQuery {
    /// Converts a client query. Cursors, offset and limit are left for the
    /// caller, which pages through the results.
    ///
    /// # Errors
    ///
    /// Returns the query's builder error.
    pub fn from_query(query: &Query, project_id: &str) -> DsResult<Self> {
        query.validate()?;
        let mut filter = Vec::new();
        if let Some(ancestor) = query.ancestor_key() {
            filter.push(PropertyFilter {
                property: KEY_PROPERTY.to_string(),
                op: Operator::HasAncestor,
                value: WireValue::from_value(&Value::Key(ancestor.clone()), false, project_id),
            });
        }
        filter.extend(query.filters().iter().map(|f| PropertyFilter {
            property: f.property.clone(),
            op: Operator::from_op(f.op),
            value: WireValue::from_value(&f.value, false, project_id),
        }));
        let order = query
            .orders()
            .iter()
            .map(|o| PropertyOrder {
                property: o.property.clone(),
                direction: match o.direction {
                    Direction::Ascending => SortDirection::Ascending,
                    Direction::Descending => SortDirection::Descending,
                },
            })
            .collect();
        let projection = if query.is_keys_only() {
            vec![KEY_PROPERTY.to_string()]
        } else {
            query.projection().to_vec()
        };
        let distinct_on = if query.is_distinct() {
            query.projection().to_vec()
        } else {
            Vec::new()
        };
        Ok(Self {
            kind: (!query.kind_name().is_empty()).then(|| query.kind_name().to_string()),
            filter,
            order,
            projection,
            distinct_on,
            ..Self::default()
        })
    }

    /// Rebuilds the client query evaluated by a server.
    ///
    /// # Errors
    ///
    /// Returns an error for operands that do not convert back.
    pub fn to_query(&self, namespace: &str) -> DsResult<Query> {
        let mut query = Query::new(self.kind.as_deref().unwrap_or("")).namespace(namespace);
        for f in &self.filter {
            let value = f.value.to_value()?;
            query = match (f.op.to_op(), value) {
                (None, Value::Key(ancestor)) => query.ancestor(&ancestor),
                (None, _) => {
                    return Err(DsError::invalid_argument("ancestor filter needs a key"));
                }
                (Some(op), value) => query.filter(&format!("{} {}", f.property, op), value),
            };
        }
        for o in &self.order {
            query = match o.direction {
                SortDirection::Ascending => query.order(&o.property),
                SortDirection::Descending => query.order(&format!("-{}", o.property)),
            };
        }
        if self.projection.len() == 1 && self.projection[0] == KEY_PROPERTY {
            query = query.keys_only();
        } else if !self.projection.is_empty() {
            let fields: Vec<&str> = self.projection.iter().map(String::as_str).collect();
            query = query.project(&fields);
        }
        if !self.distinct_on.is_empty() {
            query = query.distinct();
        }
        if let Some(start) = &self.start_cursor {
            query = query.start(dsclient_codec::Cursor::from_bytes(start.to_vec()));
        }
        if let Some(end) = &self.end_cursor {
            query = query.end(dsclient_codec::Cursor::from_bytes(end.to_vec()));
        }
        query = query.offset(self.offset);
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query.validate()?;
        Ok(query)
    }
}

/// A found or missing entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResult {
    /// The entity; only the key for missing results.
    pub entity: WireEntity,
    /// Commit version of the entity.
    #[serde(default)]
    pub version: u64,
    /// Position after this result, for query results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Bytes>,
}

/// Lookup request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupRequest {
    /// Target project.
    pub project_id: String,
    /// Read options.
    pub read_options: ReadOptions,
    /// Keys to look up.
    pub keys: Vec<WireKey>,
}

/// Lookup response. Results are unordered.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LookupResponse {
    /// Entities that exist.
    pub found: Vec<EntityResult>,
    /// Keys that do not exist.
    pub missing: Vec<EntityResult>,
    /// Keys the server did not process; the client retries them.
    pub deferred: Vec<WireKey>,
}

/// How a commit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitMode {
    /// Applies a transaction's mutations.
    Transactional,
    /// Applies mutations outside any transaction.
    NonTransactional,
}

/// A write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mutation {
    /// Insert or replace.
    Upsert(WireEntity),
    /// Remove.
    Delete(WireKey),
}

/// Commit request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    /// Target project.
    pub project_id: String,
    /// Commit mode.
    pub mode: CommitMode,
    /// Transaction handle for transactional commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Bytes>,
    /// Writes in order.
    pub mutations: Vec<Mutation>,
}

/// Result of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Allocated key for upserts of incomplete keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<WireKey>,
    /// Commit version.
    pub version: u64,
}

/// Commit response, one result per mutation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    /// Results in mutation order.
    pub mutation_results: Vec<MutationResult>,
    /// Number of index entries written.
    pub index_updates: u32,
}

/// Begin transaction request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginTransactionRequest {
    /// Target project.
    pub project_id: String,
}

/// Begin transaction response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginTransactionResponse {
    /// Opaque transaction handle.
    pub transaction: Bytes,
}

/// Rollback request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    /// Target project.
    pub project_id: String,
    /// Transaction handle.
    pub transaction: Bytes,
}

/// Allocate ids request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateIdsRequest {
    /// Target project.
    pub project_id: String,
    /// Incomplete keys.
    pub keys: Vec<WireKey>,
}

/// Allocate ids response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocateIdsResponse {
    /// Completed keys in request order.
    pub keys: Vec<WireKey>,
}

/// Run query request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryRequest {
    /// Target project.
    pub project_id: String,
    /// Namespace queried.
    pub partition_id: PartitionId,
    /// Read options.
    pub read_options: ReadOptions,
    /// The query.
    pub query: WireQuery,
}

/// What a result batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultType {
    /// Whole entities.
    Full,
    /// Projected properties.
    Projection,
    /// Keys only.
    KeyOnly,
}

/// Whether a query has more results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoreResults {
    /// The batch was cut short; ask again from the end cursor.
    NotFinished,
    /// The limit was reached; more results may follow it.
    MoreResultsAfterLimit,
    /// The end cursor was reached.
    MoreResultsAfterCursor,
    /// The stream is exhausted.
    NoMoreResults,
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultBatch {
    /// Shape of the results.
    pub entity_result_type: ResultType,
    /// Results in order.
    pub entity_results: Vec<EntityResult>,
    /// Results skipped by the offset.
    pub skipped_results: i32,
    /// Position after the skipped results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_cursor: Option<Bytes>,
    /// Position after the last result.
    pub end_cursor: Bytes,
    /// Whether more results exist.
    pub more_results: MoreResults,
}

/// Run query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQueryResponse {
    /// The page.
    pub batch: QueryResultBatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_roundtrip_through_the_wire() {
        let parent = Key::name_key("Parent", "p", None).with_namespace("ns");
        let key = Key::id_key("Child", 7, Some(&parent));
        let wire = WireKey::from_key(&key, "proj");

        assert_eq!(wire.partition_id.project_id, "proj");
        assert_eq!(wire.partition_id.namespace_id, "ns");
        assert_eq!(wire.path.len(), 2);
        assert_eq!(wire.to_key().unwrap(), key);
    }

    #[test]
    fn incomplete_keys_keep_an_empty_element() {
        let key = Key::incomplete_key("Data", None);
        let wire = WireKey::from_key(&key, "proj");
        assert_eq!(wire.path[0].id, None);
        assert!(wire.to_key().unwrap().incomplete());
    }

    #[test]
    fn repeated_names_merge_into_one_array() {
        let mut props = PropertyList::new();
        props.push_value("Tag", "a", false);
        props.push_value("Other", 1i64, true);
        props.push_value("Tag", "b", false);
        let wire = WireEntity::from_properties(None, &props, "proj");

        assert_eq!(wire.properties.len(), 2);
        let back = wire.to_properties().unwrap();
        assert_eq!(
            back.get("Tag"),
            Some(&Value::List(vec![Value::from("a"), Value::from("b")]))
        );
        assert!(back.iter().find(|p| p.name == "Other").unwrap().no_index);
    }

    #[test]
    fn values_serialise_in_rest_shape() {
        let value = WireValue::from_value(&Value::Int(5), true, "proj");
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, serde_json::json!({"integerValue": 5, "excludeFromIndexes": true}));
    }

    #[test]
    fn queries_survive_the_wire() {
        let ancestor = Key::name_key("Parent", "p", None);
        let query = Query::new("Data")
            .ancestor(&ancestor)
            .filter("Age >=", 20i64)
            .order("-Age")
            .keys_only();
        let wire = WireQuery::from_query(&query, "proj").unwrap();
        assert_eq!(wire.filter[0].op, Operator::HasAncestor);
        assert_eq!(wire.projection, vec![KEY_PROPERTY.to_string()]);

        let back = wire.to_query("").unwrap();
        assert_eq!(back.dump().fingerprint(), query.dump().fingerprint());
    }
}
