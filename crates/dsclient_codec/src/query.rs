//! Queries and their canonical dump.
//!
//! A [`Query`] is an immutable builder: each method returns a new query.
//! Builder mistakes (a malformed filter string, a non-key `__key__` filter
//! value) do not panic; they are recorded and reported by [`Query::err`] and
//! by every operation that runs the query.

use crate::cursor::Cursor;
use crate::error::{DsError, DsResult};
use crate::key::Key;
use crate::transaction::TransactionId;
use crate::value::Value;
use crate::KEY_PROPERTY;
use std::fmt;

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
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
}

impl FilterOp {
    /// Parses an operator token.
    #[must_use]
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "=" => Some(Self::Equal),
            "<" => Some(Self::LessThan),
            "<=" => Some(Self::LessThanOrEqual),
            ">" => Some(Self::GreaterThan),
            ">=" => Some(Self::GreaterThanOrEqual),
            _ => None,
        }
    }

    /// The operator token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
        }
    }

    /// Returns true for the inequality operators.
    #[must_use]
    pub const fn is_inequality(self) -> bool {
        !matches!(self, Self::Equal)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A property filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Property name, or `__key__`.
    pub property: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Operand.
    pub value: Value,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Ascending order.
    Ascending,
    /// Descending order.
    Descending,
}

/// A sort order on one property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Order {
    /// Property name, or `__key__`.
    pub property: String,
    /// Sort direction.
    pub direction: Direction,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Ascending => f.write_str(&self.property),
            Direction::Descending => write!(f, "-{}", self.property),
        }
    }
}

/// A datastore query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    kind: String,
    ancestor: Option<Key>,
    filters: Vec<Filter>,
    orders: Vec<Order>,
    projection: Vec<String>,
    distinct: bool,
    keys_only: bool,
    eventual: bool,
    limit: Option<i32>,
    offset: i32,
    start: Option<Cursor>,
    end: Option<Cursor>,
    namespace: String,
    transaction: Option<TransactionId>,
    err: Option<DsError>,
}

impl Query {
    /// Creates a query over entities of `kind`. An empty kind queries all kinds.
    #[must_use]
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    fn fail(mut self, err: DsError) -> Self {
        if self.err.is_none() {
            self.err = Some(err);
        }
        self
    }

    /// Restricts results to descendants of `ancestor` (inclusive).
    #[must_use]
    pub fn ancestor(mut self, ancestor: &Key) -> Self {
        if ancestor.incomplete() {
            return self.fail(DsError::invalid_argument("incomplete query ancestor key"));
        }
        self.ancestor = Some(ancestor.clone());
        self
    }

    /// Adds a filter such as `"Age >="`.
    ///
    /// The operator is one of `=`, `<`, `<=`, `>`, `>=`; it defaults to `=`
    /// when omitted.
    #[must_use]
    pub fn filter(mut self, filter: &str, value: impl Into<Value>) -> Self {
        let filter = filter.trim();
        let split = filter
            .char_indices()
            .rev()
            .take_while(|(_, c)| matches!(c, '<' | '>' | '='))
            .last()
            .map_or(filter.len(), |(i, _)| i);
        let property = filter[..split].trim();
        let op_str = filter[split..].trim();
        if property.is_empty() {
            return self.fail(DsError::invalid_argument(format!(
                "empty property name in filter {filter:?}"
            )));
        }
        let op = if op_str.is_empty() {
            FilterOp::Equal
        } else {
            match FilterOp::parse(op_str) {
                Some(op) => op,
                None => {
                    return self.fail(DsError::invalid_argument(format!(
                        "invalid operator {op_str:?} in filter {filter:?}"
                    )))
                }
            }
        };
        let value = value.into();
        if property == KEY_PROPERTY && !matches!(value, Value::Key(_)) {
            return self.fail(DsError::invalid_argument(format!(
                "invalid key value {value} for {KEY_PROPERTY} filter"
            )));
        }
        self.filters.push(Filter {
            property: property.to_string(),
            op,
            value,
        });
        self
    }

    /// Adds a sort order; a leading `-` sorts descending.
    #[must_use]
    pub fn order(mut self, field: &str) -> Self {
        let field = field.trim();
        let (property, direction) = match field.strip_prefix('-') {
            Some(rest) => (rest.trim(), Direction::Descending),
            None => (field, Direction::Ascending),
        };
        if property.is_empty() {
            return self.fail(DsError::invalid_argument("empty order"));
        }
        self.orders.push(Order {
            property: property.to_string(),
            direction,
        });
        self
    }

    /// Returns only the named properties.
    #[must_use]
    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection
            .extend(fields.iter().map(|f| (*f).to_string()));
        self
    }

    /// Drops duplicate projected results.
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Returns keys only.
    #[must_use]
    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    /// Allows eventually consistent results.
    #[must_use]
    pub fn eventual_consistency(mut self) -> Self {
        self.eventual = true;
        self
    }

    /// Caps the number of results; a negative limit means unlimited.
    #[must_use]
    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = (limit >= 0).then_some(limit);
        self
    }

    /// Skips the first `offset` results.
    #[must_use]
    pub fn offset(mut self, offset: i32) -> Self {
        if offset < 0 {
            return self.fail(DsError::invalid_argument("negative query offset"));
        }
        self.offset = offset;
        self
    }

    /// Starts the results at `cursor`.
    #[must_use]
    pub fn start(mut self, cursor: Cursor) -> Self {
        self.start = Some(cursor);
        self
    }

    /// Ends the results at `cursor`.
    #[must_use]
    pub fn end(mut self, cursor: Cursor) -> Self {
        self.end = Some(cursor);
        self
    }

    /// Queries within `namespace`.
    #[must_use]
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Binds the query to a transaction.
    #[must_use]
    pub fn transaction(mut self, transaction: TransactionId) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// The first builder error, if any.
    #[must_use]
    pub fn err(&self) -> Option<&DsError> {
        self.err.as_ref()
    }

    /// Checks the query for builder errors and inconsistent settings.
    ///
    /// # Errors
    ///
    /// Returns the first builder error, or [`DsError::InvalidArgument`] when
    /// the settings are inconsistent.
    pub fn validate(&self) -> DsResult<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.keys_only && !self.projection.is_empty() {
            return Err(DsError::invalid_argument(
                "projection and keys-only cannot both be set",
            ));
        }
        if self.distinct && self.projection.is_empty() {
            return Err(DsError::invalid_argument("distinct requires a projection"));
        }
        if self.transaction.is_some() && self.ancestor.is_none() {
            return Err(DsError::invalid_argument(
                "transactional queries require an ancestor",
            ));
        }
        if self.transaction.is_some() && self.eventual {
            return Err(DsError::invalid_argument(
                "transactional queries cannot be eventually consistent",
            ));
        }
        Ok(())
    }

    /// The entity kind, empty for kindless queries.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        &self.kind
    }

    /// The ancestor restriction.
    #[must_use]
    pub fn ancestor_key(&self) -> Option<&Key> {
        self.ancestor.as_ref()
    }

    /// The filters, in insertion order.
    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// The sort orders, in insertion order.
    #[must_use]
    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    /// The projected property names.
    #[must_use]
    pub fn projection(&self) -> &[String] {
        &self.projection
    }

    /// Whether distinct is set.
    #[must_use]
    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Whether keys-only is set.
    #[must_use]
    pub fn is_keys_only(&self) -> bool {
        self.keys_only
    }

    /// Whether eventual consistency is allowed.
    #[must_use]
    pub fn is_eventual(&self) -> bool {
        self.eventual
    }

    /// The result limit.
    #[must_use]
    pub fn limit_value(&self) -> Option<i32> {
        self.limit
    }

    /// The result offset.
    #[must_use]
    pub fn offset_value(&self) -> i32 {
        self.offset
    }

    /// The start cursor.
    #[must_use]
    pub fn start_cursor(&self) -> Option<&Cursor> {
        self.start.as_ref()
    }

    /// The end cursor.
    #[must_use]
    pub fn end_cursor(&self) -> Option<&Cursor> {
        self.end.as_ref()
    }

    /// The namespace.
    #[must_use]
    pub fn namespace_name(&self) -> &str {
        &self.namespace
    }

    /// The bound transaction.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction
    }

    /// Snapshots the query state.
    #[must_use]
    pub fn dump(&self) -> QueryDump {
        QueryDump {
            kind: self.kind.clone(),
            ancestor: self.ancestor.clone(),
            filters: self
                .filters
                .iter()
                .map(|f| FilterDump {
                    name: f.property.clone(),
                    op: f.op,
                    value: f.value.clone(),
                })
                .collect(),
            orders: self.orders.iter().map(ToString::to_string).collect(),
            projection: self.projection.clone(),
            distinct: self.distinct,
            keys_only: self.keys_only,
            limit: self.limit,
            offset: self.offset,
            start: self.start.clone(),
            end: self.end.clone(),
            namespace: self.namespace.clone(),
            eventual: self.eventual,
            transaction: self.transaction,
        }
    }
}

/// One filter of a [`QueryDump`].
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDump {
    /// Property name.
    pub name: String,
    /// Operator.
    pub op: FilterOp,
    /// Operand.
    pub value: Value,
}

/// A serialisable snapshot of a query.
///
/// Its `Display` form is the canonical fingerprint used as a cache key:
/// `v1:<kind>` followed by one `&tag=value` segment per set field, in this
/// order: `a` ancestor, `f` filter (repeated), `or` order (repeated), `p`
/// projection (repeated), `d` distinct, `k` keys-only, `l` limit, `o` offset,
/// `s` start cursor, `e` end cursor, `n` namespace, `t` transaction-bound,
/// `ev` eventual consistency.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryDump {
    /// Entity kind.
    pub kind: String,
    /// Ancestor restriction.
    pub ancestor: Option<Key>,
    /// Filters.
    pub filters: Vec<FilterDump>,
    /// Orders in `[-]Name` form.
    pub orders: Vec<String>,
    /// Projected properties.
    pub projection: Vec<String>,
    /// Distinct flag.
    pub distinct: bool,
    /// Keys-only flag.
    pub keys_only: bool,
    /// Result limit.
    pub limit: Option<i32>,
    /// Result offset.
    pub offset: i32,
    /// Start cursor.
    pub start: Option<Cursor>,
    /// End cursor.
    pub end: Option<Cursor>,
    /// Namespace.
    pub namespace: String,
    /// Eventual consistency flag.
    pub eventual: bool,
    /// Bound transaction.
    pub transaction: Option<TransactionId>,
}

impl QueryDump {
    /// The canonical fingerprint string.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.to_string()
    }
}

/// Writes `v1:<kind>` followed by the set fields in this order: `&a=`
/// ancestor, `&f=` filters, `&or=` orders, `&p=` projection, `&k=t`
/// keys-only, `&l=` limit, `&o=` offset, `&s=` start cursor, `&e=` end
/// cursor, `&n=` namespace, `&t=t` transaction, `&d=t` distinct and `&ev=t`
/// eventual consistency.
impl fmt::Display for QueryDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v1:{}", self.kind)?;
        if let Some(ancestor) = &self.ancestor {
            write!(f, "&a={}", ancestor.encode())?;
        }
        for filter in &self.filters {
            write!(f, "&f={}{}{}", filter.name, filter.op, filter.value)?;
        }
        for order in &self.orders {
            write!(f, "&or={order}")?;
        }
        for name in &self.projection {
            write!(f, "&p={name}")?;
        }
        if self.keys_only {
            f.write_str("&k=t")?;
        }
        if let Some(limit) = self.limit {
            write!(f, "&l={limit}")?;
        }
        if self.offset != 0 {
            write!(f, "&o={}", self.offset)?;
        }
        if let Some(start) = &self.start {
            write!(f, "&s={start}")?;
        }
        if let Some(end) = &self.end {
            write!(f, "&e={end}")?;
        }
        if !self.namespace.is_empty() {
            write!(f, "&n={}", self.namespace)?;
        }
        if self.transaction.is_some() {
            f.write_str("&t=t")?;
        }
        if self.distinct {
            f.write_str("&d=t")?;
        }
        if self.eventual {
            f.write_str("&ev=t")?;
        }
        Ok(())
    }
}
