//! Property values.

use crate::key::Key;
use crate::property::Entity;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A geographic point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

impl GeoPoint {
    /// Creates a geo point.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Returns true when both coordinates are within range.
    #[must_use]
    pub fn valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// The null value.
    #[default]
    Null,
    /// A 64-bit signed integer.
    Int(i64),
    /// A boolean.
    Bool(bool),
    /// A UTF-8 string.
    String(String),
    /// A 64-bit float.
    Float(f64),
    /// A byte string.
    Bytes(Bytes),
    /// A time instant.
    Time(DateTime<Utc>),
    /// A geographic point.
    GeoPoint(GeoPoint),
    /// A key.
    Key(Key),
    /// A nested entity.
    Entity(Box<Entity>),
    /// A list of values.
    List(Vec<Value>),
}

impl Value {
    /// Short name of the value's type, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int64",
            Self::Bool(_) => "bool",
            Self::String(_) => "string",
            Self::Float(_) => "float64",
            Self::Bytes(_) => "[]byte",
            Self::Time(_) => "time",
            Self::GeoPoint(_) => "geopoint",
            Self::Key(_) => "key",
            Self::Entity(_) => "entity",
            Self::List(_) => "list",
        }
    }

    /// Returns true for the zero value of the value's type.
    ///
    /// The zero time is the Unix epoch, which is what `DateTime::default()` yields.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Int(i) => *i == 0,
            Self::Bool(b) => !b,
            Self::String(s) => s.is_empty(),
            Self::Float(f) => *f == 0.0,
            Self::Bytes(b) => b.is_empty(),
            Self::Time(t) => *t == DateTime::<Utc>::default(),
            Self::GeoPoint(p) => p.lat == 0.0 && p.lng == 0.0,
            Self::Key(_) => false,
            Self::Entity(e) => e.key.is_none() && e.properties.is_empty(),
            Self::List(items) => items.is_empty(),
        }
    }

    /// Returns true for [`Value::List`].
    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int(_) => 1,
            Self::Time(_) => 2,
            Self::Bool(_) => 3,
            Self::String(_) => 4,
            Self::Bytes(_) => 5,
            Self::Float(_) => 6,
            Self::GeoPoint(_) => 7,
            Self::Key(_) => 8,
            Self::Entity(_) => 9,
            Self::List(_) => 10,
        }
    }

    /// Orders values the way the datastore orders them in indexes.
    ///
    /// Values of different types order by type; values of the same type
    /// order naturally.
    #[must_use]
    pub fn datastore_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::GeoPoint(a), Self::GeoPoint(b)) => {
                a.lat.total_cmp(&b.lat).then(a.lng.total_cmp(&b.lng))
            }
            (Self::Key(a), Self::Key(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.datastore_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Bytes(b) => write!(f, "b{:?}", b.as_ref()),
            Self::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Self::GeoPoint(p) => write!(f, "geo({},{})", p.lat, p.lng),
            Self::Key(k) => write!(f, "{k}"),
            Self::Entity(e) => {
                f.write_str("{")?;
                for (i, p) in e.properties.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", p.name, p.value)?;
                }
                f.write_str("}")
            }
            Self::List(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

impl_value_from! {
    i64 => Int,
    i32 => Int,
    i16 => Int,
    i8 => Int,
    bool => Bool,
    String => String,
    &str => String,
    f64 => Float,
    f32 => Float,
    Bytes => Bytes,
    DateTime<Utc> => Time,
    GeoPoint => GeoPoint,
    Key => Key,
}

impl From<&Key> for Value {
    fn from(k: &Key) -> Self {
        Self::Key(k.clone())
    }
}

impl From<Entity> for Value {
    fn from(e: Entity) -> Self {
        Self::Entity(Box::new(e))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}
