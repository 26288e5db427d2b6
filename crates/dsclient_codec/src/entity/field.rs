//! Conversions between field types and property values.

use crate::error::{DsError, DsResult};
use crate::key::Key;
use crate::value::{GeoPoint, Value};
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Earliest storable instant, 0001-01-01T00:00:00Z, in Unix microseconds.
pub(crate) const MIN_TIME_MICROS: i64 = -62_135_596_800_000_000;
/// Latest storable instant, 9999-12-31T23:59:59.999999Z, in Unix microseconds.
pub(crate) const MAX_TIME_MICROS: i64 = 253_402_300_799_999_999;

/// Checks the storable window and truncates to microseconds.
pub(crate) fn normalize_time(t: &DateTime<Utc>) -> DsResult<DateTime<Utc>> {
    let micros = t.timestamp_micros();
    if !(MIN_TIME_MICROS..=MAX_TIME_MICROS).contains(&micros) {
        return Err(DsError::invalid_value(format!(
            "time value {} out of range",
            t.to_rfc3339()
        )));
    }
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| DsError::invalid_value(format!("time value {micros}us out of range")))
}

pub(crate) fn type_mismatch(value: &Value, target: &str) -> String {
    format!("type mismatch: {} versus {target}", value.type_name())
}

const NON_SLICE_LIST: &str = "cannot load a multi-valued property into a non-slice field";

/// A single-valued field type with a natural property value.
pub trait ScalarField: Sized + 'static {
    /// Name of the type in error messages.
    const TYPE_NAME: &'static str;

    /// Converts the field into its property value.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidValue`] when the value cannot be stored.
    fn to_value(&self) -> DsResult<Value>;

    /// Converts a property value into the field type.
    ///
    /// # Errors
    ///
    /// Returns the mismatch reason on overflow or type clash.
    fn from_value(value: Value) -> Result<Self, String>;

    /// Returns true for the zero value, used by `omitempty`.
    fn is_zero(&self) -> bool;
}

/// A type usable with [`Schema::field`](super::Schema::field).
///
/// Implemented for every [`ScalarField`], for `Option` of a scalar (absent
/// saves as null) and for `Vec` of a scalar (saved as one list property).
pub trait FieldType: 'static {
    /// Converts the field into its property value.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidValue`] when the value cannot be stored.
    fn save_value(&self) -> DsResult<Value>;

    /// Loads one property occurrence into the field.
    ///
    /// `first` is true for the first occurrence of the property name in the
    /// loaded list; slices reset then and append afterwards.
    ///
    /// # Errors
    ///
    /// Returns the mismatch reason on overflow or type clash.
    fn load_value(&mut self, value: Value, first: bool) -> Result<(), String>;

    /// Returns true for the value `omitempty` suppresses.
    fn is_empty_value(&self) -> bool;

    /// Returns true when several occurrences of the property are allowed.
    fn multi_valued() -> bool
    where
        Self: Sized,
    {
        false
    }
}

macro_rules! int_scalar {
    ($($ty:ty),*) => {
        $(
            impl ScalarField for $ty {
                const TYPE_NAME: &'static str = stringify!($ty);

                fn to_value(&self) -> DsResult<Value> {
                    Ok(Value::Int(i64::from(*self)))
                }

                fn from_value(value: Value) -> Result<Self, String> {
                    match value {
                        Value::Int(i) => <$ty>::try_from(i).map_err(|_| {
                            format!("value {i} overflows struct field of type {}", stringify!($ty))
                        }),
                        Value::Null => Ok(0),
                        other => Err(type_mismatch(&other, stringify!($ty))),
                    }
                }

                fn is_zero(&self) -> bool {
                    *self == 0
                }
            }
        )*
    };
}

int_scalar!(i8, i16, i32, i64);

impl ScalarField for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn to_value(&self) -> DsResult<Value> {
        Ok(Value::Float(*self))
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Null => Ok(0.0),
            other => Err(type_mismatch(&other, Self::TYPE_NAME)),
        }
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }
}

impl ScalarField for f32 {
    const TYPE_NAME: &'static str = "f32";

    fn to_value(&self) -> DsResult<Value> {
        Ok(Value::Float(f64::from(*self)))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Float(f) if f.is_finite() && f.abs() > f64::from(f32::MAX) => {
                Err(format!("value {f} overflows struct field of type f32"))
            }
            Value::Float(f) => Ok(f as f32),
            Value::Null => Ok(0.0),
            other => Err(type_mismatch(&other, Self::TYPE_NAME)),
        }
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }
}

impl ScalarField for bool {
    const TYPE_NAME: &'static str = "bool";

    fn to_value(&self) -> DsResult<Value> {
        Ok(Value::Bool(*self))
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(type_mismatch(&other, Self::TYPE_NAME)),
        }
    }

    fn is_zero(&self) -> bool {
        !*self
    }
}

impl ScalarField for String {
    const TYPE_NAME: &'static str = "String";

    fn to_value(&self) -> DsResult<Value> {
        Ok(Value::String(self.clone()))
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Ok(s),
            Value::Null => Ok(String::new()),
            other => Err(type_mismatch(&other, Self::TYPE_NAME)),
        }
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl ScalarField for Bytes {
    const TYPE_NAME: &'static str = "Bytes";

    fn to_value(&self) -> DsResult<Value> {
        Ok(Value::Bytes(self.clone()))
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Bytes(b) => Ok(b),
            Value::String(s) => Ok(Bytes::from(s)),
            Value::Null => Ok(Bytes::new()),
            other => Err(type_mismatch(&other, Self::TYPE_NAME)),
        }
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl ScalarField for DateTime<Utc> {
    const TYPE_NAME: &'static str = "DateTime<Utc>";

    fn to_value(&self) -> DsResult<Value> {
        normalize_time(self).map(Value::Time)
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Time(t) => Ok(t),
            Value::Null => Ok(DateTime::<Utc>::default()),
            other => Err(type_mismatch(&other, Self::TYPE_NAME)),
        }
    }

    fn is_zero(&self) -> bool {
        *self == DateTime::<Utc>::default()
    }
}

impl ScalarField for GeoPoint {
    const TYPE_NAME: &'static str = "GeoPoint";

    fn to_value(&self) -> DsResult<Value> {
        if !self.valid() {
            return Err(DsError::invalid_value(format!(
                "invalid geo point ({}, {})",
                self.lat, self.lng
            )));
        }
        Ok(Value::GeoPoint(*self))
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::GeoPoint(p) => Ok(p),
            Value::Null => Ok(GeoPoint::default()),
            other => Err(type_mismatch(&other, Self::TYPE_NAME)),
        }
    }

    fn is_zero(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }
}

impl ScalarField for Key {
    const TYPE_NAME: &'static str = "Key";

    fn to_value(&self) -> DsResult<Value> {
        if !self.valid() {
            return Err(DsError::InvalidKey);
        }
        Ok(Value::Key(self.clone()))
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Key(k) => Ok(k),
            other => Err(type_mismatch(&other, Self::TYPE_NAME)),
        }
    }

    fn is_zero(&self) -> bool {
        false
    }
}

macro_rules! scalar_field_type {
    ($($ty:ty),*) => {
        $(
            impl FieldType for $ty {
                fn save_value(&self) -> DsResult<Value> {
                    ScalarField::to_value(self)
                }

                fn load_value(&mut self, value: Value, _first: bool) -> Result<(), String> {
                    if value.is_list() {
                        return Err(NON_SLICE_LIST.to_string());
                    }
                    *self = <$ty as ScalarField>::from_value(value)?;
                    Ok(())
                }

                fn is_empty_value(&self) -> bool {
                    ScalarField::is_zero(self)
                }
            }
        )*
    };
}

scalar_field_type!(i8, i16, i32, i64, f32, f64, bool, String, Bytes, DateTime<Utc>, GeoPoint, Key);

impl<T: ScalarField> FieldType for Option<T> {
    fn save_value(&self) -> DsResult<Value> {
        match self {
            Some(v) => v.to_value(),
            None => Ok(Value::Null),
        }
    }

    fn load_value(&mut self, value: Value, _first: bool) -> Result<(), String> {
        *self = match value {
            Value::Null => None,
            Value::List(_) => return Err(NON_SLICE_LIST.to_string()),
            other => Some(T::from_value(other)?),
        };
        Ok(())
    }

    fn is_empty_value(&self) -> bool {
        self.is_none()
    }
}

impl<T: ScalarField> FieldType for Vec<T> {
    fn save_value(&self) -> DsResult<Value> {
        self.iter()
            .map(ScalarField::to_value)
            .collect::<DsResult<Vec<_>>>()
            .map(Value::List)
    }

    fn load_value(&mut self, value: Value, first: bool) -> Result<(), String> {
        if first {
            self.clear();
        }
        match value {
            Value::Null => {}
            Value::List(items) => {
                for item in items {
                    if item.is_list() {
                        return Err("cannot load a list of lists".to_string());
                    }
                    self.push(T::from_value(item)?);
                }
            }
            other => self.push(T::from_value(other)?),
        }
        Ok(())
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }

    fn multi_valued() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn integer_overflow_is_reported() {
        assert_eq!(i8::from_value(Value::Int(127)), Ok(127));
        let err = i8::from_value(Value::Int(128)).unwrap_err();
        assert!(err.contains("overflows"), "{err}");
        assert!(i16::from_value(Value::from("1")).is_err());
    }

    #[test]
    fn float_overflow_is_reported() {
        assert!(f32::from_value(Value::Float(1e300)).is_err());
        assert_eq!(f32::from_value(Value::Float(1.5)), Ok(1.5));
    }

    #[test]
    fn time_is_truncated_to_micros() {
        let t = Utc.with_ymd_and_hms(2020, 5, 17, 1, 2, 3).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let Value::Time(saved) = t.to_value().unwrap() else {
            panic!("expected a time value");
        };
        assert_eq!(saved.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn time_window_is_enforced() {
        let early = Utc.with_ymd_and_hms(0, 12, 31, 23, 59, 59).unwrap();
        assert!(early.to_value().is_err());
        let first = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        assert!(first.to_value().is_ok());
        let late = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        assert!(late.to_value().is_err());
    }

    #[test]
    fn slices_reset_on_first_occurrence() {
        let mut tags = vec!["stale".to_string()];
        tags.load_value(Value::from("a"), true).unwrap();
        tags.load_value(Value::List(vec![Value::from("b"), Value::from("c")]), false)
            .unwrap();
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn scalars_reject_lists() {
        let mut n = 0i64;
        assert!(n.load_value(Value::List(vec![Value::Int(1)]), true).is_err());
        let mut opt: Option<String> = Some("x".into());
        opt.load_value(Value::Null, true).unwrap();
        assert!(opt.is_none());
    }
}
