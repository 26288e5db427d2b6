//! Entity codec.
//!
//! Maps application records onto the flat, ordered [`PropertyList`] the
//! datastore stores, and back.
//!
//! There are two extension points:
//! - [`PropertyTranslator`]: per-field hook rewriting a field's wire value.
//! - [`PropertyLoadSaver`]: per-record hook replacing the codec for a record.
//!
//! Everything else is driven by the [`Schema`] a [`Record`] describes once.
//!
//! ## Loading
//!
//! Loading never stops at the first bad property: the remaining properties
//! are still loaded and the first error is returned at the end. Field
//! mismatches (unknown names, overflow, type clashes, several values for a
//! single-valued field) are tolerated by default; see
//! [`set_suppress_field_mismatch`] and [`FieldMismatchPolicy`].

mod access;
mod field;
mod schema;
mod tag;

pub use field::{FieldType, ScalarField};
pub use schema::Schema;

use crate::context::Context;
use crate::error::DsResult;
use crate::key::Key;
use crate::property::{Entity, PropertyList};
use crate::value::Value;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-record hook that wholly replaces the codec for a type.
///
/// Every [`Record`] implements it through the codec; implement it directly
/// for types that need full control over their properties.
pub trait PropertyLoadSaver {
    /// Loads the properties into `self`.
    ///
    /// # Errors
    ///
    /// Returns the first error met while loading.
    fn load(&mut self, ctx: &Context, props: PropertyList) -> DsResult<()>;

    /// Saves `self` into properties.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be stored.
    fn save(&self, ctx: &Context) -> DsResult<PropertyList>;

    /// Receives the entity key after a load.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be stored.
    fn load_key(&mut self, _key: &Key) -> DsResult<()> {
        Ok(())
    }

    /// The key carried by `self`, if it has a key field.
    fn saved_key(&self) -> Option<Key> {
        None
    }
}

/// Per-field hook redirecting a field's wire representation.
///
/// Translators are pure value conversions and must not perform I/O.
pub trait PropertyTranslator: Sized {
    /// Converts the field into the value to store.
    ///
    /// # Errors
    ///
    /// Returns an error if the field cannot be converted.
    fn to_property_value(&self, ctx: &Context) -> DsResult<Value>;

    /// Rebuilds the field from a stored value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted.
    fn from_property_value(ctx: &Context, value: Value) -> DsResult<Self>;
}

/// An application record described by a [`Schema`].
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Default)]
/// struct Post {
///     key: Option<Key>,
///     title: String,
///     author: Author,
/// }
///
/// impl Record for Post {
///     fn describe(schema: &mut Schema<Self>) {
///         schema
///             .key(|r| &r.key, |r| &mut r.key)
///             .field("Title", "", |r| &r.title, |r| &mut r.title)
///             .record("Author", ",flatten", |r| &r.author, |r| &mut r.author);
///     }
/// }
/// ```
pub trait Record: Default + 'static {
    /// Registers the record's fields.
    fn describe(schema: &mut Schema<Self>);

    /// Runs before the record is saved.
    ///
    /// # Errors
    ///
    /// An error aborts the save.
    fn before_save(&self, _ctx: &Context) -> DsResult<()> {
        Ok(())
    }

    /// Runs after the record was loaded without error.
    ///
    /// The context is the one the load was issued with; a running batch can
    /// be reached through it.
    ///
    /// # Errors
    ///
    /// An error is reported as the load's error.
    fn after_load(&mut self, _ctx: &Context) -> DsResult<()> {
        Ok(())
    }
}

impl<R: Record> PropertyLoadSaver for R {
    fn load(&mut self, ctx: &Context, props: PropertyList) -> DsResult<()> {
        load_struct(ctx, self, props)
    }

    fn save(&self, ctx: &Context) -> DsResult<PropertyList> {
        save_struct(ctx, self)
    }

    fn load_key(&mut self, key: &Key) -> DsResult<()> {
        Schema::<R>::cached()?.set_key(self, key);
        Ok(())
    }

    fn saved_key(&self) -> Option<Key> {
        Schema::<R>::cached().ok().and_then(|s| s.key_of(self))
    }
}

impl PropertyLoadSaver for PropertyList {
    fn load(&mut self, _ctx: &Context, props: PropertyList) -> DsResult<()> {
        *self = props;
        Ok(())
    }

    fn save(&self, _ctx: &Context) -> DsResult<PropertyList> {
        Ok(self.clone())
    }
}

static SUPPRESS_FIELD_MISMATCH: AtomicBool = AtomicBool::new(true);

/// Sets the process-wide field mismatch policy. The default is to suppress.
pub fn set_suppress_field_mismatch(suppress: bool) {
    SUPPRESS_FIELD_MISMATCH.store(suppress, Ordering::SeqCst);
}

/// Returns the process-wide field mismatch policy.
#[must_use]
pub fn suppress_field_mismatch() -> bool {
    SUPPRESS_FIELD_MISMATCH.load(Ordering::SeqCst)
}

/// Overrides the process-wide field mismatch policy for loads issued with a
/// context carrying this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMismatchPolicy {
    /// Tolerate every field mismatch.
    Suppress,
    /// Report field mismatches.
    Report,
}

pub(crate) fn mismatch_suppressed(ctx: &Context) -> bool {
    match ctx.value::<FieldMismatchPolicy>() {
        Some(FieldMismatchPolicy::Suppress) => true,
        Some(FieldMismatchPolicy::Report) => false,
        None => suppress_field_mismatch(),
    }
}

/// Saves a record into a property list.
///
/// # Errors
///
/// Returns the first save error; partial output is discarded.
pub fn save_struct<R: Record>(ctx: &Context, src: &R) -> DsResult<PropertyList> {
    let schema = Schema::<R>::cached()?;
    src.before_save(ctx)?;
    let mut out = PropertyList::new();
    schema.save_fields(src, ctx, "", false, &mut out)?;
    Ok(out)
}

/// Loads a property list into a record.
///
/// # Errors
///
/// Returns the first error after every property was processed.
pub fn load_struct<R: Record>(ctx: &Context, dst: &mut R, props: PropertyList) -> DsResult<()> {
    access::load_record(ctx, mismatch_suppressed(ctx), dst, props)
}

/// Saves a value into an entity.
///
/// The entity key is `key` when given, otherwise the value's own key field.
///
/// # Errors
///
/// Returns the value's save error.
pub fn save_entity<T: PropertyLoadSaver + ?Sized>(
    ctx: &Context,
    key: Option<&Key>,
    src: &T,
) -> DsResult<Entity> {
    let properties = src.save(ctx)?;
    Ok(Entity {
        key: key.cloned().or_else(|| src.saved_key()),
        properties,
    })
}

/// Loads an entity into a value, including its key.
///
/// # Errors
///
/// Returns the value's load error.
pub fn load_entity<T: PropertyLoadSaver + ?Sized>(
    ctx: &Context,
    dst: &mut T,
    entity: Entity,
) -> DsResult<()> {
    let Entity { key, properties } = entity;
    let loaded = dst.load(ctx, properties);
    if let Some(key) = key {
        dst.load_key(&key)?;
    }
    loaded
}
