//! Record schemas: field registration, validation and the per-type cache.

use super::access::{
    note_error, FieldAccess, FieldShape, LoadCx, LoadSaverAccess, OptionalRecordAccess,
    RecordAccess, RecordsAccess, ScalarAccess, TranslatedAccess,
};
use super::field::FieldType;
use super::tag::{parse_tag, valid_property_name, ParsedTag, TagOptions};
use super::{PropertyLoadSaver, PropertyTranslator, Record};
use crate::context::Context;
use crate::error::{DsError, DsResult};
use crate::key::Key;
use crate::property::PropertyList;
use crate::value::Value;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type SchemaCache = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

static SCHEMAS: Lazy<RwLock<SchemaCache>> = Lazy::new(|| RwLock::new(HashMap::new()));

thread_local! {
    static BUILDING: RefCell<HashSet<TypeId>> = RefCell::new(HashSet::new());
}

struct CachedSchema<R>(DsResult<Arc<Schema<R>>>);

pub(crate) struct FieldSpec<R> {
    pub name: String,
    pub options: TagOptions,
    pub access: Box<dyn FieldAccess<R> + Send + Sync>,
}

struct KeyField<R> {
    get: fn(&R) -> &Option<Key>,
    get_mut: fn(&mut R) -> &mut Option<Key>,
}

/// The field description of a [`Record`].
///
/// Each registration takes the default property name, a tag string
/// (`"name,noindex,flatten,omitempty"`, or `"-"` to skip the field) and a
/// pair of accessor functions. The first registration error is reported when
/// the schema is first used.
pub struct Schema<R> {
    type_name: String,
    fields: Vec<FieldSpec<R>>,
    by_name: HashMap<String, usize>,
    key: Option<KeyField<R>>,
    errors: Vec<DsError>,
}

fn short_type_name<R>() -> String {
    let full = std::any::type_name::<R>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

impl<R: Record> Schema<R> {
    fn new() -> Self {
        Self {
            type_name: short_type_name::<R>(),
            fields: Vec::new(),
            by_name: HashMap::new(),
            key: None,
            errors: Vec::new(),
        }
    }

    /// Name of the record type, as reported in errors.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    fn push(&mut self, name: &str, tag: &str, access: Box<dyn FieldAccess<R> + Send + Sync>) {
        let (property, options) = match parse_tag(tag) {
            Ok(ParsedTag::Skip) => return,
            Ok(ParsedTag::Keep { name: renamed, options }) => {
                (renamed.unwrap_or_else(|| name.to_string()), options)
            }
            Err(message) => {
                self.errors
                    .push(DsError::invalid_tag(&self.type_name, name, message));
                return;
            }
        };
        if !valid_property_name(&property) {
            self.errors.push(DsError::invalid_tag(
                &self.type_name,
                name,
                format!("invalid property name {property:?}"),
            ));
            return;
        }
        self.fields.push(FieldSpec {
            name: property,
            options,
            access,
        });
    }

    /// Registers a scalar, `Option<scalar>` or `Vec<scalar>` field.
    pub fn field<T: FieldType>(
        &mut self,
        name: &str,
        tag: &str,
        get: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> &mut Self {
        self.push(name, tag, Box::new(ScalarAccess { get, get_mut }));
        self
    }

    /// Registers a nested record field, saved as an entity or, with
    /// `flatten`, as prefixed properties.
    pub fn record<N: Record>(
        &mut self,
        name: &str,
        tag: &str,
        get: fn(&R) -> &N,
        get_mut: fn(&mut R) -> &mut N,
    ) -> &mut Self {
        self.push(name, tag, Box::new(RecordAccess { get, get_mut }));
        self
    }

    /// Registers an optional nested record; `None` saves nothing.
    pub fn optional_record<N: Record>(
        &mut self,
        name: &str,
        tag: &str,
        get: fn(&R) -> &Option<N>,
        get_mut: fn(&mut R) -> &mut Option<N>,
    ) -> &mut Self {
        self.push(name, tag, Box::new(OptionalRecordAccess { get, get_mut }));
        self
    }

    /// Registers a slice of records, saved as one list property.
    pub fn records<N: Record>(
        &mut self,
        name: &str,
        tag: &str,
        get: fn(&R) -> &Vec<N>,
        get_mut: fn(&mut R) -> &mut Vec<N>,
    ) -> &mut Self {
        self.push(name, tag, Box::new(RecordsAccess { get, get_mut }));
        self
    }

    /// Registers a field whose wire value comes from its [`PropertyTranslator`].
    pub fn translated<T: PropertyTranslator + 'static>(
        &mut self,
        name: &str,
        tag: &str,
        get: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> &mut Self {
        self.push(name, tag, Box::new(TranslatedAccess { get, get_mut }));
        self
    }

    /// Registers a field that saves and loads itself as a nested entity.
    pub fn load_saver<T: PropertyLoadSaver + Default + 'static>(
        &mut self,
        name: &str,
        tag: &str,
        get: fn(&R) -> &T,
        get_mut: fn(&mut R) -> &mut T,
    ) -> &mut Self {
        self.push(name, tag, Box::new(LoadSaverAccess { get, get_mut }));
        self
    }

    /// Registers the key field, set from the entity key on load.
    pub fn key(
        &mut self,
        get: fn(&R) -> &Option<Key>,
        get_mut: fn(&mut R) -> &mut Option<Key>,
    ) -> &mut Self {
        if self.key.is_some() {
            self.errors.push(DsError::invalid_tag(
                &self.type_name,
                crate::KEY_PROPERTY,
                "more than one key field",
            ));
        }
        self.key = Some(KeyField { get, get_mut });
        self
    }

    fn finish(&mut self) -> DsResult<()> {
        if let Some(err) = self.errors.first() {
            return Err(err.clone());
        }
        for spec in &self.fields {
            if !spec.options.flatten {
                continue;
            }
            match spec.access.shape() {
                FieldShape::Record | FieldShape::OptionalRecord => {}
                FieldShape::Records => {
                    let nested = spec.access.flattened_names()?;
                    if nested.iter().any(|(_, multi)| *multi) {
                        return Err(DsError::invalid_tag(
                            &self.type_name,
                            &spec.name,
                            "flattening nested structs leads to a slice of slices",
                        ));
                    }
                }
                FieldShape::LoadSaver => {
                    return Err(DsError::invalid_tag(
                        &self.type_name,
                        &spec.name,
                        "flatten is not supported on a PropertyLoadSaver field",
                    ));
                }
                FieldShape::Scalar { .. } | FieldShape::Translated => {
                    return Err(DsError::invalid_tag(
                        &self.type_name,
                        &spec.name,
                        "flatten requires a record field",
                    ));
                }
            }
        }
        let mut seen = HashSet::new();
        for (name, _) in self.property_names()? {
            if !seen.insert(name.clone()) {
                return Err(DsError::invalid_tag(
                    &self.type_name,
                    &name,
                    "duplicate property name",
                ));
            }
        }
        self.by_name = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.name.clone(), i))
            .collect();
        Ok(())
    }

    /// Every property name the record saves, with whether it is multi-valued.
    pub(crate) fn property_names(&self) -> DsResult<Vec<(String, bool)>> {
        let mut names = Vec::new();
        for spec in &self.fields {
            let shape = spec.access.shape();
            if spec.options.flatten && shape.is_record() {
                for (nested, multi) in spec.access.flattened_names()? {
                    names.push((
                        format!("{}.{nested}", spec.name),
                        multi || shape.multi_valued(),
                    ));
                }
            } else {
                names.push((spec.name.clone(), shape.multi_valued()));
            }
        }
        Ok(names)
    }

    /// Returns the validated schema of `R`, building it on first use.
    pub(crate) fn cached() -> DsResult<Arc<Self>> {
        let id = TypeId::of::<R>();
        if let Some(entry) = SCHEMAS.read().get(&id) {
            if let Some(cached) = entry.downcast_ref::<CachedSchema<R>>() {
                return cached.0.clone();
            }
        }

        let reentered = BUILDING.with(|building| !building.borrow_mut().insert(id));
        if reentered {
            return Err(DsError::invalid_tag(
                short_type_name::<R>(),
                "",
                "recursive flattened record",
            ));
        }
        let mut schema = Self::new();
        R::describe(&mut schema);
        let built = schema.finish().map(|()| Arc::new(schema));
        BUILDING.with(|building| building.borrow_mut().remove(&id));

        SCHEMAS
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(CachedSchema::<R>(built.clone())));
        built
    }

    pub(crate) fn save_fields(
        &self,
        record: &R,
        ctx: &Context,
        prefix: &str,
        noindex: bool,
        out: &mut PropertyList,
    ) -> DsResult<()> {
        for spec in &self.fields {
            let name = if prefix.is_empty() {
                spec.name.clone()
            } else {
                format!("{prefix}.{}", spec.name)
            };
            let mut options = spec.options;
            options.noindex |= noindex;
            spec.access.save(record, ctx, &name, options, out)?;
        }
        Ok(())
    }

    /// Loads one property. `full` is the name as stored, `local` the part of
    /// it relative to this record.
    pub(crate) fn load_property(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        full: &str,
        local: &str,
        value: Value,
    ) -> DsResult<()> {
        if let Some(&index) = self.by_name.get(local) {
            return self.fields[index]
                .access
                .load(record, cx, full, None, value, &self.type_name);
        }
        for spec in self.fields.iter().filter(|s| s.options.flatten) {
            let rest = local
                .strip_prefix(spec.name.as_str())
                .and_then(|r| r.strip_prefix('.'));
            if let Some(rest) = rest {
                return spec
                    .access
                    .load(record, cx, full, Some(rest), value, &self.type_name);
            }
        }
        Err(DsError::field_mismatch(
            &self.type_name,
            full,
            "no such struct field",
        ))
    }

    pub(crate) fn load_properties(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        props: PropertyList,
    ) -> DsResult<()> {
        let mut first = None;
        for prop in props {
            let loaded = self.load_property(record, cx, &prop.name, &prop.name, prop.value);
            note_error(&mut first, loaded, cx.suppress);
        }
        first.map_or(Ok(()), Err)
    }

    pub(crate) fn set_key(&self, record: &mut R, key: &Key) {
        if let Some(field) = &self.key {
            *(field.get_mut)(record) = Some(key.clone());
        }
    }

    pub(crate) fn key_of(&self, record: &R) -> Option<Key> {
        self.key.as_ref().and_then(|field| (field.get)(record).clone())
    }
}
