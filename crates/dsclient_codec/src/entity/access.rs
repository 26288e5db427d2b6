//! Per-field save and load behaviour for each registration kind.

use super::field::{type_mismatch, FieldType};
use super::schema::Schema;
use super::tag::TagOptions;
use super::{save_struct, PropertyLoadSaver, PropertyTranslator, Record};
use crate::context::Context;
use crate::error::{DsError, DsResult};
use crate::property::{Entity, Property, PropertyList};
use crate::value::Value;
use std::collections::{HashMap, HashSet};

const MULTIPLE_VALUES: &str = "multiple-valued property requires a slice field type";
const NO_SUCH_FIELD: &str = "no such struct field";

/// State of one load pass over a property list.
pub(crate) struct LoadCx<'a> {
    pub ctx: &'a Context,
    pub suppress: bool,
    seen: HashSet<String>,
    occurrences: HashMap<String, usize>,
}

impl<'a> LoadCx<'a> {
    pub fn new(ctx: &'a Context, suppress: bool) -> Self {
        Self {
            ctx,
            suppress,
            seen: HashSet::new(),
            occurrences: HashMap::new(),
        }
    }

    fn child(&self) -> LoadCx<'a> {
        LoadCx::new(self.ctx, self.suppress)
    }

    /// Returns true the first time `name` is seen in this pass.
    fn first_occurrence(&mut self, name: &str) -> bool {
        self.seen.insert(name.to_string())
    }

    /// Returns how many times `name` was seen before, counting this call.
    fn next_index(&mut self, name: &str) -> usize {
        let count = self.occurrences.entry(name.to_string()).or_insert(0);
        let index = *count;
        *count += 1;
        index
    }
}

/// Keeps the first error that is not a suppressed field mismatch.
pub(crate) fn note_error(first: &mut Option<DsError>, result: DsResult<()>, suppress: bool) {
    if let Err(err) = result {
        if suppress && err.is_field_mismatch() {
            return;
        }
        if first.is_none() {
            *first = Some(err);
        }
    }
}

pub(crate) fn load_record<N: Record>(
    ctx: &Context,
    suppress: bool,
    dst: &mut N,
    props: PropertyList,
) -> DsResult<()> {
    let schema = Schema::<N>::cached()?;
    let mut cx = LoadCx::new(ctx, suppress);
    schema.load_properties(dst, &mut cx, props)?;
    dst.after_load(ctx)
}

fn save_nested<N: Record>(ctx: &Context, record: &N) -> DsResult<Entity> {
    let schema = Schema::<N>::cached()?;
    Ok(Entity {
        key: schema.key_of(record),
        properties: save_struct(ctx, record)?,
    })
}

fn load_nested<N: Record>(
    target: &mut N,
    cx: &LoadCx<'_>,
    full: &str,
    value: Value,
    struct_type: &str,
) -> DsResult<()> {
    match value {
        Value::Entity(entity) => {
            *target = N::default();
            let Entity { key, properties } = *entity;
            let loaded = load_record(cx.ctx, cx.suppress, target, properties);
            if let Some(key) = key {
                Schema::<N>::cached()?.set_key(target, &key);
            }
            loaded
        }
        Value::Null => {
            *target = N::default();
            Ok(())
        }
        other => Err(DsError::field_mismatch(
            struct_type,
            full,
            type_mismatch(&other, "record"),
        )),
    }
}

/// Coarse classification of a registered field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldShape {
    Scalar { multi: bool },
    Record,
    OptionalRecord,
    Records,
    Translated,
    LoadSaver,
}

impl FieldShape {
    pub fn is_record(self) -> bool {
        matches!(self, Self::Record | Self::OptionalRecord | Self::Records)
    }

    pub fn multi_valued(self) -> bool {
        matches!(self, Self::Scalar { multi: true } | Self::Records)
    }
}

/// Save and load behaviour of one registered field of `R`.
pub(crate) trait FieldAccess<R> {
    fn shape(&self) -> FieldShape;

    fn save(
        &self,
        record: &R,
        ctx: &Context,
        name: &str,
        options: TagOptions,
        out: &mut PropertyList,
    ) -> DsResult<()>;

    /// Loads one property. `rest` is the remainder of the name below a
    /// flattened field, `None` when the name addressed this field exactly.
    fn load(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        full: &str,
        rest: Option<&str>,
        value: Value,
        struct_type: &str,
    ) -> DsResult<()>;

    /// Property names of the nested record, for record-shaped fields.
    fn flattened_names(&self) -> DsResult<Vec<(String, bool)>> {
        Ok(Vec::new())
    }
}

pub(crate) struct ScalarAccess<R, T> {
    pub get: fn(&R) -> &T,
    pub get_mut: fn(&mut R) -> &mut T,
}

impl<R, T: FieldType> FieldAccess<R> for ScalarAccess<R, T> {
    fn shape(&self) -> FieldShape {
        FieldShape::Scalar {
            multi: T::multi_valued(),
        }
    }

    fn save(
        &self,
        record: &R,
        _ctx: &Context,
        name: &str,
        options: TagOptions,
        out: &mut PropertyList,
    ) -> DsResult<()> {
        let field = (self.get)(record);
        if options.omitempty && field.is_empty_value() {
            return Ok(());
        }
        out.push(Property {
            name: name.to_string(),
            value: field.save_value()?,
            no_index: options.noindex,
        });
        Ok(())
    }

    fn load(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        full: &str,
        rest: Option<&str>,
        value: Value,
        struct_type: &str,
    ) -> DsResult<()> {
        if rest.is_some() {
            return Err(DsError::field_mismatch(struct_type, full, NO_SUCH_FIELD));
        }
        let first = cx.first_occurrence(full);
        if !first && !T::multi_valued() {
            return Err(DsError::field_mismatch(struct_type, full, MULTIPLE_VALUES));
        }
        (self.get_mut)(record)
            .load_value(value, first)
            .map_err(|reason| DsError::field_mismatch(struct_type, full, reason))
    }
}

pub(crate) struct RecordAccess<R, N> {
    pub get: fn(&R) -> &N,
    pub get_mut: fn(&mut R) -> &mut N,
}

impl<R, N: Record> FieldAccess<R> for RecordAccess<R, N> {
    fn shape(&self) -> FieldShape {
        FieldShape::Record
    }

    fn save(
        &self,
        record: &R,
        ctx: &Context,
        name: &str,
        options: TagOptions,
        out: &mut PropertyList,
    ) -> DsResult<()> {
        save_record_field((self.get)(record), ctx, name, options, out)
    }

    fn load(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        full: &str,
        rest: Option<&str>,
        value: Value,
        struct_type: &str,
    ) -> DsResult<()> {
        let target = (self.get_mut)(record);
        match rest {
            Some(rest) => Schema::<N>::cached()?.load_property(target, cx, full, rest, value),
            None => {
                if !cx.first_occurrence(full) {
                    return Err(DsError::field_mismatch(struct_type, full, MULTIPLE_VALUES));
                }
                load_nested(target, cx, full, value, struct_type)
            }
        }
    }

    fn flattened_names(&self) -> DsResult<Vec<(String, bool)>> {
        Schema::<N>::cached()?.property_names()
    }
}

fn save_record_field<N: Record>(
    nested: &N,
    ctx: &Context,
    name: &str,
    options: TagOptions,
    out: &mut PropertyList,
) -> DsResult<()> {
    if options.flatten {
        return Schema::<N>::cached()?.save_fields(nested, ctx, name, options.noindex, out);
    }
    let entity = save_nested(ctx, nested)?;
    out.push(Property {
        name: name.to_string(),
        value: Value::Entity(Box::new(entity)),
        no_index: options.noindex,
    });
    Ok(())
}

pub(crate) struct OptionalRecordAccess<R, N> {
    pub get: fn(&R) -> &Option<N>,
    pub get_mut: fn(&mut R) -> &mut Option<N>,
}

impl<R, N: Record> FieldAccess<R> for OptionalRecordAccess<R, N> {
    fn shape(&self) -> FieldShape {
        FieldShape::OptionalRecord
    }

    fn save(
        &self,
        record: &R,
        ctx: &Context,
        name: &str,
        options: TagOptions,
        out: &mut PropertyList,
    ) -> DsResult<()> {
        match (self.get)(record) {
            Some(nested) => save_record_field(nested, ctx, name, options, out),
            None => Ok(()),
        }
    }

    fn load(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        full: &str,
        rest: Option<&str>,
        value: Value,
        struct_type: &str,
    ) -> DsResult<()> {
        let slot = (self.get_mut)(record);
        match rest {
            Some(rest) => {
                let target = slot.get_or_insert_with(N::default);
                Schema::<N>::cached()?.load_property(target, cx, full, rest, value)
            }
            None => {
                if !cx.first_occurrence(full) {
                    return Err(DsError::field_mismatch(struct_type, full, MULTIPLE_VALUES));
                }
                if matches!(value, Value::Null) {
                    *slot = None;
                    return Ok(());
                }
                let mut nested = N::default();
                let loaded = load_nested(&mut nested, cx, full, value, struct_type);
                if !matches!(loaded, Err(DsError::FieldMismatch(_)) | Ok(())) {
                    return loaded;
                }
                *slot = Some(nested);
                loaded
            }
        }
    }

    fn flattened_names(&self) -> DsResult<Vec<(String, bool)>> {
        Schema::<N>::cached()?.property_names()
    }
}

pub(crate) struct RecordsAccess<R, N> {
    pub get: fn(&R) -> &Vec<N>,
    pub get_mut: fn(&mut R) -> &mut Vec<N>,
}

impl<R, N: Record> RecordsAccess<R, N> {
    fn load_flattened(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        full: &str,
        rest: &str,
        value: Value,
    ) -> DsResult<()> {
        let schema = Schema::<N>::cached()?;
        let prefix = &full[..full.len() - rest.len()];
        let first_for_field = cx.first_occurrence(prefix);
        let items = (self.get_mut)(record);
        if first_for_field {
            items.clear();
        }
        let mut first_err = None;
        match value {
            Value::List(values) => {
                for (index, element) in values.into_iter().enumerate() {
                    if items.len() <= index {
                        items.resize_with(index + 1, N::default);
                    }
                    let mut child = cx.child();
                    let loaded = schema.load_property(&mut items[index], &mut child, full, rest, element);
                    note_error(&mut first_err, loaded, cx.suppress);
                }
            }
            single => {
                let index = cx.next_index(full);
                if items.len() <= index {
                    items.resize_with(index + 1, N::default);
                }
                let mut child = cx.child();
                let loaded = schema.load_property(&mut items[index], &mut child, full, rest, single);
                note_error(&mut first_err, loaded, cx.suppress);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl<R, N: Record> FieldAccess<R> for RecordsAccess<R, N> {
    fn shape(&self) -> FieldShape {
        FieldShape::Records
    }

    fn save(
        &self,
        record: &R,
        ctx: &Context,
        name: &str,
        options: TagOptions,
        out: &mut PropertyList,
    ) -> DsResult<()> {
        let items = (self.get)(record);
        if options.omitempty && items.is_empty() {
            return Ok(());
        }
        if !options.flatten {
            let values = items
                .iter()
                .map(|item| save_nested(ctx, item).map(|e| Value::Entity(Box::new(e))))
                .collect::<DsResult<Vec<_>>>()?;
            out.push(Property {
                name: name.to_string(),
                value: Value::List(values),
                no_index: options.noindex,
            });
            return Ok(());
        }

        // Flattened: one list property per nested name, one element per item.
        let schema = Schema::<N>::cached()?;
        let mut groups: Vec<Property> = Vec::new();
        for item in items {
            let mut props = PropertyList::new();
            schema.save_fields(item, ctx, name, options.noindex, &mut props)?;
            for prop in props {
                match groups.iter_mut().find(|g| g.name == prop.name) {
                    Some(group) => {
                        group.no_index |= prop.no_index;
                        if let Value::List(values) = &mut group.value {
                            values.push(prop.value);
                        }
                    }
                    None => groups.push(Property {
                        name: prop.name,
                        value: Value::List(vec![prop.value]),
                        no_index: prop.no_index,
                    }),
                }
            }
        }
        out.extend(groups);
        Ok(())
    }

    fn load(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        full: &str,
        rest: Option<&str>,
        value: Value,
        struct_type: &str,
    ) -> DsResult<()> {
        if let Some(rest) = rest {
            return self.load_flattened(record, cx, full, rest, value);
        }
        if cx.first_occurrence(full) {
            (self.get_mut)(record).clear();
        }
        let elements = match value {
            Value::List(values) => values,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        let mut first_err = None;
        for element in elements {
            let mut nested = N::default();
            let loaded = load_nested(&mut nested, cx, full, element, struct_type);
            let fatal = matches!(loaded, Err(ref e) if !e.is_field_mismatch());
            note_error(&mut first_err, loaded, cx.suppress);
            if !fatal {
                (self.get_mut)(record).push(nested);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn flattened_names(&self) -> DsResult<Vec<(String, bool)>> {
        Schema::<N>::cached()?.property_names()
    }
}

pub(crate) struct TranslatedAccess<R, T> {
    pub get: fn(&R) -> &T,
    pub get_mut: fn(&mut R) -> &mut T,
}

impl<R, T: PropertyTranslator + 'static> FieldAccess<R> for TranslatedAccess<R, T> {
    fn shape(&self) -> FieldShape {
        FieldShape::Translated
    }

    fn save(
        &self,
        record: &R,
        ctx: &Context,
        name: &str,
        options: TagOptions,
        out: &mut PropertyList,
    ) -> DsResult<()> {
        let value = (self.get)(record).to_property_value(ctx)?;
        if options.omitempty && value.is_zero() {
            return Ok(());
        }
        out.push(Property {
            name: name.to_string(),
            value,
            no_index: options.noindex,
        });
        Ok(())
    }

    fn load(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        full: &str,
        rest: Option<&str>,
        value: Value,
        struct_type: &str,
    ) -> DsResult<()> {
        if rest.is_some() {
            return Err(DsError::field_mismatch(struct_type, full, NO_SUCH_FIELD));
        }
        if !cx.first_occurrence(full) {
            return Err(DsError::field_mismatch(struct_type, full, MULTIPLE_VALUES));
        }
        *(self.get_mut)(record) = T::from_property_value(cx.ctx, value)?;
        Ok(())
    }
}

pub(crate) struct LoadSaverAccess<R, T> {
    pub get: fn(&R) -> &T,
    pub get_mut: fn(&mut R) -> &mut T,
}

impl<R, T: PropertyLoadSaver + Default + 'static> FieldAccess<R> for LoadSaverAccess<R, T> {
    fn shape(&self) -> FieldShape {
        FieldShape::LoadSaver
    }

    fn save(
        &self,
        record: &R,
        ctx: &Context,
        name: &str,
        options: TagOptions,
        out: &mut PropertyList,
    ) -> DsResult<()> {
        let field = (self.get)(record);
        let properties = field.save(ctx)?;
        if options.omitempty && properties.is_empty() {
            return Ok(());
        }
        out.push(Property {
            name: name.to_string(),
            value: Value::Entity(Box::new(Entity {
                key: field.saved_key(),
                properties,
            })),
            no_index: options.noindex,
        });
        Ok(())
    }

    fn load(
        &self,
        record: &mut R,
        cx: &mut LoadCx<'_>,
        full: &str,
        rest: Option<&str>,
        value: Value,
        struct_type: &str,
    ) -> DsResult<()> {
        if rest.is_some() {
            return Err(DsError::field_mismatch(struct_type, full, NO_SUCH_FIELD));
        }
        if !cx.first_occurrence(full) {
            return Err(DsError::field_mismatch(struct_type, full, MULTIPLE_VALUES));
        }
        let mut loaded = T::default();
        let result = match value {
            Value::Entity(entity) => {
                let Entity { key, properties } = *entity;
                let result = loaded.load(cx.ctx, properties);
                match key {
                    Some(key) => loaded.load_key(&key).and(result),
                    None => result,
                }
            }
            Value::Null => Ok(()),
            other => {
                return Err(DsError::field_mismatch(
                    struct_type,
                    full,
                    type_mismatch(&other, "entity"),
                ))
            }
        };
        *(self.get_mut)(record) = loaded;
        result
    }
}
