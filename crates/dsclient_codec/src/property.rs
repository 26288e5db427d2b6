//! Properties, property lists and entities.

use crate::key::Key;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// A named value with an index flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Dotted property name.
    pub name: String,
    /// The value.
    pub value: Value,
    /// Excludes the property from indexes.
    #[serde(default)]
    pub no_index: bool,
}

impl Property {
    /// Creates an indexed property.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            no_index: false,
        }
    }

    /// Creates a property excluded from indexes.
    pub fn unindexed(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            no_index: true,
            ..Self::new(name, value)
        }
    }
}

/// An ordered sequence of properties.
///
/// Order only matters between entries of the same name, which together form
/// the elements of a multi-valued property.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyList(Vec<Property>);

impl PropertyList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of the first property named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Iterates over the values of every property named `name`.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.0.iter().filter(move |p| p.name == name).map(|p| &p.value)
    }

    /// Appends a property.
    pub fn push_value(&mut self, name: impl Into<String>, value: impl Into<Value>, no_index: bool) {
        self.0.push(Property {
            name: name.into(),
            value: value.into(),
            no_index,
        });
    }

    /// Removes every property named `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|p| p.name != name);
    }

    /// Returns the underlying properties.
    #[must_use]
    pub fn into_inner(self) -> Vec<Property> {
        self.0
    }
}

impl Deref for PropertyList {
    type Target = Vec<Property>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PropertyList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Property>> for PropertyList {
    fn from(props: Vec<Property>) -> Self {
        Self(props)
    }
}

impl FromIterator<Property> for PropertyList {
    fn from_iter<I: IntoIterator<Item = Property>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for PropertyList {
    type Item = Property;
    type IntoIter = std::vec::IntoIter<Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a PropertyList {
    type Item = &'a Property;
    type IntoIter = std::slice::Iter<'a, Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A keyed record: an optional key plus its properties.
///
/// Also used as a property value to carry nested records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Entity {
    /// The entity key, absent for most nested entities.
    pub key: Option<Key>,
    /// The entity properties.
    pub properties: PropertyList,
}

impl Entity {
    /// Creates an entity.
    #[must_use]
    pub fn new(key: Option<Key>, properties: PropertyList) -> Self {
        Self { key, properties }
    }
}
