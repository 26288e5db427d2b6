//! Hierarchical, namespaced entity keys.

use crate::error::{DsError, DsResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Names an entity.
///
/// A key has a kind, either an integer id or a string name (or neither, for
/// an incomplete key), an optional parent forming an ancestor chain, and a
/// namespace shared by the whole chain. Keys are immutable and cheap to clone;
/// equality is structural over the full ancestor chain.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    inner: Arc<KeyInner>,
}

#[derive(PartialEq, Eq, Hash)]
struct KeyInner {
    kind: String,
    id: i64,
    name: String,
    parent: Option<Key>,
    namespace: String,
}

impl Key {
    fn build(kind: &str, id: i64, name: &str, parent: Option<&Key>) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                kind: kind.to_string(),
                id,
                name: name.to_string(),
                parent: parent.cloned(),
                namespace: parent.map(|p| p.namespace().to_string()).unwrap_or_default(),
            }),
        }
    }

    /// Creates an incomplete key; the datastore assigns an id on put.
    #[must_use]
    pub fn incomplete_key(kind: &str, parent: Option<&Key>) -> Self {
        Self::build(kind, 0, "", parent)
    }

    /// Creates a key with a string name.
    #[must_use]
    pub fn name_key(kind: &str, name: &str, parent: Option<&Key>) -> Self {
        Self::build(kind, 0, name, parent)
    }

    /// Creates a key with an integer id.
    #[must_use]
    pub fn id_key(kind: &str, id: i64, parent: Option<&Key>) -> Self {
        Self::build(kind, id, "", parent)
    }

    /// Returns a copy of this key, and of its ancestors, in `namespace`.
    #[must_use]
    pub fn with_namespace(&self, namespace: &str) -> Self {
        let parent = self.parent().map(|p| p.with_namespace(namespace));
        Self {
            inner: Arc::new(KeyInner {
                kind: self.inner.kind.clone(),
                id: self.inner.id,
                name: self.inner.name.clone(),
                parent,
                namespace: namespace.to_string(),
            }),
        }
    }

    /// Returns a complete copy of this key carrying `id`.
    #[must_use]
    pub fn with_id(&self, id: i64) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                kind: self.inner.kind.clone(),
                id,
                name: String::new(),
                parent: self.inner.parent.clone(),
                namespace: self.inner.namespace.clone(),
            }),
        }
    }

    /// The entity kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// The integer id, 0 when the key is named or incomplete.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// The string name, empty when the key has an id or is incomplete.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The parent key, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Key> {
        self.inner.parent.as_ref()
    }

    /// The namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Returns true when neither id nor name is set.
    #[must_use]
    pub fn incomplete(&self) -> bool {
        self.inner.id == 0 && self.inner.name.is_empty()
    }

    /// Returns true when the key and its ancestors are well formed.
    ///
    /// Every element needs a kind; no element may have both an id and a name;
    /// ancestors must be complete and share the namespace.
    #[must_use]
    pub fn valid(&self) -> bool {
        let mut current = Some(self);
        let mut first = true;
        while let Some(key) = current {
            if key.kind().is_empty() || key.id() < 0 {
                return false;
            }
            if key.id() != 0 && !key.name().is_empty() {
                return false;
            }
            if !first && key.incomplete() {
                return false;
            }
            if key.namespace() != self.namespace() {
                return false;
            }
            first = false;
            current = key.parent();
        }
        true
    }

    /// Returns true when `ancestor` is this key or one of its ancestors.
    #[must_use]
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        let mut current = Some(self);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = key.parent();
        }
        false
    }

    /// The root of the ancestor chain.
    #[must_use]
    pub fn root(&self) -> &Key {
        let mut key = self;
        while let Some(parent) = key.parent() {
            key = parent;
        }
        key
    }

    /// The ancestor chain, root first, ending with this key.
    #[must_use]
    pub fn path(&self) -> Vec<&Key> {
        let mut path = Vec::new();
        let mut current = Some(self);
        while let Some(key) = current {
            path.push(key);
            current = key.parent();
        }
        path.reverse();
        path
    }

    /// Encodes the key into its opaque, URL-safe string form.
    ///
    /// The form is stable across backends for the same logical key.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        if ciborium::ser::into_writer(&self.repr(), &mut buf).is_err() {
            buf.clear();
        }
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Decodes a key previously produced by [`Key::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidKey`] for malformed input.
    pub fn decode(encoded: &str) -> DsResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|_| DsError::InvalidKey)?;
        Self::from_binary(&bytes)
    }

    /// Serialises the key as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_json(&self) -> DsResult<String> {
        serde_json::to_string(self).map_err(|e| DsError::invalid_value(e.to_string()))
    }

    /// Parses a key from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidKey`] for malformed input.
    pub fn from_json(json: &str) -> DsResult<Self> {
        serde_json::from_str(json).map_err(|_| DsError::InvalidKey)
    }

    /// Serialises the key in the self-describing binary (CBOR) form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_binary(&self) -> DsResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.repr(), &mut buf)
            .map_err(|e| DsError::invalid_value(e.to_string()))?;
        Ok(buf)
    }

    /// Parses a key from its binary form.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidKey`] for malformed input.
    pub fn from_binary(bytes: &[u8]) -> DsResult<Self> {
        let repr: KeyRepr = ciborium::de::from_reader(bytes).map_err(|_| DsError::InvalidKey)?;
        Self::from_repr(repr)
    }

    fn repr(&self) -> KeyRepr {
        KeyRepr {
            namespace: self.namespace().to_string(),
            path: self
                .path()
                .into_iter()
                .map(|k| PathElement {
                    kind: k.kind().to_string(),
                    id: (k.id() != 0).then_some(k.id()),
                    name: (!k.name().is_empty()).then(|| k.name().to_string()),
                })
                .collect(),
        }
    }

    fn from_repr(repr: KeyRepr) -> DsResult<Self> {
        if repr.path.is_empty() {
            return Err(DsError::InvalidKey);
        }
        let mut key: Option<Key> = None;
        for element in repr.path {
            if element.id.is_some() && element.name.is_some() {
                return Err(DsError::InvalidKey);
            }
            let next = Key::build(
                &element.kind,
                element.id.unwrap_or(0),
                element.name.as_deref().unwrap_or(""),
                key.as_ref(),
            );
            key = Some(next);
        }
        let key = key.ok_or(DsError::InvalidKey)?.with_namespace(&repr.namespace);
        if !key.valid() {
            return Err(DsError::InvalidKey);
        }
        Ok(key)
    }

    fn cmp_element(&self, other: &Key) -> Ordering {
        self.kind().cmp(other.kind()).then_with(|| {
            match (self.name().is_empty(), other.name().is_empty()) {
                (true, true) => self.id().cmp(&other.id()),
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => self.name().cmp(other.name()),
            }
        })
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace().cmp(other.namespace()).then_with(|| {
            let (a, b) = (self.path(), other.path());
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = x.cmp_element(y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        })
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for key in self.path() {
            if key.name().is_empty() {
                write!(f, "/{},{}", key.kind(), key.id())?;
            } else {
                write!(f, "/{},{}", key.kind(), key.name())?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace().is_empty() {
            write!(f, "Key({self})")
        } else {
            write!(f, "Key({}:{self})", self.namespace())
        }
    }
}

#[derive(Serialize, Deserialize)]
struct KeyRepr {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    namespace: String,
    path: Vec<PathElement>,
}

#[derive(Serialize, Deserialize)]
struct PathElement {
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.repr().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = KeyRepr::deserialize(deserializer)?;
        Key::from_repr(repr).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_and_completeness() {
        let parent = Key::name_key("Parent", "p", None).with_namespace("ns");
        let child = Key::id_key("Child", 42, Some(&parent));
        assert_eq!(child.namespace(), "ns");
        assert_eq!(child.parent(), Some(&parent));
        assert!(!child.incomplete());
        assert!(child.valid());

        let incomplete = Key::incomplete_key("Child", Some(&parent));
        assert!(incomplete.incomplete());
        assert!(incomplete.valid());
    }

    #[test]
    fn invalid_keys() {
        assert!(!Key::id_key("", 1, None).valid());

        let incomplete_parent = Key::incomplete_key("P", None);
        assert!(!Key::id_key("C", 1, Some(&incomplete_parent)).valid());

        let parent = Key::id_key("P", 1, None).with_namespace("a");
        let child = Key::id_key("C", 1, Some(&parent));
        assert!(child.valid());
        let mismatched = Key {
            inner: Arc::new(KeyInner {
                kind: "C".into(),
                id: 1,
                name: String::new(),
                parent: Some(parent),
                namespace: "b".into(),
            }),
        };
        assert!(!mismatched.valid());
    }

    #[test]
    fn display_path_form() {
        let parent = Key::id_key("Kind", 1, None);
        let child = Key::name_key("Child", "x", Some(&parent));
        assert_eq!(child.to_string(), "/Kind,1/Child,x");
    }

    #[test]
    fn encode_decode_roundtrip() {
        let parent = Key::name_key("Parent", "p", None).with_namespace("tenant");
        let key = Key::id_key("Data", 111, Some(&parent));
        let decoded = Key::decode(&key.encode()).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(decoded.namespace(), "tenant");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(Key::decode("not a key!"), Err(DsError::InvalidKey));
        assert_eq!(Key::decode(""), Err(DsError::InvalidKey));
    }

    #[test]
    fn json_and_binary_roundtrip() {
        let key = Key::id_key("B", 7, Some(&Key::name_key("A", "a", None)));
        assert_eq!(Key::from_json(&key.to_json().unwrap()).unwrap(), key);
        assert_eq!(Key::from_binary(&key.to_binary().unwrap()).unwrap(), key);
    }

    #[test]
    fn ordering_ids_before_names() {
        let a = Key::id_key("K", 5, None);
        let b = Key::id_key("K", 10, None);
        let c = Key::name_key("K", "a", None);
        let child = Key::id_key("K", 1, Some(&a));
        assert!(a < b);
        assert!(b < c);
        assert!(a < child);
        assert!(child < b);
    }

    #[test]
    fn has_ancestor_walks_chain() {
        let root = Key::id_key("R", 1, None);
        let mid = Key::id_key("M", 2, Some(&root));
        let leaf = Key::id_key("L", 3, Some(&mid));
        assert!(leaf.has_ancestor(&root));
        assert!(leaf.has_ancestor(&leaf));
        assert!(!root.has_ancestor(&leaf));
        assert_eq!(leaf.root(), &root);
    }
}
