// ── Attribute maps ──
//
// Named variants attached to an item. Updates either replace the whole map
// (`Set`) or merge into it (`Update`), where a Null value removes the key.

use std::collections::BTreeMap;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use super::variant::Variant;

/// How an attribute update is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum AttributeMode {
    /// Replace the entire map.
    Set,
    /// Merge; Null values remove their key.
    Update,
}

/// Mapping from attribute name to value. Names are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Variant>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Variant>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Variant> {
        self.0.remove(name)
    }

    pub fn into_inner(self) -> BTreeMap<String, Variant> {
        self.0
    }

    /// Apply `update` in `mode` and return the effective change, or `None`
    /// if the map is unchanged.
    ///
    /// For `Set` the change is the complete new map. For `Update` it holds
    /// every key whose value changed, with Null marking removed keys.
    pub fn apply(&mut self, update: &Attributes, mode: AttributeMode) -> Option<Attributes> {
        match mode {
            AttributeMode::Set => {
                // Nulls carry no meaning in a full replacement.
                let replacement: BTreeMap<String, Variant> = update
                    .0
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if replacement == self.0 {
                    return None;
                }
                self.0 = replacement;
                Some(self.clone())
            }
            AttributeMode::Update => {
                let mut diff = BTreeMap::new();
                for (name, value) in &update.0 {
                    if value.is_null() {
                        if self.0.remove(name).is_some() {
                            diff.insert(name.clone(), Variant::Null);
                        }
                    } else if self.0.get(name) != Some(value) {
                        self.0.insert(name.clone(), value.clone());
                        diff.insert(name.clone(), value.clone());
                    }
                }
                (!diff.is_empty()).then_some(Attributes(diff))
            }
        }
    }
}

impl Deref for Attributes {
    type Target = BTreeMap<String, Variant>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<BTreeMap<String, Variant>> for Attributes {
    fn from(map: BTreeMap<String, Variant>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Variant>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Attributes {
    type Item = (String, Variant);
    type IntoIter = std::collections::btree_map::IntoIter<String, Variant>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
