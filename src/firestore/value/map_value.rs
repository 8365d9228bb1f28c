use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut BTreeMap<String, FirestoreValue> {
        &mut self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    /// Follows `segments` through nested maps.
    pub fn get_path(&self, segments: &[String]) -> Option<&FirestoreValue> {
        let (first, rest) = segments.split_first()?;
        let value = self.fields.get(first)?;
        if rest.is_empty() {
            Some(value)
        } else if let ValueKind::Map(child) = value.kind() {
            child.get_path(rest)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_nested_paths() {
        let mut inner = BTreeMap::new();
        inner.insert("bar".to_string(), FirestoreValue::from_integer(1));
        let mut outer = BTreeMap::new();
        outer.insert("foo".to_string(), FirestoreValue::from_map(inner));
        let value = MapValue::new(outer);
        let path = vec!["foo".to_string(), "bar".to_string()];
        assert_eq!(value.get_path(&path), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(value.get_path(&["missing".to_string()]), None);
    }
}
