use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Document contents: a nested map addressed by [`FieldPath`]s.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    value: MapValue,
}

impl ObjectValue {
    pub fn new(value: MapValue) -> Self {
        Self { value }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self::new(MapValue::new(fields))
    }

    pub fn as_map(&self) -> &MapValue {
        &self.value
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.value.get_path(path.segments())
    }

    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        if path.is_empty() {
            if let ValueKind::Map(map) = value.kind() {
                self.value = map.clone();
            }
            return;
        }
        set_value_at_segments(self.value.fields_mut(), path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        if path.is_empty() {
            self.value = MapValue::empty();
            return;
        }
        remove_value_at_segments(self.value.fields_mut(), path.segments());
    }

    /// Applies a batch of writes, where `None` deletes the field.
    pub fn set_all(&mut self, updates: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Mask listing every leaf field; empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut mask = FieldMask::empty();
        collect_leaf_paths(&self.value, &FieldPath::empty(), &mut mask);
        mask
    }
}

fn collect_leaf_paths(map: &MapValue, parent: &FieldPath, mask: &mut FieldMask) {
    for (key, value) in map.fields() {
        let current = parent.child(key.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.fields().is_empty() => {
                collect_leaf_paths(child, &current, mask)
            }
            _ => mask.insert(current),
        }
    }
}

fn set_value_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child_fields = match fields.get(first).map(FirestoreValue::kind) {
        Some(ValueKind::Map(map)) => map.fields().clone(),
        _ => BTreeMap::new(),
    };
    set_value_at_segments(&mut child_fields, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
}

fn remove_value_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(ValueKind::Map(child)) = fields.get(first).map(FirestoreValue::kind) {
        let mut child_fields = child.fields().clone();
        remove_value_at_segments(&mut child_fields, rest);
        fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn sets_and_deletes_nested_fields() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("a.c"), FirestoreValue::from_integer(2));
        object.set(&path("d"), FirestoreValue::from_string("x"));
        assert_eq!(object.field(&path("a.b")), Some(&FirestoreValue::from_integer(1)));

        object.delete(&path("a.b"));
        assert_eq!(object.field(&path("a.b")), None);
        assert_eq!(object.field(&path("a.c")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn overwrites_non_map_parents() {
        let mut object = ObjectValue::empty();
        object.set(&path("a"), FirestoreValue::from_integer(1));
        object.set(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(object.field(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("c"), FirestoreValue::from_map(BTreeMap::new()));
        let mask = object.field_mask();
        let fields: Vec<String> = mask.fields().iter().map(FieldPath::canonical_string).collect();
        assert_eq!(fields, vec!["a.b".to_string(), "c".to_string()]);
    }
}
