use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch or transform.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    /// True when `path` equals or lies below one of the mask's fields.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<I>(mut self, other: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        self.fields.extend(other);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn covers_nested_fields() {
        let mask = FieldMask::new([path("a"), path("b.c")]);
        assert!(mask.covers(&path("a.x")));
        assert!(mask.covers(&path("b.c")));
        assert!(!mask.covers(&path("b")));
        let merged = mask.union_with([path("d")]);
        assert_eq!(merged.fields().len(), 3);
    }
}
