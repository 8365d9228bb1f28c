use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, ObjectValue, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{FirestoreValue, ValueKind};
use crate::util::hard_assert;

/// Condition the backend checks before applying a mutation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    NumericIncrement(FirestoreValue),
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Local estimate of the transform's result.
    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                numeric_add(&base, operand)
            }
        }
    }

    fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: &FirestoreValue,
    ) -> FirestoreValue {
        match &self.operation {
            // Array transforms are idempotent, so the local computation is exact.
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            _ => server_result.clone(),
        }
    }

    /// Value that non-idempotent transforms must be based on when replayed.
    fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match &self.operation {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FirestoreValue::from_integer(0)),
            },
            _ => None,
        }
    }
}

/// Server acknowledgement for one mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }
}

/// A single document write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Writes only the fields named in `field_mask`; masked fields missing from
    /// `data` are deleted.
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        field_mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Checks the precondition without writing. Only used inside transactions.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Patch that must find an existing document, like a user-level update.
    pub fn patch(key: DocumentKey, data: ObjectValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    /// Attaches transforms to a set or patch. Other mutations ignore them.
    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => *field_transforms = transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Fields written by a patch. Other mutations affect the whole document.
    pub fn field_mask(&self) -> Option<&FieldMask> {
        match self {
            Mutation::Patch { field_mask, .. } => Some(field_mask),
            _ => None,
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self, Mutation::Patch { .. })
    }

    /// Applies the mutation to `document` as an optimistic local write.
    ///
    /// `previous_mask` lists the fields changed by earlier mutations, where `None`
    /// means the whole document was replaced. The returned mask folds this
    /// mutation in the same way.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for(document) {
            return previous_mask;
        }

        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let transform_results =
                    local_transform_results(document, field_transforms, local_write_time);
                let mut new_data = value.clone();
                new_data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                data,
                field_mask,
                field_transforms,
                ..
            } => {
                let transform_results =
                    local_transform_results(document, field_transforms, local_write_time);
                let mut new_data = document.data().clone();
                new_data.set_all(patch_values(data, field_mask));
                new_data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                previous_mask.map(|mask| {
                    mask.union_with(field_mask.fields().iter().cloned())
                        .union_with(field_transforms.iter().map(|t| t.field().clone()))
                })
            }
            Mutation::Delete { .. } => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Applies the server-acknowledged outcome of this mutation to `document`.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let transform_results =
                    server_transform_results(document, field_transforms, &result.transform_results);
                let mut new_data = value.clone();
                new_data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                data,
                field_mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    // The patch was applied by the server, but to a document we have
                    // not seen. Its contents are unknown until the next read.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results =
                    server_transform_results(document, field_transforms, &result.transform_results);
                let mut new_data = document.data().clone();
                new_data.set_all(patch_values(data, field_mask));
                new_data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Values that non-idempotent transforms in this mutation depend on, if any.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<ObjectValue> {
        let mut base: Option<ObjectValue> = None;
        for transform in self.field_transforms() {
            let existing = document.field(transform.field());
            if let Some(value) = transform.compute_base_value(existing) {
                base.get_or_insert_with(ObjectValue::empty)
                    .set(transform.field(), value);
            }
        }
        base
    }
}

/// Builds the single mutation that takes a remote document to `document`, the
/// result of applying all pending local mutations. `mask` is the folded mask
/// returned by [`Mutation::apply_to_local_view`].
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let mask = match mask {
        Some(mask) if mask.is_empty() => return None,
        Some(mask) => mask,
        None => {
            return Some(if document.is_no_document() {
                Mutation::delete(document.key().clone())
            } else {
                Mutation::set(document.key().clone(), document.data().clone())
            });
        }
    };

    let data = document.data();
    let mut patch = ObjectValue::empty();
    let mut mask_set = FieldMask::empty();
    for field in mask.fields() {
        if mask_set.fields().contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = data.field(&path);
        // A deleted leaf whose parent still exists is written as the parent.
        if value.is_none() && path.len() > 1 {
            path = path.pop_last();
            value = data.field(&path);
        }
        match value {
            Some(value) => patch.set(&path, value.clone()),
            None => patch.delete(&path),
        }
        mask_set.insert(path);
    }

    Some(Mutation::Patch {
        key: document.key().clone(),
        data: patch,
        field_mask: mask_set,
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}

fn patch_values(
    data: &ObjectValue,
    field_mask: &FieldMask,
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    field_mask
        .fields()
        .iter()
        .filter(|path| !path.is_empty())
        .map(|path| (path.clone(), data.field(path).cloned()))
        .collect()
}

fn local_transform_results(
    document: &MutableDocument,
    transforms: &[FieldTransform],
    local_write_time: Timestamp,
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    transforms
        .iter()
        .map(|transform| {
            let previous = document.field(transform.field());
            (
                transform.field().clone(),
                Some(transform.apply_to_local_view(previous, local_write_time)),
            )
        })
        .collect()
}

fn server_transform_results(
    document: &MutableDocument,
    transforms: &[FieldTransform],
    server_results: &[FirestoreValue],
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    hard_assert(
        transforms.len() == server_results.len(),
        format!(
            "server transform result count ({}) should match field transform count ({})",
            server_results.len(),
            transforms.len()
        ),
    );
    transforms
        .iter()
        .zip(server_results)
        .map(|(transform, result)| {
            let previous = document.field(transform.field());
            (
                transform.field().clone(),
                Some(transform.apply_to_remote_document(previous, result)),
            )
        })
        .collect()
}

fn existing_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn array_union(previous: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing_array(previous);
    for element in additions {
        if !values.iter().any(|candidate| candidate.equals(element)) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing_array(previous)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle.equals(candidate)))
        .collect();
    FirestoreValue::from_array(values)
}

fn numeric_add(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        _ => operand.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
        let mut value = ObjectValue::empty();
        for (field, entry) in entries {
            value.set(&path(field), entry.clone());
        }
        value
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn set_replaces_document_locally() {
        let mut document = MutableDocument::new_found(
            key(),
            version(1),
            object(&[("a", FirestoreValue::from_integer(1))]),
        );
        let mutation = Mutation::set(key(), object(&[("b", FirestoreValue::from_integer(2))]));
        let mask = mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(document.has_local_mutations());
        assert_eq!(document.field(&path("a")), None);
        assert_eq!(document.field(&path("b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut document = MutableDocument::new_no_document(key(), version(1));
        let mutation = Mutation::patch(
            key(),
            object(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new([path("a")]),
        );
        let mask = mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(document.is_no_document());
    }

    #[test]
    fn patch_deletes_masked_fields_missing_from_data() {
        let mut document = MutableDocument::new_found(
            key(),
            version(1),
            object(&[
                ("a", FirestoreValue::from_integer(1)),
                ("b", FirestoreValue::from_integer(2)),
            ]),
        );
        let mutation = Mutation::patch(key(), ObjectValue::empty(), FieldMask::new([path("a")]));
        let mask = mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::new([path("a")])));
        assert_eq!(document.field(&path("a")), None);
        assert_eq!(document.field(&path("b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn increment_uses_local_value_and_records_base() {
        let mut document = MutableDocument::new_found(
            key(),
            version(1),
            object(&[("count", FirestoreValue::from_integer(4))]),
        );
        let mutation = Mutation::patch(key(), ObjectValue::empty(), FieldMask::empty())
            .with_transforms(vec![FieldTransform::new(
                path("count"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(3)),
            )]);
        let base = mutation.extract_transform_base_value(&document).unwrap();
        assert_eq!(base.field(&path("count")), Some(&FirestoreValue::from_integer(4)));

        mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(document.field(&path("count")), Some(&FirestoreValue::from_integer(7)));
    }

    #[test]
    fn remote_patch_on_missing_document_is_unknown() {
        let mut document = MutableDocument::new_invalid(key());
        let mutation = Mutation::patch(
            key(),
            object(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new([path("a")]),
        );
        mutation.apply_to_remote_document(&mut document, &MutationResult::new(version(3)));
        assert!(document.is_unknown_document());
        assert_eq!(document.version(), version(3));
    }

    #[test]
    fn overlay_for_patched_document_is_patch() {
        let mut document = MutableDocument::new_found(
            key(),
            version(1),
            object(&[("a", FirestoreValue::from_integer(1))]),
        );
        let mutation = Mutation::patch(
            key(),
            object(&[("b.c", FirestoreValue::from_integer(2))]),
            FieldMask::new([path("b.c")]),
        );
        let mask = mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        let overlay = calculate_overlay_mutation(&document, mask.as_ref()).unwrap();
        match overlay {
            Mutation::Patch {
                data,
                field_mask,
                precondition,
                ..
            } => {
                assert_eq!(field_mask, FieldMask::new([path("b.c")]));
                assert_eq!(data.field(&path("b.c")), Some(&FirestoreValue::from_integer(2)));
                assert!(precondition.is_none());
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }

    #[test]
    fn overlay_for_deleted_document_is_delete() {
        let mut document = MutableDocument::new_found(key(), version(1), ObjectValue::empty());
        Mutation::delete(key()).apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        let overlay = calculate_overlay_mutation(&document, None).unwrap();
        assert_eq!(overlay, Mutation::delete(key()));
    }
}
