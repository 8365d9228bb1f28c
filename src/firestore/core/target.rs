use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{compare_values, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self.operator,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let other = document_field_value(document, &self.field);
        match self.operator {
            FilterOperator::NotEqual => match other {
                Some(other) if !other.is_null() => {
                    compare_values(&other, &self.value) != Ordering::Equal
                }
                _ => false,
            },
            FilterOperator::ArrayContains => other
                .as_ref()
                .and_then(FirestoreValue::as_array)
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => {
                let (Some(array), Some(needles)) = (
                    other.as_ref().and_then(FirestoreValue::as_array),
                    self.value.as_array(),
                ) else {
                    return false;
                };
                array.values().iter().any(|value| needles.contains(value))
            }
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.contains(&other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(other) => !other.is_null() && !candidates.contains(&other),
                    None => false,
                }
            }
            _ => match other {
                Some(other) if other.type_order() == self.value.type_order() => {
                    let ordering = compare_values(&other, &self.value);
                    match self.operator {
                        FilterOperator::LessThan => ordering == Ordering::Less,
                        FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
                        FilterOperator::Equal => ordering == Ordering::Equal,
                        FilterOperator::GreaterThan => ordering == Ordering::Greater,
                        FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
                        _ => false,
                    }
                }
                _ => false,
            },
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            canonical_value(&self.value)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, OrderDirection::Ascending)
    }

    pub fn descending(field: FieldPath) -> Self {
        Self::new(field, OrderDirection::Descending)
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    pub(crate) fn flipped(&self) -> Self {
        let direction = match self.direction {
            OrderDirection::Ascending => OrderDirection::Descending,
            OrderDirection::Descending => OrderDirection::Ascending,
        };
        Self::new(self.field.clone(), direction)
    }

    /// Compares two documents on this order's field.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            OrderDirection::Ascending => ordering,
            OrderDirection::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        let direction = match self.direction {
            OrderDirection::Ascending => "asc",
            OrderDirection::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }
}

/// Cursor position along a query's order-by fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field().is_key_field() {
                match reference_to_key(component) {
                    Some(key) => key.cmp(document.key()),
                    None => Ordering::Equal,
                }
            } else {
                match document.field(order.field()) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order.direction() {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Whether a start bound excludes `document`.
    pub(crate) fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering == Ordering::Greater
        } else {
            ordering != Ordering::Less
        }
    }

    /// Whether an end bound excludes `document`.
    pub(crate) fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering == Ordering::Less
        } else {
            ordering != Ordering::Greater
        }
    }

    fn canonical_id(&self) -> String {
        self.position
            .iter()
            .map(canonical_value)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Server-side form of a query: filters, a fully normalized order and the limit,
/// with limit-to-last already flipped into a limit-to-first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Target that watches exactly one document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: vec![OrderBy::ascending(FieldPath::document_id())],
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        if let Some(bound) = &self.start_at {
            let side = if bound.inclusive() { "b:" } else { "a:" };
            let _ = write!(id, "|lb:{side}{}", bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            let side = if bound.inclusive() { "a:" } else { "b:" };
            let _ = write!(id, "|ub:{side}{}", bound.canonical_id());
        }
        id
    }

    /// Collection group the target reads from.
    pub fn collection_group_id(&self) -> Option<&str> {
        match &self.collection_group {
            Some(group) => Some(group.as_str()),
            None if self.is_document_target() => self.path.segment(self.path.len() - 2),
            None => self.path.last_segment(),
        }
    }
}

/// Value of `field` in `document`, with `__name__` resolving to the key.
pub(crate) fn document_field_value(
    document: &MutableDocument,
    field: &FieldPath,
) -> Option<FirestoreValue> {
    if field.is_key_field() {
        return Some(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}

fn reference_to_key(value: &FirestoreValue) -> Option<DocumentKey> {
    let ValueKind::Reference(reference) = value.kind() else {
        return None;
    };
    let path = match reference.split_once("/documents/") {
        Some((_, path)) => path,
        None => reference.as_str(),
    };
    DocumentKey::from_string(path).ok()
}

pub(crate) fn canonical_value(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => format!("{value:?}"),
        ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
        ValueKind::String(value) => value.clone(),
        ValueKind::Bytes(value) => value.to_base64(),
        ValueKind::Reference(value) => value.clone(),
        ValueKind::GeoPoint(value) => format!("geo({},{})", value.latitude(), value.longitude()),
        ValueKind::Array(array) => format!(
            "[{}]",
            array
                .values()
                .iter()
                .map(canonical_value)
                .collect::<Vec<_>>()
                .join(",")
        ),
        ValueKind::Map(map) => format!(
            "{{{}}}",
            map.fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_value(value)))
                .collect::<Vec<_>>()
                .join(",")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::ObjectValue;

    fn doc(path: &str, field: &str, value: FirestoreValue) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), value);
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            Default::default(),
            data,
        )
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn comparison_filters_require_matching_type() {
        let document = doc("rooms/a", "score", FirestoreValue::from_integer(5));
        let filter = FieldFilter::new(
            field("score"),
            FilterOperator::GreaterThan,
            FirestoreValue::from_double(4.5),
        );
        assert!(filter.matches(&document));
        let filter = FieldFilter::new(
            field("score"),
            FilterOperator::LessThan,
            FirestoreValue::from_string("z"),
        );
        assert!(!filter.matches(&document));
    }

    #[test]
    fn not_in_excludes_missing_fields() {
        let document = doc("rooms/a", "other", FirestoreValue::from_integer(1));
        let filter = FieldFilter::new(
            field("score"),
            FilterOperator::NotIn,
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)]),
        );
        assert!(!filter.matches(&document));
    }

    #[test]
    fn array_contains_any_matches_overlap() {
        let document = doc(
            "rooms/a",
            "tags",
            FirestoreValue::from_array(vec![
                FirestoreValue::from_string("a"),
                FirestoreValue::from_string("b"),
            ]),
        );
        let filter = FieldFilter::new(
            field("tags"),
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec![FirestoreValue::from_string("b")]),
        );
        assert!(filter.matches(&document));
    }

    #[test]
    fn canonical_id_distinguishes_limits() {
        let mut target = Target {
            path: ResourcePath::from_string("rooms").unwrap(),
            collection_group: None,
            filters: Vec::new(),
            order_by: vec![OrderBy::ascending(FieldPath::document_id())],
            limit: None,
            start_at: None,
            end_at: None,
        };
        let unlimited = target.canonical_id();
        target.limit = Some(2);
        assert_ne!(unlimited, target.canonical_id());
        assert_eq!(unlimited, "rooms|f:|ob:__name__asc");
    }
}
