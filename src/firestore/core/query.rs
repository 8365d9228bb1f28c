use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::{Bound, FieldFilter, OrderBy, OrderDirection, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A query as written by the user. Converted to a [`Target`] before it is sent
/// to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection or document at `path`.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 == 0 {
            return Err(invalid_argument(
                "Queries must reference a collection (odd number of path segments)",
            ));
        }
        Ok(Self::at_path(path))
    }

    /// Query across every collection named `collection_id`.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn without_limit(mut self) -> Self {
        self.limit = None;
        self.limit_type = LimitType::First;
        self
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns every document of its collection, in key order.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    /// Same query, rooted at one concrete collection instead of a group.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit orders, followed by any inequality fields and finally the key,
    /// all in the direction of the last explicit order.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|o| o.field().clone()).collect();
        let last_direction = self
            .explicit_order_by
            .last()
            .map(OrderBy::direction)
            .unwrap_or(OrderDirection::Ascending);

        for field in self.inequality_fields() {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, document: &MutableDocument) -> bool {
        let document_path = document.key().path();
        match &self.collection_group {
            Some(group) => {
                document.key().has_collection_id(group) && self.path.is_prefix_of(document_path)
            }
            None if DocumentKey::is_document_key(&self.path) => &self.path == document_path,
            None => self.path.is_immediate_parent_of(document_path),
        }
    }

    // Documents missing an explicitly ordered field are excluded.
    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field().is_key_field() || document.field(order.field()).is_some())
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            if bound.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if bound.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Orders documents the way query results are returned.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let mut saw_key = false;
        for order in self.normalized_order_by() {
            saw_key |= order.field().is_key_field();
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        if saw_key {
            Ordering::Equal
        } else {
            left.key().cmp(right.key())
        }
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by.iter().map(OrderBy::flipped).collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::FilterOperator;
    use crate::firestore::model::{ObjectValue, SnapshotVersion};
    use crate::firestore::value::FirestoreValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn scored(path: &str, score: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&field("score"), FirestoreValue::from_integer(score));
        MutableDocument::new_found(DocumentKey::from_string(path).unwrap(), SnapshotVersion::min(), data)
    }

    #[test]
    fn matches_only_immediate_children() {
        let query = Query::collection("rooms").unwrap();
        assert!(query.matches(&scored("rooms/a", 1)));
        assert!(!query.matches(&scored("rooms/a/messages/b", 1)));
        assert!(!query.matches(&scored("halls/a", 1)));
    }

    #[test]
    fn collection_group_matches_nested_collections() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&scored("rooms/a/messages/b", 1)));
        assert!(!query.matches(&scored("rooms/a", 1)));
    }

    #[test]
    fn normalized_order_appends_inequality_and_key() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_filter(FieldFilter::new(
                field("score"),
                FilterOperator::GreaterThan,
                FirestoreValue::from_integer(1),
            ))
            .with_order_by(OrderBy::descending(field("name")));
        let order = query.normalized_order_by();
        assert_eq!(order.len(), 3);
        assert_eq!(order[1], OrderBy::descending(field("score")));
        assert_eq!(order[2], OrderBy::descending(FieldPath::document_id()));
    }

    #[test]
    fn compare_orders_by_field_then_key() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::descending(field("score")));
        assert_eq!(
            query.compare(&scored("rooms/a", 10), &scored("rooms/b", 7)),
            Ordering::Less
        );
        assert_eq!(
            query.compare(&scored("rooms/b", 7), &scored("rooms/a", 7)),
            Ordering::Greater
        );
    }

    #[test]
    fn start_bound_excludes_earlier_documents() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::ascending(field("score")))
            .starting_at(Bound::new(vec![FirestoreValue::from_integer(5)], true));
        assert!(query.matches(&scored("rooms/a", 5)));
        assert!(!query.matches(&scored("rooms/b", 4)));
    }

    #[test]
    fn limit_to_last_flips_target_order() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::ascending(field("score")))
            .with_limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by[0], OrderBy::descending(field("score")));
        assert_ne!(
            query.canonical_id(),
            query.clone().with_limit_to_first(2).canonical_id()
        );
    }
}
