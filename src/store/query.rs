use std::cmp::Ordering;

use crate::limits::MAX_IN_VALUES;
use crate::model::*;

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq(Field, Value),
    In(Field, Vec<Value>),
    Gte(Field, Value),
    Lte(Field, Value),
}

/// Ids and times are ordered; statuses only compare for equality.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Time(x), Value::Time(y)) => Some(x.cmp(y)),
        (Value::Id(x), Value::Id(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Predicate {
    /// A document missing the field never matches.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Predicate::Eq(field, want) => doc.field(*field).as_ref() == Some(want),
            Predicate::In(field, wants) => doc.field(*field).is_some_and(|v| wants.contains(&v)),
            Predicate::Gte(field, bound) => doc
                .field(*field)
                .and_then(|v| compare(&v, bound))
                .is_some_and(Ordering::is_ge),
            Predicate::Lte(field, bound) => doc
                .field(*field)
                .and_then(|v| compare(&v, bound))
                .is_some_and(Ordering::is_le),
        }
    }
}

/// A collection plus a conjunction of predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub collection: Collection,
    pub predicates: Vec<Predicate>,
}

impl Query {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            predicates: Vec::new(),
        }
    }

    pub fn eq(mut self, field: Field, value: Value) -> Self {
        self.predicates.push(Predicate::Eq(field, value));
        self
    }

    pub fn is_in(mut self, field: Field, values: impl IntoIterator<Item = Value>) -> Self {
        self.predicates.push(Predicate::In(field, values.into_iter().collect()));
        self
    }

    pub fn gte(mut self, field: Field, value: Value) -> Self {
        self.predicates.push(Predicate::Gte(field, value));
        self
    }

    pub fn lte(mut self, field: Field, value: Value) -> Self {
        self.predicates.push(Predicate::Lte(field, value));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.collection() == self.collection && self.predicates.iter().all(|p| p.matches(doc))
    }

    pub(super) fn validate(&self) -> Result<(), StoreError> {
        let oversized = self
            .predicates
            .iter()
            .any(|p| matches!(p, Predicate::In(_, values) if values.len() > MAX_IN_VALUES));
        if oversized {
            return Err(StoreError::LimitExceeded("too many values in IN predicate"));
        }
        Ok(())
    }
}
