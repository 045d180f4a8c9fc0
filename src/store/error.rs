use ulid::Ulid;

use crate::model::{Collection, Status};

#[derive(Debug)]
pub enum StoreError {
    NotFound(Collection, Ulid),
    /// A conditional write found the document in an unexpected status.
    PreconditionFailed {
        collection: Collection,
        id: Ulid,
        expected: Status,
        actual: Status,
    },
    /// The booking lifecycle does not allow this status change.
    InvalidTransition {
        collection: Collection,
        id: Ulid,
        from: Option<Status>,
        to: Status,
    },
    /// Optimistic commit kept failing validation; carries the attempt count.
    Contention(u32),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(collection, id) => {
                write!(f, "not found: {}/{id}", collection.as_str())
            }
            StoreError::PreconditionFailed {
                collection,
                id,
                expected,
                actual,
            } => write!(
                f,
                "precondition failed on {}/{id}: expected {}, found {}",
                collection.as_str(),
                expected.as_str(),
                actual.as_str()
            ),
            StoreError::InvalidTransition {
                collection,
                id,
                from,
                to,
            } => write!(
                f,
                "invalid transition on {}/{id}: {} -> {}",
                collection.as_str(),
                from.map_or("none", Status::as_str),
                to.as_str()
            ),
            StoreError::Contention(attempts) => {
                write!(f, "transaction aborted after {attempts} conflicting attempts")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
