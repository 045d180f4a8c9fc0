use ulid::Ulid;

use crate::limits::MAX_BATCH_WRITES;
use crate::model::*;

use super::{Store, StoreError};

/// Writes applied together without read validation. Conditional
/// transitions (`expect`) are the only guard.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, doc: Document) -> &mut Self {
        self.writes.push(Write::Put(doc));
        self
    }

    pub fn delete(&mut self, collection: Collection, id: Ulid) -> &mut Self {
        self.writes.push(Write::Delete { collection, id });
        self
    }

    pub fn transition(
        &mut self,
        collection: Collection,
        id: Ulid,
        to: Status,
        reason: Option<String>,
        at: Ms,
        expect: Option<Status>,
    ) -> &mut Self {
        self.writes.push(Write::Transition {
            collection,
            id,
            to,
            reason,
            at,
            expect,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

impl Store {
    /// All-or-nothing. Returns the number of writes applied; an empty batch
    /// commits nothing.
    pub async fn batch_write(&self, batch: WriteBatch) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        if batch.len() > MAX_BATCH_WRITES {
            return Err(StoreError::LimitExceeded("too many writes in one batch"));
        }
        let n = batch.len();
        self.commit_writes(batch.writes).await?;
        Ok(n)
    }
}
