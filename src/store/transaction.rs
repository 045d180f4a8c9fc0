use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::{Query, Store, StoreError, now_ms};

/// Exponential backoff between optimistic commit attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }
}

/// One attempt of a read-modify-write transaction.
///
/// Reads go straight to the store and are recorded with the version they
/// observed. Writes are buffered and only applied if, at commit time, every
/// recorded read would still return the same thing. Reads do not see the
/// transaction's own buffered writes.
pub struct Transaction<'a> {
    store: &'a Store,
    points: HashMap<(Collection, Ulid), Option<u64>>,
    queries: Vec<(Query, Vec<(Ulid, u64)>)>,
    pub(super) writes: Vec<Write>,
}

impl<'a> Transaction<'a> {
    fn new(store: &'a Store) -> Self {
        Self {
            store,
            points: HashMap::new(),
            queries: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn get(&mut self, collection: Collection, id: Ulid) -> Option<Document> {
        let found = self.store.get_versioned(collection, id);
        self.points
            .entry((collection, id))
            .or_insert_with(|| found.as_ref().map(|(_, v)| *v));
        found.map(|(doc, _)| doc)
    }

    /// Also guards against phantoms: a document entering or leaving the
    /// result set before commit invalidates the transaction.
    pub fn query(&mut self, query: Query) -> Result<Vec<Document>, StoreError> {
        let found = self.store.query_versioned(&query)?;
        let seen = found.iter().map(|(doc, v)| (doc.id(), *v)).collect();
        self.queries.push((query, seen));
        Ok(found.into_iter().map(|(doc, _)| doc).collect())
    }

    pub fn put(&mut self, doc: Document) {
        self.writes.push(Write::Put(doc));
    }

    pub fn transition(
        &mut self,
        collection: Collection,
        id: Ulid,
        to: Status,
        reason: Option<String>,
        expect: Option<Status>,
    ) {
        self.writes.push(Write::Transition {
            collection,
            id,
            to,
            reason,
            at: now_ms(),
            expect,
        });
    }

    /// Caller holds the commit lock.
    pub(super) fn is_current(&self) -> bool {
        let points_hold = self.points.iter().all(|(&(collection, id), seen)| {
            self.store.get_versioned(collection, id).map(|(_, v)| v) == *seen
        });
        points_hold
            && self.queries.iter().all(|(query, seen)| {
                let Ok(now) = self.store.query_versioned(query) else {
                    return false;
                };
                now.len() == seen.len()
                    && now
                        .iter()
                        .zip(seen)
                        .all(|((doc, version), (id, seen_version))| doc.id() == *id && version == seen_version)
            })
    }
}

impl Store {
    /// Run `body` as an optimistic transaction, retrying with backoff while
    /// its reads keep going stale. `body` may run several times and must not
    /// have side effects outside the transaction. An `Err` from `body`
    /// aborts immediately with nothing written.
    pub async fn run_transaction<T, E, F>(&self, mut body: F) -> Result<T, E>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let started = Instant::now();
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            let mut tx = Transaction::new(self);
            let value = body(&mut tx)?;

            let mut seq = self.commit_seq.lock().await;
            if tx.is_current() {
                if !tx.writes.is_empty() {
                    self.commit_locked(&mut seq, tx.writes).await?;
                }
                metrics::histogram!(observability::TX_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
                return Ok(value);
            }
            drop(seq);

            metrics::counter!(observability::TX_CONFLICTS_TOTAL).increment(1);
            debug!(attempt, "transaction reads went stale, retrying");
            if attempt < attempts {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
            }
        }
        metrics::counter!(observability::TX_EXHAUSTED_TOTAL).increment(1);
        warn!(attempts, "transaction gave up under contention");
        Err(StoreError::Contention(attempts).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_millis(100));
    }

    #[test]
    fn with_max_attempts_overrides() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.multiplier, 2.0);
    }
}
