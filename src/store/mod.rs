mod batch;
mod error;
mod query;
mod transaction;

pub use batch::WriteBatch;
pub use error::StoreError;
pub use query::{Predicate, Query};
pub use transaction::{RetryPolicy, Transaction};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Commit, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, fsync once,
/// answer everybody.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (commit, response) = match cmd {
            WalCommand::Append { commit, response } => (commit, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(commit, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (commit, _) in &batch {
        if let Err(e) = wal.append_buffered(commit) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so stray buffered bytes never reach
    // the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => flush_and_respond(wal, vec![(commit, response)]),
    }
}

// ── Store ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub retry: RetryPolicy,
    pub change_feed_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            change_feed_capacity: 4096,
        }
    }
}

/// A document plus the sequence number of the commit that last wrote it.
#[derive(Debug, Clone)]
pub(super) struct Stored {
    pub(super) doc: Document,
    pub(super) version: u64,
}

/// Transactional document store.
///
/// Reads are lock-free against the per-collection maps. Every write path
/// (transactions, batches, single puts) funnels through `commit_locked`,
/// which runs under `commit_seq`: validate, append to the WAL, install,
/// then publish on the change feed. Commits are therefore totally ordered
/// and the feed sees them in sequence order.
pub struct Store {
    activities: DashMap<Ulid, Stored>,
    reservations: DashMap<Ulid, Stored>,
    therapies: DashMap<Ulid, Stored>,
    appointments: DashMap<Ulid, Stored>,
    suspensions: DashMap<Ulid, Stored>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Sequence number of the last durable commit.
    pub(super) commit_seq: Mutex<u64>,
    changes: broadcast::Sender<Change>,
    pub(super) retry: RetryPolicy,
    pub notify: Arc<NotifyHub>,
}

impl Store {
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>, options: StoreOptions) -> io::Result<Self> {
        let (wal, commits) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let (changes, _) = broadcast::channel(options.change_feed_capacity.max(1));
        let mut seq = 0;
        let mut store = Self {
            activities: DashMap::new(),
            reservations: DashMap::new(),
            therapies: DashMap::new(),
            appointments: DashMap::new(),
            suspensions: DashMap::new(),
            wal_tx,
            commit_seq: Mutex::new(0),
            changes,
            retry: options.retry,
            notify,
        };

        // Replayed commits were validated when first written; only structural
        // problems can fail here.
        for commit in &commits {
            match store.stage(commit.seq, &commit.writes, false) {
                Ok(changes) => store.install(&changes),
                Err(e) => warn!(seq = commit.seq, "skipping unreplayable commit: {e}"),
            }
            seq = seq.max(commit.seq);
        }
        *store.commit_seq.get_mut() = seq;

        Ok(store)
    }

    pub(super) fn table(&self, collection: Collection) -> &DashMap<Ulid, Stored> {
        match collection {
            Collection::Activities => &self.activities,
            Collection::Reservations => &self.reservations,
            Collection::Therapies => &self.therapies,
            Collection::Appointments => &self.appointments,
            Collection::Suspensions => &self.suspensions,
        }
    }

    pub fn get(&self, collection: Collection, id: Ulid) -> Option<Document> {
        self.table(collection).get(&id).map(|e| e.doc.clone())
    }

    pub(super) fn get_versioned(&self, collection: Collection, id: Ulid) -> Option<(Document, u64)> {
        self.table(collection).get(&id).map(|e| (e.doc.clone(), e.version))
    }

    /// Matching documents ordered by id.
    pub fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        Ok(self.query_versioned(query)?.into_iter().map(|(doc, _)| doc).collect())
    }

    pub(super) fn query_versioned(&self, query: &Query) -> Result<Vec<(Document, u64)>, StoreError> {
        query.validate()?;
        let mut out: Vec<(Document, u64)> = self
            .table(query.collection)
            .iter()
            .filter(|e| query.matches(&e.doc))
            .map(|e| (e.doc.clone(), e.version))
            .collect();
        out.sort_by_key(|(doc, _)| doc.id());
        Ok(out)
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.table(collection).len()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Every committed document change, in commit order. Subscribe before
    /// writing to observe the writes.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    /// Unconditional single-document upsert.
    pub async fn put(&self, doc: Document) -> Result<u64, StoreError> {
        self.commit_writes(vec![Write::Put(doc)]).await
    }

    /// Deleting an absent document still commits (and publishes nothing).
    pub async fn delete(&self, collection: Collection, id: Ulid) -> Result<u64, StoreError> {
        self.commit_writes(vec![Write::Delete { collection, id }]).await
    }

    pub(super) async fn commit_writes(&self, writes: Vec<Write>) -> Result<u64, StoreError> {
        let mut seq = self.commit_seq.lock().await;
        self.commit_locked(&mut seq, writes).await
    }

    /// Caller holds `commit_seq`. Nothing is installed unless the WAL append
    /// succeeded.
    pub(super) async fn commit_locked(&self, seq: &mut u64, writes: Vec<Write>) -> Result<u64, StoreError> {
        let next = *seq + 1;
        let changes = self.stage(next, &writes, true)?;
        let commit = Commit {
            seq: next,
            at: now_ms(),
            writes,
        };
        self.wal_append(commit).await?;
        *seq = next;
        self.install(&changes);
        metrics::counter!(observability::COMMITS_TOTAL).increment(1);
        metrics::histogram!(observability::COMMIT_WRITES).record(changes.len() as f64);
        for change in changes {
            if change.before.is_some() || change.after.is_some() {
                let _ = self.changes.send(change);
            }
        }
        Ok(next)
    }

    /// Compute one before/after pair per touched document. With `enforce`,
    /// transition preconditions and the booking lifecycle are checked and
    /// any violation rejects the whole set of writes.
    fn stage(&self, seq: u64, writes: &[Write], enforce: bool) -> Result<Vec<Change>, StoreError> {
        let mut order: Vec<(Collection, Ulid)> = Vec::new();
        let mut before: HashMap<(Collection, Ulid), Option<Document>> = HashMap::new();
        let mut after: HashMap<(Collection, Ulid), Option<Document>> = HashMap::new();

        for write in writes {
            let key = write.target();
            let current = match after.get(&key) {
                Some(doc) => doc.clone(),
                None => {
                    let doc = self.get(key.0, key.1);
                    before.insert(key, doc.clone());
                    order.push(key);
                    doc
                }
            };
            let next = match write {
                Write::Put(doc) => Some(doc.clone()),
                Write::Delete { .. } => None,
                Write::Transition {
                    collection,
                    id,
                    to,
                    reason,
                    at,
                    expect,
                } => {
                    let mut doc = current.ok_or(StoreError::NotFound(*collection, *id))?;
                    let from = doc.status();
                    if enforce {
                        if let (Some(expected), Some(actual)) = (expect, from)
                            && *expected != actual
                        {
                            return Err(StoreError::PreconditionFailed {
                                collection: *collection,
                                id: *id,
                                expected: *expected,
                                actual,
                            });
                        }
                        if !from.is_some_and(|s| s.can_transition_to(*to)) {
                            return Err(StoreError::InvalidTransition {
                                collection: *collection,
                                id: *id,
                                from,
                                to: *to,
                            });
                        }
                    }
                    if !doc.apply_transition(*to, reason.as_deref(), *at) {
                        return Err(StoreError::InvalidTransition {
                            collection: *collection,
                            id: *id,
                            from,
                            to: *to,
                        });
                    }
                    Some(doc)
                }
            };
            after.insert(key, next);
        }

        Ok(order
            .into_iter()
            .map(|key| Change {
                seq,
                collection: key.0,
                id: key.1,
                before: before.remove(&key).flatten(),
                after: after.remove(&key).flatten(),
            })
            .collect())
    }

    fn install(&self, changes: &[Change]) {
        for change in changes {
            let table = self.table(change.collection);
            match &change.after {
                Some(doc) => {
                    table.insert(
                        change.id,
                        Stored {
                            doc: doc.clone(),
                            version: change.seq,
                        },
                    );
                }
                None => {
                    table.remove(&change.id);
                }
            }
        }
    }

    /// Install `doc` at a fresh version without a WAL record, as if a
    /// competing commit landed mid-transaction.
    #[cfg(test)]
    pub(crate) fn force_install(&self, doc: Document) {
        static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1_000_000);
        let seq = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.install(&[Change {
            seq,
            collection: doc.collection(),
            id: doc.id(),
            before: None,
            after: Some(doc),
        }]);
    }

    /// Write a commit via the background group-commit writer.
    async fn wal_append(&self, commit: Commit) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// Rewrite the WAL as one snapshot commit of the current contents.
    /// Holds the commit lock so no commit lands between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let seq = self.commit_seq.lock().await;
        let mut writes = Vec::new();
        for collection in Collection::ALL {
            for entry in self.table(collection).iter() {
                writes.push(Write::Put(entry.doc.clone()));
            }
        }
        let snapshot = vec![Commit {
            seq: *seq,
            at: now_ms(),
            writes,
        }];

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
