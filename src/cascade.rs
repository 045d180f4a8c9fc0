//! Suspension cascade: cancel every confirmed booking inside a suspended
//! window and scope.
//!
//! This is a bulk path with weaker consistency than admission. Candidates
//! come from a plain query, and the cancellations go out as all-or-nothing
//! batches of conditional transitions (`confirmed → cancelled_by_admin`).
//! A booking that changed between query and batch fails the precondition,
//! which rejects that batch; the path then re-queries and tries again.
//! Since only confirmed bookings are ever selected, redelivering the same
//! suspension performs no writes.

use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::{MAX_BATCH_WRITES, MAX_IN_VALUES};
use crate::model::*;
use crate::observability;
use crate::store::{Query, Store, StoreError, WriteBatch, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    /// Group reservations against an activity.
    Group,
    /// Individual appointments against a therapy or practitioner.
    Individual,
}

impl Path {
    fn label(self) -> &'static str {
        match self {
            Path::Group => "group",
            Path::Individual => "individual",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub suspension_id: Option<Ulid>,
    pub reservations_cancelled: usize,
    pub appointments_cancelled: usize,
    /// Batches rejected by a concurrent change and re-queried.
    pub retries: u32,
    pub notices: Vec<CancellationNotice>,
}

impl CascadeReport {
    pub fn cancelled(&self) -> usize {
        self.reservations_cancelled + self.appointments_cancelled
    }
}

/// React to a suspension write. `after` is the written document, `None`
/// for a deletion.
pub async fn process_suspension_written(
    store: &Store,
    after: Option<&Suspension>,
) -> Result<CascadeReport, StoreError> {
    let Some(s) = after else {
        debug!("suspension deleted, nothing to cascade");
        return Ok(CascadeReport::default());
    };
    let mut report = CascadeReport {
        suspension_id: Some(s.id),
        ..CascadeReport::default()
    };
    if !s.cascades {
        debug!(suspension = %s.id, "suspension does not cascade");
        return Ok(report);
    }
    if !s.has_valid_window() {
        warn!(
            suspension = %s.id,
            window_start = s.window_start,
            window_end = s.window_end,
            "suspension window is empty or inverted, skipping cascade"
        );
        return Ok(report);
    }

    let started = Instant::now();
    // Group reservations have no practitioner link, so only activity scope
    // reaches them.
    if s.scope == Scope::Activity {
        cancel_path(store, s, Path::Group, &mut report).await?;
    }
    cancel_path(store, s, Path::Individual, &mut report).await?;

    info!(
        suspension = %s.id,
        scope = ?s.scope,
        target = %s.target_id,
        reservations = report.reservations_cancelled,
        appointments = report.appointments_cancelled,
        retries = report.retries,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "cascade finished"
    );
    Ok(report)
}

/// Confirmed bookings the suspension covers, from a non-transactional read.
fn select(store: &Store, s: &Suspension, path: Path) -> Result<Vec<Document>, StoreError> {
    match (path, s.scope) {
        (Path::Group, _) => store.query(
            &Query::new(Collection::Reservations)
                .eq(Field::Status, Value::Status(Status::Confirmed))
                .eq(Field::ActivityId, Value::Id(s.target_id))
                .gte(Field::ScheduledAt, Value::Time(s.window_start))
                .lte(Field::ScheduledAt, Value::Time(s.window_end)),
        ),
        (Path::Individual, Scope::Activity) => store.query(&confirmed_appointments(s).eq(Field::TherapyId, Value::Id(s.target_id))),
        (Path::Individual, Scope::Practitioner) => {
            let therapy_ids: Vec<Value> = store
                .query(&Query::new(Collection::Therapies).eq(Field::PractitionerId, Value::Id(s.target_id)))?
                .iter()
                .map(|t| Value::Id(t.id()))
                .collect();
            let mut found = Vec::new();
            for chunk in therapy_ids.chunks(MAX_IN_VALUES) {
                found.extend(store.query(&confirmed_appointments(s).is_in(Field::TherapyId, chunk.to_vec()))?);
            }
            Ok(found)
        }
    }
}

fn confirmed_appointments(s: &Suspension) -> Query {
    Query::new(Collection::Appointments)
        .eq(Field::Status, Value::Status(Status::Confirmed))
        .gte(Field::StartAt, Value::Time(s.window_start))
        .lte(Field::StartAt, Value::Time(s.window_end))
}

fn owner(doc: &Document) -> Option<Ulid> {
    match doc {
        Document::Reservation(r) => Some(r.user_id),
        Document::Appointment(a) => Some(a.user_id),
        _ => None,
    }
}

async fn cancel_path(store: &Store, s: &Suspension, path: Path, report: &mut CascadeReport) -> Result<(), StoreError> {
    let policy = store.retry_policy().clone();
    let mut attempt = 0;
    loop {
        let targets = select(store, s, path)?;
        if targets.is_empty() {
            return Ok(());
        }

        let at = now_ms();
        let mut raced = false;
        for chunk in targets.chunks(MAX_BATCH_WRITES) {
            let mut batch = WriteBatch::new();
            for doc in chunk {
                batch.transition(
                    doc.collection(),
                    doc.id(),
                    Status::CancelledByAdmin,
                    Some(s.reason.clone()),
                    at,
                    Some(Status::Confirmed),
                );
            }
            match store.batch_write(batch).await {
                Ok(n) => {
                    metrics::counter!(observability::CASCADE_CANCELLATIONS_TOTAL, "path" => path.label())
                        .increment(n as u64);
                    for doc in chunk {
                        record_cancellation(store, s, doc, at, report);
                    }
                }
                Err(StoreError::PreconditionFailed { id, actual, .. }) => {
                    debug!(suspension = %s.id, %id, actual = actual.as_str(), "cascade batch raced a concurrent change");
                    raced = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if !raced {
            return Ok(());
        }

        attempt += 1;
        report.retries += 1;
        metrics::counter!(observability::CASCADE_RETRIES_TOTAL).increment(1);
        if attempt >= policy.max_attempts {
            return Err(StoreError::Contention(attempt));
        }
        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
    }
}

fn record_cancellation(store: &Store, s: &Suspension, doc: &Document, at: Ms, report: &mut CascadeReport) {
    match doc.collection() {
        Collection::Reservations => report.reservations_cancelled += 1,
        _ => report.appointments_cancelled += 1,
    }
    let Some(user_id) = owner(doc) else { return };
    let notice = CancellationNotice {
        record_id: doc.id(),
        collection: doc.collection(),
        user_id,
        suspension_id: s.id,
        reason: s.reason.clone(),
        cancelled_at: at,
    };
    store.notify.send(&notice);
    report.notices.push(notice);
}
