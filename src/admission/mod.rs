//! Admission controllers for newly created bookings.
//!
//! Each controller decides one `pending` record inside a single optimistic
//! transaction and writes the terminal status in that same transaction, so
//! rejections are decided on a validated read set exactly like admissions.
//! Only when the transaction itself fails does the controller fall back to a
//! separate `pending → failed` write.

mod capacity;
mod overlap;

pub use capacity::{admit_reservation, check_capacity};
pub use overlap::{admit_appointment, check_overlap};

use std::time::Instant;

use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::store::{Store, StoreError, WriteBatch, now_ms};

/// Reason recorded when the failure is not the booking's fault.
pub const INTERNAL_REASON: &str = "booking could not be processed, please try again";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    FailedPrecondition,
    ResourceExhausted,
    AlreadyExists,
    Internal,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::FailedPrecondition => "failed_precondition",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug)]
pub enum AdmissionError {
    ActivityNotFound(Ulid),
    TherapyNotFound(Ulid),
    /// The therapy has no practitioner to check against.
    NoPractitioner(Ulid),
    /// The therapy has a zero duration.
    InvalidTherapy(Ulid),
    CapacityExhausted {
        available: u64,
        requested: u32,
        activity: String,
        scheduled_at: Ms,
    },
    PractitionerBusy {
        conflicting: Ulid,
        practitioner: Ulid,
    },
    Internal(StoreError),
}

impl AdmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdmissionError::ActivityNotFound(_) | AdmissionError::TherapyNotFound(_) => ErrorKind::NotFound,
            AdmissionError::NoPractitioner(_) | AdmissionError::InvalidTherapy(_) => ErrorKind::FailedPrecondition,
            AdmissionError::CapacityExhausted { .. } => ErrorKind::ResourceExhausted,
            AdmissionError::PractitionerBusy { .. } => ErrorKind::AlreadyExists,
            AdmissionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message stored on the failed booking.
    pub fn reason(&self) -> String {
        match self {
            AdmissionError::ActivityNotFound(_) => "the requested activity does not exist".into(),
            AdmissionError::TherapyNotFound(_) => "the requested therapy does not exist".into(),
            AdmissionError::NoPractitioner(_) => "no practitioner is assigned to this therapy".into(),
            AdmissionError::InvalidTherapy(_) => "this therapy has no bookable duration".into(),
            AdmissionError::CapacityExhausted {
                available,
                requested,
                activity,
                scheduled_at,
            } => format!(
                "only {available} seat(s) left for {activity} at {}, {requested} requested",
                format_utc(*scheduled_at)
            ),
            AdmissionError::PractitionerBusy { .. } => "practitioner already booked in that window".into(),
            AdmissionError::Internal(_) => INTERNAL_REASON.into(),
        }
    }
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::ActivityNotFound(id) => write!(f, "activity not found: {id}"),
            AdmissionError::TherapyNotFound(id) => write!(f, "therapy not found: {id}"),
            AdmissionError::NoPractitioner(id) => write!(f, "therapy {id} has no practitioner"),
            AdmissionError::InvalidTherapy(id) => write!(f, "therapy {id} has zero duration"),
            AdmissionError::CapacityExhausted { .. } => f.write_str(&self.reason()),
            AdmissionError::PractitionerBusy {
                conflicting,
                practitioner,
            } => write!(f, "practitioner {practitioner} already booked by appointment {conflicting}"),
            AdmissionError::Internal(e) => write!(f, "internal: {e}"),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        AdmissionError::Internal(e)
    }
}

fn format_utc(ms: Ms) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// What a controller did with one record.
#[derive(Debug)]
pub enum Admission {
    Confirmed,
    Rejected(AdmissionError),
    /// The record was missing (`None`) or already decided.
    Skipped(Option<Status>),
}

impl Admission {
    pub fn label(&self) -> &'static str {
        match self {
            Admission::Confirmed => "confirmed",
            Admission::Rejected(_) => "rejected",
            Admission::Skipped(_) => "skipped",
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Admission::Rejected(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Transaction body tail shared by both controllers: write the terminal
/// status for `id` according to the check result. Internal errors abort the
/// transaction instead.
fn decide(
    tx: &mut crate::store::Transaction<'_>,
    collection: Collection,
    id: Ulid,
    checked: Result<(), AdmissionError>,
) -> Result<Admission, AdmissionError> {
    match checked {
        Ok(()) => {
            tx.transition(collection, id, Status::Confirmed, None, Some(Status::Pending));
            Ok(Admission::Confirmed)
        }
        Err(e @ AdmissionError::Internal(_)) => Err(e),
        Err(e) => {
            tx.transition(collection, id, Status::Failed, Some(e.reason()), Some(Status::Pending));
            Ok(Admission::Rejected(e))
        }
    }
}

/// Log, count, and, when the transaction failed outright, perform the
/// single follow-up write marking the record failed.
async fn finish(
    store: &Store,
    kind: &'static str,
    collection: Collection,
    id: Ulid,
    result: Result<Admission, AdmissionError>,
    started: Instant,
) -> Admission {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(%id, kind, "admission failed: {e}");
            let mut batch = WriteBatch::new();
            batch.transition(
                collection,
                id,
                Status::Failed,
                Some(INTERNAL_REASON.into()),
                now_ms(),
                Some(Status::Pending),
            );
            if let Err(write_err) = store.batch_write(batch).await {
                error!(%id, kind, "could not record admission failure: {write_err}");
            }
            Admission::Rejected(e)
        }
    };

    match &outcome {
        Admission::Confirmed => info!(%id, kind, "booking confirmed"),
        Admission::Rejected(e) => info!(%id, kind, error_kind = e.kind().as_str(), "booking rejected: {e}"),
        Admission::Skipped(status) => debug!(%id, kind, ?status, "admission skipped"),
    }
    metrics::counter!(observability::ADMISSIONS_TOTAL, "kind" => kind, "outcome" => outcome.label()).increment(1);
    metrics::histogram!(observability::ADMISSION_DURATION_SECONDS, "kind" => kind)
        .record(started.elapsed().as_secs_f64());
    outcome
}
