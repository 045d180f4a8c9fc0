use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::admission::{Admission, admit_appointment, admit_reservation};
use crate::cascade::process_suspension_written;
use crate::model::*;
use crate::observability;
use crate::store::{Query, Store, StoreError};

/// Route committed changes to the controller or processor that owns them.
/// Every pending record is swept once at startup, and again whenever the
/// feed drops events, so no booking stays undecided because its trigger
/// was missed.
pub async fn run_dispatcher(store: Arc<Store>, mut changes: broadcast::Receiver<Change>) {
    sweep_and_log(&store).await;
    loop {
        match changes.recv().await {
            Ok(change) => {
                dispatch(&store, change);
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "change feed lagged, sweeping pending bookings");
                metrics::counter!(observability::TRIGGER_LAGGED_TOTAL).increment(missed);
                sweep_and_log(&store).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn sweep_and_log(store: &Store) {
    match sweep_pending(store, None).await {
        Ok(0) => {}
        Ok(n) => info!(decided = n, "swept pending bookings"),
        Err(e) => error!("pending sweep failed: {e}"),
    }
}

/// Spawn the handler for one change, if it triggers anything: a booking
/// created `pending` goes to its admission controller, a suspension written
/// with content goes to the cascade processor.
pub fn dispatch(store: &Arc<Store>, change: Change) -> Option<JoinHandle<()>> {
    let store = store.clone();
    match change.after {
        Some(Document::Reservation(r)) if change.before.is_none() && r.status == Status::Pending => {
            Some(tokio::spawn(async move {
                admit_reservation(&store, r.id).await;
            }))
        }
        Some(Document::Appointment(a)) if change.before.is_none() && a.status == Status::Pending => {
            Some(tokio::spawn(async move {
                admit_appointment(&store, a.id).await;
            }))
        }
        Some(Document::Suspension(s)) => Some(tokio::spawn(async move {
            if let Err(e) = process_suspension_written(&store, Some(&s)).await {
                error!(suspension = %s.id, "cascade failed: {e}");
            }
        })),
        _ => None,
    }
}

fn created_at(doc: &Document) -> Option<Ms> {
    match doc {
        Document::Reservation(r) => Some(r.created_at),
        Document::Appointment(a) => Some(a.created_at),
        _ => None,
    }
}

/// Admit every `pending` booking created at or before `cutoff` (all of them
/// when `None`). Returns how many were decided by this sweep.
pub async fn sweep_pending(store: &Store, cutoff: Option<Ms>) -> Result<usize, StoreError> {
    let mut reservations: Vec<Ulid> = Vec::new();
    let mut appointments: Vec<Ulid> = Vec::new();
    for collection in [Collection::Reservations, Collection::Appointments] {
        let pending = store.query(&Query::new(collection).eq(Field::Status, Value::Status(Status::Pending)))?;
        for doc in pending {
            if cutoff.is_some_and(|c| created_at(&doc).is_some_and(|t| t > c)) {
                continue;
            }
            match collection {
                Collection::Reservations => reservations.push(doc.id()),
                _ => appointments.push(doc.id()),
            }
        }
    }

    let mut outcomes = join_all(reservations.into_iter().map(|id| admit_reservation(store, id))).await;
    outcomes.extend(join_all(appointments.into_iter().map(|id| admit_appointment(store, id))).await);
    Ok(outcomes
        .iter()
        .filter(|o| !matches!(o, Admission::Skipped(_)))
        .count())
}
