use std::time::Instant;

use ulid::Ulid;

use crate::model::*;
use crate::store::{Query, Store, Transaction};

use super::{Admission, AdmissionError, decide, finish};

/// Seats still free at the reservation's instance must cover its request.
/// Occupancy is recomputed from live reservations every time; nothing is
/// counted incrementally.
pub fn check_capacity(tx: &mut Transaction<'_>, r: &GroupReservation) -> Result<(), AdmissionError> {
    let activity = match tx.get(Collection::Activities, r.activity_id) {
        Some(Document::Activity(a)) => a,
        _ => return Err(AdmissionError::ActivityNotFound(r.activity_id)),
    };

    let same_instance = tx.query(
        Query::new(Collection::Reservations)
            .eq(Field::ActivityId, Value::Id(r.activity_id))
            .eq(Field::ScheduledAt, Value::Time(r.scheduled_at))
            .is_in(
                Field::Status,
                [Value::Status(Status::Pending), Value::Status(Status::Confirmed)],
            ),
    )?;
    let occupied: u64 = same_instance
        .iter()
        .filter_map(|doc| match doc {
            Document::Reservation(other) if other.id != r.id => Some(u64::from(other.seats())),
            _ => None,
        })
        .sum();

    let available = u64::from(activity.capacity).saturating_sub(occupied);
    if available < u64::from(r.seats()) {
        return Err(AdmissionError::CapacityExhausted {
            available,
            requested: r.seats(),
            activity: activity.name,
            scheduled_at: r.scheduled_at,
        });
    }
    Ok(())
}

/// Decide a pending group reservation.
pub async fn admit_reservation(store: &Store, id: Ulid) -> Admission {
    let started = Instant::now();
    let result = store
        .run_transaction(|tx| {
            let r = match tx.get(Collection::Reservations, id) {
                Some(Document::Reservation(r)) => r,
                _ => return Ok(Admission::Skipped(None)),
            };
            if r.status != Status::Pending {
                return Ok(Admission::Skipped(Some(r.status)));
            }
            let checked = check_capacity(tx, &r);
            decide(tx, Collection::Reservations, id, checked)
        })
        .await;
    finish(store, "capacity", Collection::Reservations, id, result, started).await
}
