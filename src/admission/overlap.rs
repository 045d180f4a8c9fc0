use std::collections::HashMap;
use std::time::Instant;

use ulid::Ulid;

use crate::limits::MAX_IN_VALUES;
use crate::model::*;
use crate::store::{Query, Store, Transaction};

use super::{Admission, AdmissionError, decide, finish};

/// The appointment's practitioner must be free for its whole span.
///
/// Candidates are narrowed to the practitioner's therapies before they enter
/// the read set, so bookings for other practitioners never invalidate this
/// transaction. The half-open overlap test is applied here.
pub fn check_overlap(tx: &mut Transaction<'_>, a: &Appointment) -> Result<(), AdmissionError> {
    let therapy = match tx.get(Collection::Therapies, a.therapy_id) {
        Some(Document::Therapy(t)) => t,
        _ => return Err(AdmissionError::TherapyNotFound(a.therapy_id)),
    };
    let Some(practitioner) = therapy.practitioner_id else {
        return Err(AdmissionError::NoPractitioner(therapy.id));
    };
    if therapy.duration_minutes == 0 {
        return Err(AdmissionError::InvalidTherapy(therapy.id));
    }
    let span = a.span(&therapy);

    let mut therapies: HashMap<Ulid, Therapy> = HashMap::new();
    for doc in tx.query(Query::new(Collection::Therapies).eq(Field::PractitionerId, Value::Id(practitioner)))? {
        if let Document::Therapy(t) = doc
            && t.duration_minutes > 0
        {
            therapies.insert(t.id, t);
        }
    }
    therapies.insert(therapy.id, therapy);

    let therapy_ids: Vec<Value> = therapies.keys().map(|&id| Value::Id(id)).collect();
    for chunk in therapy_ids.chunks(MAX_IN_VALUES) {
        let candidates = tx.query(
            Query::new(Collection::Appointments)
                .is_in(Field::TherapyId, chunk.to_vec())
                .is_in(
                    Field::Status,
                    [Value::Status(Status::Pending), Value::Status(Status::Confirmed)],
                )
                .lte(Field::StartAt, Value::Time(span.end)),
        )?;
        for doc in candidates {
            let Document::Appointment(c) = doc else { continue };
            if c.id == a.id {
                continue;
            }
            let Some(other) = therapies.get(&c.therapy_id) else { continue };
            if span.overlaps(&c.span(other)) {
                return Err(AdmissionError::PractitionerBusy {
                    conflicting: c.id,
                    practitioner,
                });
            }
        }
    }
    Ok(())
}

/// Decide a pending appointment.
pub async fn admit_appointment(store: &Store, id: Ulid) -> Admission {
    let started = Instant::now();
    let result = store
        .run_transaction(|tx| {
            let a = match tx.get(Collection::Appointments, id) {
                Some(Document::Appointment(a)) => a,
                _ => return Ok(Admission::Skipped(None)),
            };
            if a.status != Status::Pending {
                return Ok(Admission::Skipped(Some(a.status)));
            }
            let checked = check_overlap(tx, &a);
            decide(tx, Collection::Appointments, id, checked)
        })
        .await;
    finish(store, "overlap", Collection::Appointments, id, result, started).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ErrorKind;
    use crate::notify::NotifyHub;
    use crate::store::{RetryPolicy, StoreOptions};
    use std::path::PathBuf;
    use std::sync::Arc;

    const DAY: Ms = 1_709_251_200_000; // 2024-03-01 00:00 UTC
    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservd_test_overlap");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open_store(name: &str) -> Arc<Store> {
        let options = StoreOptions {
            retry: RetryPolicy::default().with_max_attempts(64),
            ..StoreOptions::default()
        };
        Arc::new(Store::open(test_wal_path(name), Arc::new(NotifyHub::new()), options).unwrap())
    }

    async fn put_therapy(store: &Store, minutes: u32, practitioner: Option<Ulid>) -> Ulid {
        let id = Ulid::new();
        store
            .put(Document::Therapy(Therapy {
                id,
                name: "Deep tissue massage".into(),
                duration_minutes: minutes,
                practitioner_id: practitioner,
            }))
            .await
            .unwrap();
        id
    }

    async fn put_appointment(store: &Store, therapy_id: Ulid, start_at: Ms) -> Ulid {
        let id = Ulid::new();
        let a = Appointment::new(id, therapy_id, Ulid::new(), start_at, 0);
        store.put(Document::Appointment(a)).await.unwrap();
        id
    }

    async fn book(store: &Store, therapy_id: Ulid, start_at: Ms) -> (Ulid, Admission) {
        let id = put_appointment(store, therapy_id, start_at).await;
        (id, admit_appointment(store, id).await)
    }

    fn status(store: &Store, id: Ulid) -> Status {
        store.get(Collection::Appointments, id).and_then(|d| d.status()).unwrap()
    }

    #[tokio::test]
    async fn sixty_minute_sessions() {
        let store = open_store("scenario_b.wal");
        let therapy = put_therapy(&store, 60, Some(Ulid::new())).await;

        let (first, outcome) = book(&store, therapy, DAY + 10 * H).await;
        assert!(matches!(outcome, Admission::Confirmed));

        let (second, outcome) = book(&store, therapy, DAY + 10 * H + 59 * M).await;
        assert!(matches!(outcome, Admission::Rejected(AdmissionError::PractitionerBusy { conflicting, .. }) if conflicting == first));
        assert_eq!(status(&store, second), Status::Failed);
        let reason = match store.get(Collection::Appointments, second) {
            Some(Document::Appointment(a)) => a.failure_reason,
            _ => None,
        };
        assert_eq!(reason.as_deref(), Some("practitioner already booked in that window"));

        // Back-to-back is not an overlap.
        let (third, outcome) = book(&store, therapy, DAY + 11 * H).await;
        assert!(matches!(outcome, Admission::Confirmed));
        assert_eq!(status(&store, third), Status::Confirmed);
    }

    #[tokio::test]
    async fn ending_exactly_at_start_is_admitted() {
        let store = open_store("ends_at_start.wal");
        let therapy = put_therapy(&store, 30, Some(Ulid::new())).await;
        book(&store, therapy, DAY + 10 * H).await;

        let (_, outcome) = book(&store, therapy, DAY + 10 * H - 30 * M).await;
        assert!(matches!(outcome, Admission::Confirmed));
        let (_, outcome) = book(&store, therapy, DAY + 10 * H - 29 * M).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::AlreadyExists));
    }

    #[tokio::test]
    async fn conflict_detected_across_therapies_of_one_practitioner() {
        let store = open_store("cross_therapy.wal");
        let practitioner = Ulid::new();
        let long = put_therapy(&store, 90, Some(practitioner)).await;
        let short = put_therapy(&store, 15, Some(practitioner)).await;
        book(&store, long, DAY + 9 * H).await;

        let (_, outcome) = book(&store, short, DAY + 10 * H).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::AlreadyExists));
    }

    #[tokio::test]
    async fn other_practitioners_do_not_conflict() {
        let store = open_store("other_practitioner.wal");
        let mine = put_therapy(&store, 60, Some(Ulid::new())).await;
        let theirs = put_therapy(&store, 60, Some(Ulid::new())).await;
        book(&store, theirs, DAY + 10 * H).await;

        let (_, outcome) = book(&store, mine, DAY + 10 * H).await;
        assert!(matches!(outcome, Admission::Confirmed));
    }

    #[tokio::test]
    async fn failed_appointments_free_the_slot() {
        let store = open_store("failed_frees.wal");
        let practitioner = Ulid::new();
        let therapy = put_therapy(&store, 60, Some(practitioner)).await;
        let mut failed = Appointment::new(Ulid::new(), therapy, Ulid::new(), DAY + 10 * H, 0);
        failed.status = Status::Failed;
        store.put(Document::Appointment(failed)).await.unwrap();

        let (_, outcome) = book(&store, therapy, DAY + 10 * H).await;
        assert!(matches!(outcome, Admission::Confirmed));
    }

    #[tokio::test]
    async fn precondition_failures() {
        let store = open_store("preconditions.wal");

        let (id, outcome) = book(&store, Ulid::new(), DAY).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::NotFound));
        assert_eq!(status(&store, id), Status::Failed);

        let orphan = put_therapy(&store, 60, None).await;
        let (_, outcome) = book(&store, orphan, DAY).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::FailedPrecondition));

        let instant = put_therapy(&store, 0, Some(Ulid::new())).await;
        let (_, outcome) = book(&store, instant, DAY).await;
        assert!(matches!(outcome, Admission::Rejected(AdmissionError::InvalidTherapy(_))));
    }

    #[tokio::test]
    async fn dangling_candidate_therapy_is_ignored() {
        let store = open_store("dangling.wal");
        let practitioner = Ulid::new();
        let therapy = put_therapy(&store, 60, Some(practitioner)).await;
        let retired = put_therapy(&store, 60, Some(practitioner)).await;
        book(&store, retired, DAY + 10 * H).await;
        store.delete(Collection::Therapies, retired).await.unwrap();

        let (_, outcome) = book(&store, therapy, DAY + 10 * H).await;
        assert!(matches!(outcome, Admission::Confirmed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn identical_requests_admit_exactly_one() {
        let store = open_store("identical.wal");
        let therapy = put_therapy(&store, 45, Some(Ulid::new())).await;
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(put_appointment(&store, therapy, DAY + 14 * H).await);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let store = store.clone();
                tokio::spawn(async move { admit_appointment(&store, id).await })
            })
            .collect();
        let mut confirmed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Admission::Confirmed => confirmed += 1,
                outcome => assert_eq!(outcome.error_kind(), Some(ErrorKind::AlreadyExists)),
            }
        }
        // All eight were pending together, so each blocks the others until
        // decided: the first decision is a rejection, the last survivor is
        // admitted.
        assert_eq!(confirmed, 1);
        let confirmed_rows = ids.iter().filter(|&&id| status(&store, id) == Status::Confirmed).count();
        assert_eq!(confirmed_rows, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_practitioners_admit_in_parallel() {
        let path = test_wal_path("distinct_practitioners.wal");
        let store = Arc::new(Store::open(path, Arc::new(NotifyHub::new()), StoreOptions::default()).unwrap());
        let mut ids = Vec::new();
        for _ in 0..60 {
            let therapy = put_therapy(&store, 60, Some(Ulid::new())).await;
            ids.push(put_appointment(&store, therapy, DAY + 10 * H).await);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let store = store.clone();
                tokio::spawn(async move { admit_appointment(&store, id).await })
            })
            .collect();
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(matches!(outcome, Admission::Confirmed), "unexpected {outcome:?}");
        }
        assert!(ids.iter().all(|&id| status(&store, id) == Status::Confirmed));
    }

    #[tokio::test]
    async fn other_practitioners_stay_out_of_the_read_set() {
        let store = open_store("read_set.wal");
        let mine = put_therapy(&store, 60, Some(Ulid::new())).await;
        let theirs = put_therapy(&store, 60, Some(Ulid::new())).await;
        let a = put_appointment(&store, mine, DAY + 10 * H).await;
        let b = put_appointment(&store, theirs, DAY + 10 * H).await;
        let b_doc = store.get(Collection::Appointments, b).unwrap();

        // Rewriting another practitioner's booking between the reads and the
        // commit must not force a retry.
        let mut runs = 0;
        let outcome = store
            .run_transaction(|tx| {
                runs += 1;
                let Some(Document::Appointment(appt)) = tx.get(Collection::Appointments, a) else {
                    return Ok(false);
                };
                let checked = check_overlap(tx, &appt);
                if runs == 1 {
                    store.force_install(b_doc.clone());
                }
                Ok::<_, crate::store::StoreError>(checked.is_ok())
            })
            .await
            .unwrap();
        assert!(outcome);
        assert_eq!(runs, 1);
    }
}

