use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use reservd::model::*;
use reservd::notify::NotifyHub;
use reservd::store::{RetryPolicy, Store, StoreOptions};
use reservd::trigger;

// ── Test infrastructure ──────────────────────────────────────

const DAY: Ms = 1_709_251_200_000;
const H: Ms = 3_600_000;

/// A store with a running dispatcher, the way the binary wires it.
fn start_engine() -> Arc<Store> {
    let dir = std::env::temp_dir().join(format!("reservd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let options = StoreOptions {
        retry: RetryPolicy::default().with_max_attempts(64),
        ..StoreOptions::default()
    };
    let store = Arc::new(Store::open(dir.join("reservd.wal"), Arc::new(NotifyHub::new()), options).unwrap());
    let changes = store.subscribe_changes();
    tokio::spawn(trigger::run_dispatcher(store.clone(), changes));
    store
}

/// Poll until the record leaves `pending`, returning the decided document.
async fn decided(store: &Store, collection: Collection, id: Ulid) -> Document {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(doc) = store.get(collection, id)
            && doc.status() != Some(Status::Pending)
        {
            return doc;
        }
        assert!(tokio::time::Instant::now() < deadline, "{id} never decided");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_status(store: &Store, collection: Collection, id: Ulid, want: Status) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while store.get(collection, id).and_then(|d| d.status()) != Some(want) {
        assert!(tokio::time::Instant::now() < deadline, "{id} never reached {want:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn failure_reason(doc: &Document) -> Option<String> {
    match doc {
        Document::Reservation(r) => r.failure_reason.clone(),
        Document::Appointment(a) => a.failure_reason.clone(),
        _ => None,
    }
}

// ── Capacity ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pairs_into_five_seats() {
    let store = start_engine();
    let activity = Activity {
        id: Ulid::new(),
        name: "Yoga".into(),
        capacity: 5,
    };
    store.put(Document::Activity(activity.clone())).await.unwrap();

    let mut writers = Vec::new();
    for _ in 0..3 {
        let store = store.clone();
        let activity_id = activity.id;
        writers.push(tokio::spawn(async move {
            let r = GroupReservation::new(Ulid::new(), activity_id, Ulid::new(), DAY + 9 * H, 2, DAY);
            store.put(Document::Reservation(r.clone())).await.unwrap();
            r.id
        }));
    }
    let mut ids = Vec::new();
    for w in writers {
        ids.push(w.await.unwrap());
    }

    let mut confirmed = 0;
    let mut failed = Vec::new();
    for id in ids {
        let doc = decided(&store, Collection::Reservations, id).await;
        match doc.status() {
            Some(Status::Confirmed) => confirmed += 1,
            Some(Status::Failed) => failed.push(doc),
            other => panic!("unexpected status {other:?}"),
        }
    }
    assert_eq!(confirmed, 2);
    assert_eq!(failed.len(), 1);
    let reason = failure_reason(&failed[0]).unwrap();
    assert!(reason.starts_with("only 1 seat(s) left for Yoga"), "{reason}");
}

#[tokio::test]
async fn separate_instances_have_separate_capacity() {
    let store = start_engine();
    let activity = Activity {
        id: Ulid::new(),
        name: "Pilates".into(),
        capacity: 1,
    };
    store.put(Document::Activity(activity.clone())).await.unwrap();

    let morning = GroupReservation::new(Ulid::new(), activity.id, Ulid::new(), DAY + 9 * H, 1, DAY);
    let evening = GroupReservation::new(Ulid::new(), activity.id, Ulid::new(), DAY + 18 * H, 1, DAY);
    store.put(Document::Reservation(morning.clone())).await.unwrap();
    store.put(Document::Reservation(evening.clone())).await.unwrap();

    for id in [morning.id, evening.id] {
        let doc = decided(&store, Collection::Reservations, id).await;
        assert_eq!(doc.status(), Some(Status::Confirmed));
    }
}

#[tokio::test]
async fn reservation_for_unknown_activity_fails() {
    let store = start_engine();
    let r = GroupReservation::new(Ulid::new(), Ulid::new(), Ulid::new(), DAY, 1, DAY);
    store.put(Document::Reservation(r.clone())).await.unwrap();

    let doc = decided(&store, Collection::Reservations, r.id).await;
    assert_eq!(doc.status(), Some(Status::Failed));
    assert!(failure_reason(&doc).is_some());
}

// ── Overlap ──────────────────────────────────────────────────

#[tokio::test]
async fn back_to_back_sessions_with_one_practitioner() {
    let store = start_engine();
    let therapy = Therapy {
        id: Ulid::new(),
        name: "Deep tissue".into(),
        duration_minutes: 60,
        practitioner_id: Some(Ulid::new()),
    };
    store.put(Document::Therapy(therapy.clone())).await.unwrap();

    let book = |start_at: Ms| Appointment::new(Ulid::new(), therapy.id, Ulid::new(), start_at, DAY);

    let first = book(DAY + 10 * H);
    store.put(Document::Appointment(first.clone())).await.unwrap();
    let doc = decided(&store, Collection::Appointments, first.id).await;
    assert_eq!(doc.status(), Some(Status::Confirmed));

    let clash = book(DAY + 10 * H + 59 * MINUTE_MS);
    store.put(Document::Appointment(clash.clone())).await.unwrap();
    let doc = decided(&store, Collection::Appointments, clash.id).await;
    assert_eq!(doc.status(), Some(Status::Failed));
    assert!(failure_reason(&doc).is_some());

    let next = book(DAY + 11 * H);
    store.put(Document::Appointment(next.clone())).await.unwrap();
    let doc = decided(&store, Collection::Appointments, next.id).await;
    assert_eq!(doc.status(), Some(Status::Confirmed));
}

#[tokio::test]
async fn therapy_without_practitioner_fails() {
    let store = start_engine();
    let therapy = Therapy {
        id: Ulid::new(),
        name: "Sauna".into(),
        duration_minutes: 30,
        practitioner_id: None,
    };
    store.put(Document::Therapy(therapy.clone())).await.unwrap();
    let a = Appointment::new(Ulid::new(), therapy.id, Ulid::new(), DAY + 10 * H, DAY);
    store.put(Document::Appointment(a.clone())).await.unwrap();

    let doc = decided(&store, Collection::Appointments, a.id).await;
    assert_eq!(doc.status(), Some(Status::Failed));
}

// ── Cascade ──────────────────────────────────────────────────

#[tokio::test]
async fn activity_suspension_cancels_confirmed_reservations() {
    let store = start_engine();
    let suspended = Activity {
        id: Ulid::new(),
        name: "Aqua gym".into(),
        capacity: 10,
    };
    let untouched = Activity {
        id: Ulid::new(),
        name: "Boxing".into(),
        capacity: 10,
    };
    store.put(Document::Activity(suspended.clone())).await.unwrap();
    store.put(Document::Activity(untouched.clone())).await.unwrap();

    let hit = GroupReservation::new(Ulid::new(), suspended.id, Ulid::new(), DAY + 10 * H, 1, DAY);
    let other = GroupReservation::new(Ulid::new(), untouched.id, Ulid::new(), DAY + 10 * H, 1, DAY);
    store.put(Document::Reservation(hit.clone())).await.unwrap();
    store.put(Document::Reservation(other.clone())).await.unwrap();
    wait_for_status(&store, Collection::Reservations, hit.id, Status::Confirmed).await;
    wait_for_status(&store, Collection::Reservations, other.id, Status::Confirmed).await;

    let mut notices = store.notify.subscribe(hit.user_id);
    let suspension = Suspension {
        id: Ulid::new(),
        scope: Scope::Activity,
        target_id: suspended.id,
        window_start: DAY,
        window_end: DAY + 24 * H,
        reason: "pool closed".into(),
        cascades: true,
    };
    store.put(Document::Suspension(suspension.clone())).await.unwrap();

    wait_for_status(&store, Collection::Reservations, hit.id, Status::CancelledByAdmin).await;
    let doc = store.get(Collection::Reservations, hit.id).unwrap();
    assert_eq!(failure_reason(&doc).as_deref(), Some("pool closed"));
    assert_eq!(
        store.get(Collection::Reservations, other.id).and_then(|d| d.status()),
        Some(Status::Confirmed)
    );

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.record_id, hit.id);
    assert_eq!(notice.suspension_id, suspension.id);
    assert_eq!(notice.reason, "pool closed");
}

#[tokio::test]
async fn non_cascading_suspension_leaves_bookings() {
    let store = start_engine();
    let activity = Activity {
        id: Ulid::new(),
        name: "Climbing".into(),
        capacity: 4,
    };
    store.put(Document::Activity(activity.clone())).await.unwrap();
    let r = GroupReservation::new(Ulid::new(), activity.id, Ulid::new(), DAY + 10 * H, 1, DAY);
    store.put(Document::Reservation(r.clone())).await.unwrap();
    wait_for_status(&store, Collection::Reservations, r.id, Status::Confirmed).await;

    let suspension = Suspension {
        id: Ulid::new(),
        scope: Scope::Activity,
        target_id: activity.id,
        window_start: DAY,
        window_end: DAY + 24 * H,
        reason: "wall inspection".into(),
        cascades: false,
    };
    store.put(Document::Suspension(suspension)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        store.get(Collection::Reservations, r.id).and_then(|d| d.status()),
        Some(Status::Confirmed)
    );
}

#[tokio::test]
async fn practitioner_suspension_cancels_appointments() {
    let store = start_engine();
    let practitioner = Ulid::new();
    let therapy = Therapy {
        id: Ulid::new(),
        name: "Physio".into(),
        duration_minutes: 45,
        practitioner_id: Some(practitioner),
    };
    store.put(Document::Therapy(therapy.clone())).await.unwrap();

    let inside = Appointment::new(Ulid::new(), therapy.id, Ulid::new(), DAY + 10 * H, DAY);
    let outside = Appointment::new(Ulid::new(), therapy.id, Ulid::new(), DAY + 30 * H, DAY);
    store.put(Document::Appointment(inside.clone())).await.unwrap();
    store.put(Document::Appointment(outside.clone())).await.unwrap();
    wait_for_status(&store, Collection::Appointments, inside.id, Status::Confirmed).await;
    wait_for_status(&store, Collection::Appointments, outside.id, Status::Confirmed).await;

    let suspension = Suspension {
        id: Ulid::new(),
        scope: Scope::Practitioner,
        target_id: practitioner,
        window_start: DAY,
        window_end: DAY + 24 * H,
        reason: "sick leave".into(),
        cascades: true,
    };
    store.put(Document::Suspension(suspension.clone())).await.unwrap();
    wait_for_status(&store, Collection::Appointments, inside.id, Status::CancelledByAdmin).await;

    // Rewriting the suspension redelivers it; nothing else changes.
    store.put(Document::Suspension(suspension)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        store.get(Collection::Appointments, outside.id).and_then(|d| d.status()),
        Some(Status::Confirmed)
    );
    assert_eq!(
        store.get(Collection::Appointments, inside.id).and_then(|d| d.status()),
        Some(Status::CancelledByAdmin)
    );
}

// ── Recovery ─────────────────────────────────────────────────

#[tokio::test]
async fn pending_bookings_are_decided_after_restart() {
    let dir = std::env::temp_dir().join(format!("reservd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("reservd.wal");

    let activity = Activity {
        id: Ulid::new(),
        name: "Rowing".into(),
        capacity: 3,
    };
    let r = GroupReservation::new(Ulid::new(), activity.id, Ulid::new(), DAY, 2, DAY);
    {
        // No dispatcher: the process "stops" before admission runs.
        let store = Store::open(path.clone(), Arc::new(NotifyHub::new()), StoreOptions::default()).unwrap();
        store.put(Document::Activity(activity.clone())).await.unwrap();
        store.put(Document::Reservation(r.clone())).await.unwrap();
    }

    let store = Arc::new(Store::open(path, Arc::new(NotifyHub::new()), StoreOptions::default()).unwrap());
    assert_eq!(
        store.get(Collection::Reservations, r.id).and_then(|d| d.status()),
        Some(Status::Pending)
    );
    let changes = store.subscribe_changes();
    tokio::spawn(trigger::run_dispatcher(store.clone(), changes));

    let doc = decided(&store, Collection::Reservations, r.id).await;
    assert_eq!(doc.status(), Some(Status::Confirmed));
}
