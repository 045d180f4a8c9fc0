use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Entities ─────────────────────────────────────────────────────

/// Booking lifecycle: `Pending → {Confirmed | Failed}`, then optionally
/// `Confirmed → CancelledByAdmin` through a suspension cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Confirmed,
    Failed,
    CancelledByAdmin,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Confirmed => "confirmed",
            Status::Failed => "failed",
            Status::CancelledByAdmin => "cancelled_by_admin",
        }
    }

    /// Counts against capacity / practitioner time.
    pub fn is_active(self) -> bool {
        matches!(self, Status::Pending | Status::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending)
    }

    /// Whether the lifecycle permits moving from `self` to `to`.
    pub fn can_transition_to(self, to: Status) -> bool {
        matches!(
            (self, to),
            (Status::Pending, Status::Confirmed)
                | (Status::Pending, Status::Failed)
                | (Status::Confirmed, Status::CancelledByAdmin)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// `target_id` names an activity (group path) or a therapy (individual path).
    Activity,
    /// `target_id` names a practitioner.
    Practitioner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReservation {
    pub id: Ulid,
    pub activity_id: Ulid,
    pub user_id: Ulid,
    /// Identifies one recurring instance of the activity.
    pub scheduled_at: Ms,
    pub seats_requested: u32,
    pub status: Status,
    pub failure_reason: Option<String>,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl GroupReservation {
    pub fn new(id: Ulid, activity_id: Ulid, user_id: Ulid, scheduled_at: Ms, seats_requested: u32, created_at: Ms) -> Self {
        Self {
            id,
            activity_id,
            user_id,
            scheduled_at,
            seats_requested,
            status: Status::Pending,
            failure_reason: None,
            created_at,
            cancelled_at: None,
        }
    }

    /// Seats this reservation occupies; zero means the default of one.
    pub fn seats(&self) -> u32 {
        self.seats_requested.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Therapy {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub practitioner_id: Option<Ulid>,
}

impl Therapy {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub therapy_id: Ulid,
    pub user_id: Ulid,
    pub start_at: Ms,
    pub status: Status,
    pub failure_reason: Option<String>,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl Appointment {
    pub fn new(id: Ulid, therapy_id: Ulid, user_id: Ulid, start_at: Ms, created_at: Ms) -> Self {
        Self {
            id,
            therapy_id,
            user_id,
            start_at,
            status: Status::Pending,
            failure_reason: None,
            created_at,
            cancelled_at: None,
        }
    }

    /// `[start_at, start_at + therapy duration)`. The end is never stored.
    pub fn span(&self, therapy: &Therapy) -> Span {
        Span::new(self.start_at, self.start_at + therapy.duration_ms())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    pub id: Ulid,
    pub scope: Scope,
    pub target_id: Ulid,
    pub window_start: Ms,
    pub window_end: Ms,
    pub reason: String,
    /// Only cascading suspensions cancel bookings.
    pub cascades: bool,
}

impl Suspension {
    /// The suspension window is closed on both ends.
    pub fn covers(&self, t: Ms) -> bool {
        self.window_start <= t && t <= self.window_end
    }

    pub fn has_valid_window(&self) -> bool {
        self.window_start < self.window_end
    }
}

// ── Documents ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Activities,
    Reservations,
    Therapies,
    Appointments,
    Suspensions,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Activities,
        Collection::Reservations,
        Collection::Therapies,
        Collection::Appointments,
        Collection::Suspensions,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Collection::Activities => "activities",
            Collection::Reservations => "reservations",
            Collection::Therapies => "therapies",
            Collection::Appointments => "appointments",
            Collection::Suspensions => "suspensions",
        }
    }
}

/// Queryable document fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    ActivityId,
    ScheduledAt,
    Status,
    TherapyId,
    StartAt,
    PractitionerId,
    UserId,
    TargetId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Id(Ulid),
    Time(Ms),
    Status(Status),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Document {
    Activity(Activity),
    Reservation(GroupReservation),
    Therapy(Therapy),
    Appointment(Appointment),
    Suspension(Suspension),
}

impl Document {
    pub fn id(&self) -> Ulid {
        match self {
            Document::Activity(d) => d.id,
            Document::Reservation(d) => d.id,
            Document::Therapy(d) => d.id,
            Document::Appointment(d) => d.id,
            Document::Suspension(d) => d.id,
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            Document::Activity(_) => Collection::Activities,
            Document::Reservation(_) => Collection::Reservations,
            Document::Therapy(_) => Collection::Therapies,
            Document::Appointment(_) => Collection::Appointments,
            Document::Suspension(_) => Collection::Suspensions,
        }
    }

    /// Booking status; `None` for catalog and suspension documents.
    pub fn status(&self) -> Option<Status> {
        match self {
            Document::Reservation(r) => Some(r.status),
            Document::Appointment(a) => Some(a.status),
            _ => None,
        }
    }

    pub fn field(&self, field: Field) -> Option<Value> {
        match (self, field) {
            (doc, Field::Id) => Some(Value::Id(doc.id())),
            (Document::Reservation(r), Field::ActivityId) => Some(Value::Id(r.activity_id)),
            (Document::Reservation(r), Field::ScheduledAt) => Some(Value::Time(r.scheduled_at)),
            (Document::Reservation(r), Field::Status) => Some(Value::Status(r.status)),
            (Document::Reservation(r), Field::UserId) => Some(Value::Id(r.user_id)),
            (Document::Therapy(t), Field::PractitionerId) => t.practitioner_id.map(Value::Id),
            (Document::Appointment(a), Field::TherapyId) => Some(Value::Id(a.therapy_id)),
            (Document::Appointment(a), Field::StartAt) => Some(Value::Time(a.start_at)),
            (Document::Appointment(a), Field::Status) => Some(Value::Status(a.status)),
            (Document::Appointment(a), Field::UserId) => Some(Value::Id(a.user_id)),
            (Document::Suspension(s), Field::TargetId) => Some(Value::Id(s.target_id)),
            _ => None,
        }
    }

    /// Set status, reason, and (for admin cancellations) the cancellation time.
    /// Returns false for documents without a booking status.
    pub fn apply_transition(&mut self, to: Status, reason: Option<&str>, at: Ms) -> bool {
        let (status, failure_reason, cancelled_at) = match self {
            Document::Reservation(r) => (&mut r.status, &mut r.failure_reason, &mut r.cancelled_at),
            Document::Appointment(a) => (&mut a.status, &mut a.failure_reason, &mut a.cancelled_at),
            _ => return false,
        };
        *status = to;
        *failure_reason = reason.map(str::to_owned);
        if to == Status::CancelledByAdmin {
            *cancelled_at = Some(at);
        }
        true
    }

    /// JSON view with a `collection` tag, for the ingress surface.
    pub fn to_json(&self) -> serde_json::Value {
        let body = match self {
            Document::Activity(d) => serde_json::to_value(d),
            Document::Reservation(d) => serde_json::to_value(d),
            Document::Therapy(d) => serde_json::to_value(d),
            Document::Appointment(d) => serde_json::to_value(d),
            Document::Suspension(d) => serde_json::to_value(d),
        };
        let mut body = body.unwrap_or(serde_json::Value::Null);
        if let Some(map) = body.as_object_mut() {
            map.insert("collection".into(), self.collection().as_str().into());
        }
        body
    }
}

// ── WAL record format ────────────────────────────────────────────

/// One mutation inside a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Write {
    Put(Document),
    Delete {
        collection: Collection,
        id: Ulid,
    },
    /// Booking status change. `expect` is checked at commit time; a mismatch
    /// rejects the whole commit.
    Transition {
        collection: Collection,
        id: Ulid,
        to: Status,
        reason: Option<String>,
        at: Ms,
        expect: Option<Status>,
    },
}

impl Write {
    pub fn target(&self) -> (Collection, Ulid) {
        match self {
            Write::Put(doc) => (doc.collection(), doc.id()),
            Write::Delete { collection, id } | Write::Transition { collection, id, .. } => (*collection, *id),
        }
    }
}

/// A committed transaction or batch. This is the WAL record format.
/// All writes of a commit are applied together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub seq: u64,
    pub at: Ms,
    pub writes: Vec<Write>,
}

// ── Change feed / notifications ──────────────────────────────────

/// Before/after snapshots of one applied write. Published on the store's
/// change feed; this is what triggers admission and cascades.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub seq: u64,
    pub collection: Collection,
    pub id: Ulid,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

impl Change {
    pub fn is_create(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }
}

/// "Notify user X that record Y was cancelled for reason Z."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationNotice {
    pub record_id: Ulid,
    pub collection: Collection,
    pub user_id: Ulid,
    pub suspension_id: Ulid,
    pub reason: String,
    pub cancelled_at: Ms,
}
