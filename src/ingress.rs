//! Newline-delimited JSON surface for the external collaborator.
//!
//! One request per line, one reply per line. Creation requests only persist
//! a `pending` record and return its id; the outcome is decided
//! asynchronously and read back with `get`. After `subscribe`, the
//! connection also receives that user's cancellation notices as they happen.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::{Query, Store, StoreError, now_ms};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    PutActivity {
        id: Option<Ulid>,
        name: String,
        capacity: u32,
    },
    PutTherapy {
        id: Option<Ulid>,
        name: String,
        duration_minutes: u32,
        practitioner_id: Option<Ulid>,
    },
    CreateReservation {
        activity_id: Ulid,
        user_id: Ulid,
        scheduled_at: Ms,
        seats_requested: Option<u32>,
    },
    CreateAppointment {
        therapy_id: Ulid,
        user_id: Ulid,
        start_at: Ms,
    },
    PutSuspension {
        id: Option<Ulid>,
        scope: Scope,
        target_id: Ulid,
        window_start: Ms,
        window_end: Ms,
        reason: String,
        #[serde(default)]
        cascades: bool,
    },
    DeleteSuspension {
        id: Ulid,
    },
    Get {
        collection: Collection,
        id: Ulid,
    },
    List {
        collection: Collection,
        /// Resume after this id; pages are ordered by id.
        after: Option<Ulid>,
        limit: Option<usize>,
    },
    Subscribe {
        user_id: Ulid,
    },
}

impl Request {
    pub fn label(&self) -> &'static str {
        match self {
            Request::PutActivity { .. } => "put_activity",
            Request::PutTherapy { .. } => "put_therapy",
            Request::CreateReservation { .. } => "create_reservation",
            Request::CreateAppointment { .. } => "create_appointment",
            Request::PutSuspension { .. } => "put_suspension",
            Request::DeleteSuspension { .. } => "delete_suspension",
            Request::Get { .. } => "get",
            Request::List { .. } => "list",
            Request::Subscribe { .. } => "subscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Ok { id: Ulid },
    Document { document: serde_json::Value },
    Documents {
        documents: Vec<serde_json::Value>,
        /// Pass as `after` to fetch the next page; absent on the last page.
        #[serde(skip_serializing_if = "Option::is_none")]
        next: Option<Ulid>,
    },
    Subscribed { user_id: Ulid },
    Notice { notice: CancellationNotice },
    Error { kind: &'static str, message: String },
}

impl Reply {
    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"reply":"error","kind":"internal","message":"unencodable reply: {e}"}}"#)
        })
    }
}

#[derive(Debug)]
pub enum IngressError {
    BadRequest(String),
    LimitExceeded(&'static str),
    NotFound(Collection, Ulid),
    Store(StoreError),
    Io(std::io::Error),
}

impl IngressError {
    fn kind(&self) -> &'static str {
        match self {
            IngressError::BadRequest(_) => "bad_request",
            IngressError::LimitExceeded(_) => "limit_exceeded",
            IngressError::NotFound(..) => "not_found",
            IngressError::Store(_) | IngressError::Io(_) => "internal",
        }
    }
}

impl std::fmt::Display for IngressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngressError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            IngressError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            IngressError::NotFound(collection, id) => write!(f, "not found: {}/{id}", collection.as_str()),
            IngressError::Store(e) => write!(f, "{e}"),
            IngressError::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for IngressError {}

impl From<StoreError> for IngressError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LimitExceeded(msg) => IngressError::LimitExceeded(msg),
            other => IngressError::Store(other),
        }
    }
}

impl From<LinesCodecError> for IngressError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => IngressError::LimitExceeded("line too long"),
            LinesCodecError::Io(e) => IngressError::Io(e),
        }
    }
}

fn check_name(name: &str) -> Result<(), IngressError> {
    if name.trim().is_empty() {
        return Err(IngressError::BadRequest("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(IngressError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_time(t: Ms) -> Result<(), IngressError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(IngressError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Reject malformed input before anything is written.
pub fn validate(req: &Request) -> Result<(), IngressError> {
    match req {
        Request::PutActivity { name, capacity, .. } => {
            check_name(name)?;
            if *capacity == 0 {
                return Err(IngressError::BadRequest("capacity must be positive".into()));
            }
            if *capacity > MAX_CAPACITY {
                return Err(IngressError::LimitExceeded("capacity too large"));
            }
        }
        Request::PutTherapy {
            name, duration_minutes, ..
        } => {
            check_name(name)?;
            if *duration_minutes == 0 {
                return Err(IngressError::BadRequest("duration must be positive".into()));
            }
            if *duration_minutes > MAX_DURATION_MINUTES {
                return Err(IngressError::LimitExceeded("duration too long"));
            }
        }
        Request::CreateReservation {
            scheduled_at,
            seats_requested,
            ..
        } => {
            check_time(*scheduled_at)?;
            if seats_requested.is_some_and(|n| n > MAX_SEATS_PER_RESERVATION) {
                return Err(IngressError::LimitExceeded("too many seats requested"));
            }
        }
        Request::CreateAppointment { start_at, .. } => check_time(*start_at)?,
        Request::PutSuspension {
            window_start,
            window_end,
            reason,
            ..
        } => {
            check_time(*window_start)?;
            check_time(*window_end)?;
            if window_start >= window_end {
                return Err(IngressError::BadRequest("window_start must be before window_end".into()));
            }
            if reason.len() > MAX_REASON_LEN {
                return Err(IngressError::LimitExceeded("reason too long"));
            }
        }
        Request::List { limit: Some(0), .. } => {
            return Err(IngressError::BadRequest("limit must be positive".into()));
        }
        Request::DeleteSuspension { .. } | Request::Get { .. } | Request::List { .. } | Request::Subscribe { .. } => {}
    }
    Ok(())
}

/// Execute one request. `notices` is the connection's subscription slot.
pub async fn execute(
    store: &Store,
    req: Request,
    notices: &mut Option<broadcast::Receiver<CancellationNotice>>,
) -> Result<Reply, IngressError> {
    validate(&req)?;
    match req {
        Request::PutActivity { id, name, capacity } => {
            let id = id.unwrap_or_else(Ulid::new);
            store.put(Document::Activity(Activity { id, name, capacity })).await?;
            Ok(Reply::Ok { id })
        }
        Request::PutTherapy {
            id,
            name,
            duration_minutes,
            practitioner_id,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            store
                .put(Document::Therapy(Therapy {
                    id,
                    name,
                    duration_minutes,
                    practitioner_id,
                }))
                .await?;
            Ok(Reply::Ok { id })
        }
        Request::CreateReservation {
            activity_id,
            user_id,
            scheduled_at,
            seats_requested,
        } => {
            let id = Ulid::new();
            let r = GroupReservation::new(
                id,
                activity_id,
                user_id,
                scheduled_at,
                seats_requested.unwrap_or(1),
                now_ms(),
            );
            store.put(Document::Reservation(r)).await?;
            Ok(Reply::Ok { id })
        }
        Request::CreateAppointment {
            therapy_id,
            user_id,
            start_at,
        } => {
            let id = Ulid::new();
            let a = Appointment::new(id, therapy_id, user_id, start_at, now_ms());
            store.put(Document::Appointment(a)).await?;
            Ok(Reply::Ok { id })
        }
        Request::PutSuspension {
            id,
            scope,
            target_id,
            window_start,
            window_end,
            reason,
            cascades,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            store
                .put(Document::Suspension(Suspension {
                    id,
                    scope,
                    target_id,
                    window_start,
                    window_end,
                    reason,
                    cascades,
                }))
                .await?;
            Ok(Reply::Ok { id })
        }
        Request::DeleteSuspension { id } => {
            if store.get(Collection::Suspensions, id).is_none() {
                return Err(IngressError::NotFound(Collection::Suspensions, id));
            }
            store.delete(Collection::Suspensions, id).await?;
            Ok(Reply::Ok { id })
        }
        Request::Get { collection, id } => match store.get(collection, id) {
            Some(doc) => Ok(Reply::Document { document: doc.to_json() }),
            None => Err(IngressError::NotFound(collection, id)),
        },
        Request::List { collection, after, limit } => {
            let limit = limit.unwrap_or(MAX_LIST_RESULTS).min(MAX_LIST_RESULTS);
            let mut query = Query::new(collection);
            if let Some(after) = after {
                query = query.gte(Field::Id, Value::Id(after));
            }
            let mut page: Vec<Document> = store
                .query(&query)?
                .into_iter()
                .filter(|doc| Some(doc.id()) != after)
                .take(limit + 1)
                .collect();
            let next = if page.len() > limit {
                page.truncate(limit);
                page.last().map(Document::id)
            } else {
                None
            };
            let documents = page.iter().map(Document::to_json).collect();
            Ok(Reply::Documents { documents, next })
        }
        Request::Subscribe { user_id } => {
            *notices = Some(store.notify.subscribe(user_id));
            Ok(Reply::Subscribed { user_id })
        }
    }
}

async fn handle_line(
    store: &Store,
    line: &str,
    notices: &mut Option<broadcast::Receiver<CancellationNotice>>,
) -> Reply {
    let started = Instant::now();
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "error").increment(1);
            return Reply::Error {
                kind: "bad_request",
                message: e.to_string(),
            };
        }
    };
    let op = req.label();
    let result = execute(store, req, notices).await;
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
    match result {
        Ok(reply) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
            reply
        }
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "error").increment(1);
            debug!(op, "request rejected: {e}");
            Reply::Error {
                kind: e.kind(),
                message: e.to_string(),
            }
        }
    }
}

/// Pending forever while nobody is subscribed.
async fn next_notice(notices: &mut Option<broadcast::Receiver<CancellationNotice>>) -> Option<CancellationNotice> {
    let Some(rx) = notices else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(notice) => return Some(notice),
            Err(RecvError::Lagged(missed)) => warn!(missed, "subscriber lagged, notices dropped"),
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, store: Arc<Store>) -> Result<(), IngressError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut notices: Option<broadcast::Receiver<CancellationNotice>> = None;

    loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => break,
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&store, &line, &mut notices).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Reply::Error {
                        kind: "limit_exceeded",
                        message: "line too long".into(),
                    },
                    Some(Err(e)) => return Err(e.into()),
                };
                framed.send(reply.to_line()).await?;
            }
            notice = next_notice(&mut notices) => match notice {
                Some(notice) => framed.send(Reply::Notice { notice }.to_line()).await?,
                None => notices = None,
            },
        }
    }
    Ok(())
}
