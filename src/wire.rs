use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, NewBooking, NewUnavailability, WorkingHoursInput};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::notify::PushHub;

/// One request line. The `op` field selects the operation.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateBooking(NewBooking),
    ConfirmBooking {
        booking_id: Ulid,
        actor: Ulid,
        #[serde(default)]
        meeting_link: Option<String>,
    },
    RejectBooking {
        booking_id: Ulid,
        actor: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    CancelBooking {
        booking_id: Ulid,
        actor: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    RescheduleBooking {
        booking_id: Ulid,
        actor: Ulid,
        new_start: Ms,
        #[serde(default)]
        new_duration_minutes: Option<u32>,
        #[serde(default)]
        reason: Option<String>,
    },
    CompleteBooking {
        booking_id: Ulid,
        actor: Ulid,
    },
    ReportNoShow {
        booking_id: Ulid,
        actor: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    GetBooking {
        booking_id: Ulid,
    },
    AvailableSlots {
        expert_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        slot_minutes: u32,
    },
    StatusHistory {
        booking_id: Ulid,
    },
    SetWorkingHours {
        expert_id: Ulid,
        rules: Vec<WorkingHoursInput>,
    },
    AddUnavailability(NewUnavailability),
    RemoveUnavailability {
        id: Ulid,
    },
    RebuildIndex {
        owner: OwnerKind,
        owner_id: Ulid,
        date: NaiveDate,
    },
    Subscribe {
        owner_id: Ulid,
    },
}

impl Request {
    /// Metric label.
    pub fn op(&self) -> &'static str {
        match self {
            Request::CreateBooking(_) => "create_booking",
            Request::ConfirmBooking { .. } => "confirm_booking",
            Request::RejectBooking { .. } => "reject_booking",
            Request::CancelBooking { .. } => "cancel_booking",
            Request::RescheduleBooking { .. } => "reschedule_booking",
            Request::CompleteBooking { .. } => "complete_booking",
            Request::ReportNoShow { .. } => "report_no_show",
            Request::GetBooking { .. } => "get_booking",
            Request::AvailableSlots { .. } => "available_slots",
            Request::StatusHistory { .. } => "status_history",
            Request::SetWorkingHours { .. } => "set_working_hours",
            Request::AddUnavailability(_) => "add_unavailability",
            Request::RemoveUnavailability { .. } => "remove_unavailability",
            Request::RebuildIndex { .. } => "rebuild_index",
            Request::Subscribe { .. } => "subscribe",
        }
    }
}

pub fn ok_response(data: Value) -> Value {
    json!({ "ok": true, "data": data })
}

pub fn error_response(e: &EngineError) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": e.code(),
            "message": e.to_string(),
            "retryable": e.is_retryable(),
        }
    })
}

/// Run every non-subscribe operation against the engine.
async fn execute(engine: &Engine, req: Request) -> Result<Value, EngineError> {
    let data = match req {
        Request::CreateBooking(new) => json!(engine.create_booking(new).await?),
        Request::ConfirmBooking {
            booking_id,
            actor,
            meeting_link,
        } => json!(engine.confirm_booking(booking_id, actor, meeting_link).await?),
        Request::RejectBooking {
            booking_id,
            actor,
            reason,
        } => json!(engine.reject_booking(booking_id, actor, reason).await?),
        Request::CancelBooking {
            booking_id,
            actor,
            reason,
        } => json!(engine.cancel_booking(booking_id, actor, reason).await?),
        Request::RescheduleBooking {
            booking_id,
            actor,
            new_start,
            new_duration_minutes,
            reason,
        } => json!(
            engine
                .reschedule_booking(booking_id, actor, new_start, new_duration_minutes, reason)
                .await?
        ),
        Request::CompleteBooking { booking_id, actor } => {
            json!(engine.complete_booking(booking_id, actor).await?)
        }
        Request::ReportNoShow {
            booking_id,
            actor,
            reason,
        } => json!(engine.report_no_show(booking_id, actor, reason).await?),
        Request::GetBooking { booking_id } => json!(engine.get_booking(booking_id).await?),
        Request::AvailableSlots {
            expert_id,
            from,
            to,
            slot_minutes,
        } => json!(engine.available_slots(expert_id, from, to, slot_minutes).await?),
        Request::StatusHistory { booking_id } => {
            json!(engine.status_history(booking_id).await?)
        }
        Request::SetWorkingHours { expert_id, rules } => {
            json!(engine.set_working_hours(expert_id, rules).await?)
        }
        Request::AddUnavailability(new) => json!(engine.add_unavailability(new).await?),
        Request::RemoveUnavailability { id } => json!(engine.remove_unavailability(id).await?),
        Request::RebuildIndex {
            owner,
            owner_id,
            date,
        } => json!({ "indexed": engine.rebuild_index(owner, owner_id, date).await? }),
        Request::Subscribe { .. } => {
            return Err(EngineError::Validation("subscribe is handled per connection".into()));
        }
    };
    Ok(data)
}

/// The realtime subscription a connection holds, if any.
type Subscription = Option<(Ulid, broadcast::Receiver<String>)>;

/// Serve one client: read request lines, answer each with one response line, and
/// interleave `{"push": ...}` lines once the client subscribed to an owner.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    hub: Arc<PushHub>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut subscription: Subscription = None;

    let result = serve(&mut framed, &engine, &hub, &mut subscription).await;

    if let Some((owner_id, rx)) = subscription.take() {
        drop(rx);
        hub.prune(&owner_id);
    }
    result
}

async fn serve(
    framed: &mut Framed<TcpStream, LinesCodec>,
    engine: &Engine,
    hub: &PushHub,
    subscription: &mut Subscription,
) -> Result<(), LinesCodecError> {
    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let e = EngineError::Validation(format!("request line longer than {MAX_LINE_LEN} bytes"));
                        framed.send(error_response(&e).to_string()).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&line, engine, hub, subscription).await;
                framed.send(response.to_string()).await?;
            }
            message = next_push(subscription) => {
                framed.send(json!({ "push": message }).to_string()).await?;
            }
        }
    }
}

/// Parse, dispatch and time one request line.
async fn handle_line(
    line: &str,
    engine: &Engine,
    hub: &PushHub,
    subscription: &mut Subscription,
) -> Value {
    let started = Instant::now();
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            let err = EngineError::Validation(format!("malformed request: {e}"));
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => "invalid", "status" => "error")
                .increment(1);
            return error_response(&err);
        }
    };
    let op = req.op();

    let result = match req {
        Request::Subscribe { owner_id } => {
            if let Some((previous, rx)) = subscription.take() {
                drop(rx);
                hub.prune(&previous);
            }
            *subscription = Some((owner_id, hub.subscribe(owner_id)));
            debug!(owner = %owner_id, "realtime subscription registered");
            Ok(json!({ "owner_id": owner_id }))
        }
        other => execute(engine, other).await,
    };

    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => status)
        .increment(1);
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => ok_response(data),
        Err(e) => {
            debug!(op, code = %e.code(), "request failed: {e}");
            error_response(&e)
        }
    }
}

/// Next push for the subscribed owner. Pending forever while unsubscribed.
async fn next_push(subscription: &mut Subscription) -> String {
    let Some((owner_id, rx)) = subscription.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(message) => return message,
            Err(RecvError::Lagged(skipped)) => {
                warn!(owner = %owner_id, skipped, "slow subscriber, pushes dropped");
            }
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}
