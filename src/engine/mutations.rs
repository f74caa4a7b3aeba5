use chrono::NaiveTime;
use serde::Deserialize;
use serde_json::json;
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::lifecycle::{self, Action};
use super::{Engine, EngineError};

fn default_kind() -> BookingKind {
    BookingKind::Online
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBooking {
    pub user_id: Ulid,
    pub expert_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    #[serde(default = "default_kind")]
    pub kind: BookingKind,
    #[serde(default)]
    pub user_notes: Option<String>,
    #[serde(default)]
    pub fee: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkingHoursInput {
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUnavailability {
    pub expert_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub until: Option<Ms>,
    #[serde(default)]
    pub reason: Option<String>,
}

fn validation(msg: impl Into<String>) -> EngineError {
    EngineError::Validation(msg.into())
}

fn check_text(field: &str, value: Option<&str>, max: usize) -> Result<(), EngineError> {
    if let Some(v) = value
        && v.chars().count() > max {
            return Err(validation(format!("{field} longer than {max} characters")));
        }
    Ok(())
}

fn check_timestamp(field: &str, at: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(validation(format!("{field} out of range")));
    }
    Ok(())
}

/// Shape checks for a requested appointment. No I/O.
fn validate_slot(start: Ms, duration_minutes: u32, now: Ms) -> Result<Span, EngineError> {
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
        return Err(validation(format!(
            "duration must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES} minutes"
        )));
    }
    check_timestamp("start", start)?;
    if start <= now {
        return Err(validation("start must be in the future"));
    }
    let end = start + duration_minutes as Ms * MINUTE_MS;
    check_timestamp("end", end)?;
    Ok(Span::new(start, end))
}

impl Engine {
    // ── Creation ─────────────────────────────────────────────

    /// Create a `pending` booking.
    ///
    /// 1. Validate shape.
    /// 2. Cheap pre-check of expert and user (index, store on miss).
    /// 3. Take the (expert, local date) reservation lock.
    /// 4. Re-check both owners against the store while holding it.
    /// 5. Insert booking + first history row in one store transaction.
    /// 6. Index, release, then queue the event and push.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let now = self.now();
        let span = validate_slot(req.start, req.duration_minutes, now)?;
        if req.user_id == req.expert_id {
            return Err(validation("user and expert must differ"));
        }
        check_text("user_notes", req.user_notes.as_deref(), MAX_NOTE_LEN)?;

        self.check_expert(req.expert_id, span, None)
            .await?
            .into_result(OwnerKind::Expert)?;
        self.check_user(req.user_id, span, None)
            .await?
            .into_result(OwnerKind::User)?;

        let date = calendar::local_date(self.config.timezone, span.start);
        let guard = self
            .locks
            .acquire(req.expert_id, date)
            .await
            .ok_or(EngineError::Contended)?;
        let result = self.create_locked(req, span, now).await;
        self.locks.release(guard).await;
        let booking = result?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        self.emit(
            Action::Create,
            &booking,
            booking.user_id,
            json!({
                "status": booking.status,
                "start": booking.start,
                "duration_minutes": booking.duration_minutes,
                "kind": booking.kind,
            }),
        );
        Ok(booking)
    }

    async fn create_locked(&self, req: NewBooking, span: Span, now: Ms) -> Result<Booking, EngineError> {
        self.check_owner_authoritative(OwnerKind::Expert, req.expert_id, span, None)
            .await?
            .into_result(OwnerKind::Expert)?;
        self.check_owner_authoritative(OwnerKind::User, req.user_id, span, None)
            .await?
            .into_result(OwnerKind::User)?;

        let booking = Booking {
            id: Ulid::new(),
            user_id: req.user_id,
            expert_id: req.expert_id,
            start: span.start,
            duration_minutes: req.duration_minutes,
            kind: req.kind,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Pending,
            user_notes: req.user_notes,
            expert_notes: None,
            meeting_link: None,
            fee: req.fee,
            created_at: now,
            updated_at: now,
            cancellation_reason: None,
            cancelled_by: None,
            cancelled_at: None,
        };
        let entry = StatusHistoryEntry {
            booking_id: booking.id,
            old_status: None,
            new_status: BookingStatus::Pending,
            actor_id: req.user_id,
            reason: None,
            at: now,
            rescheduled_from: None,
            rescheduled_to: None,
        };
        self.store_call(self.store.insert_booking(booking.clone(), entry))
            .await?;
        self.index.put(&IndexEntry::from(&booking), now).await;
        Ok(booking)
    }

    // ── Transitions ──────────────────────────────────────────

    /// Load, authorize and compute the target status.
    async fn begin(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        action: Action,
    ) -> Result<(Booking, BookingStatus), EngineError> {
        let booking = self.load(booking_id).await?;
        let party = lifecycle::authorize(&booking, actor, action)?;
        let to = lifecycle::next_status(booking.status, action, party)?;
        Ok((booking, to))
    }

    /// Persist a transition (CAS on `from`), sync the index and queue side effects.
    async fn commit(
        &self,
        mut booking: Booking,
        from: BookingStatus,
        action: Action,
        actor: Ulid,
        reason: Option<String>,
        moved: Option<(Ms, Ms)>,
    ) -> Result<Booking, EngineError> {
        let now = self.now();
        booking.updated_at = now;
        let entry = StatusHistoryEntry {
            booking_id: booking.id,
            old_status: Some(from),
            new_status: booking.status,
            actor_id: actor,
            reason: reason.clone(),
            at: now,
            rescheduled_from: moved.map(|(old, _)| old),
            rescheduled_to: moved.map(|(_, new)| new),
        };
        self.store_call(self.store.update_booking(booking.clone(), from, entry))
            .await?;
        self.index.sync(&booking, now).await;

        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "action" => action.as_str())
            .increment(1);
        let mut data = json!({
            "from": from,
            "status": booking.status,
            "start": booking.start,
            "duration_minutes": booking.duration_minutes,
        });
        if let Some(reason) = reason {
            data["reason"] = json!(reason);
        }
        if let Some((old, new)) = moved {
            data["rescheduled_from"] = json!(old);
            data["rescheduled_to"] = json!(new);
        }
        if let Some(link) = &booking.meeting_link {
            data["meeting_link"] = json!(link);
        }
        self.emit(action, &booking, actor, data);
        Ok(booking)
    }

    fn check_lead_time(&self, booking: &Booking, now: Ms) -> Result<(), EngineError> {
        let lead = self.config.cancel_lead_minutes;
        if booking.status == BookingStatus::Confirmed && booking.start - now < lead * MINUTE_MS {
            return Err(EngineError::LeadTimeViolation {
                required_minutes: lead,
            });
        }
        Ok(())
    }

    /// `pending → confirmed`. Expert only. May attach the meeting link or address.
    pub async fn confirm_booking(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        meeting_link: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_text("meeting_link", meeting_link.as_deref(), MAX_LINK_LEN)?;
        let (mut booking, to) = self.begin(booking_id, actor, Action::Confirm).await?;
        let from = booking.status;
        booking.status = to;
        if meeting_link.is_some() {
            booking.meeting_link = meeting_link;
        }
        self.commit(booking, from, Action::Confirm, actor, None, None).await
    }

    /// `pending → rejected`. Expert only. Frees the slot.
    pub async fn reject_booking(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_text("reason", reason.as_deref(), MAX_NOTE_LEN)?;
        let (mut booking, to) = self.begin(booking_id, actor, Action::Reject).await?;
        let from = booking.status;
        booking.status = to;
        if reason.is_some() {
            booking.expert_notes = reason.clone();
        }
        self.commit(booking, from, Action::Reject, actor, reason, None).await
    }

    /// `pending | confirmed → cancelled`, by either party. A confirmed booking cannot be
    /// cancelled inside the lead time. Cancelling twice is an illegal transition.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_text("reason", reason.as_deref(), MAX_NOTE_LEN)?;
        let (mut booking, to) = self.begin(booking_id, actor, Action::Cancel).await?;
        let now = self.now();
        self.check_lead_time(&booking, now)?;

        let from = booking.status;
        booking.status = to;
        booking.cancellation_reason = reason.clone();
        booking.cancelled_by = Some(actor);
        booking.cancelled_at = Some(now);
        self.commit(booking, from, Action::Cancel, actor, reason, None).await
    }

    /// Move a live booking to a new start (and optionally a new duration). The booking's
    /// own current slot is ignored by the conflict pass; on any failure nothing changes.
    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        new_start: Ms,
        new_duration_minutes: Option<u32>,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_text("reason", reason.as_deref(), MAX_NOTE_LEN)?;
        let (mut booking, to) = self.begin(booking_id, actor, Action::Reschedule).await?;
        let now = self.now();
        let duration = new_duration_minutes.unwrap_or(booking.duration_minutes);
        let span = validate_slot(new_start, duration, now)?;
        self.check_lead_time(&booking, now)?;

        self.check_expert(booking.expert_id, span, Some(booking.id))
            .await?
            .into_result(OwnerKind::Expert)?;
        self.check_user(booking.user_id, span, Some(booking.id))
            .await?
            .into_result(OwnerKind::User)?;

        let date = calendar::local_date(self.config.timezone, span.start);
        let guard = self
            .locks
            .acquire(booking.expert_id, date)
            .await
            .ok_or(EngineError::Contended)?;

        let result: Result<Booking, EngineError> = async {
            self.check_owner_authoritative(OwnerKind::Expert, booking.expert_id, span, Some(booking.id))
                .await?
                .into_result(OwnerKind::Expert)?;
            self.check_owner_authoritative(OwnerKind::User, booking.user_id, span, Some(booking.id))
                .await?
                .into_result(OwnerKind::User)?;

            let from = booking.status;
            let old_start = booking.start;
            booking.status = to;
            booking.start = span.start;
            booking.duration_minutes = duration;
            self.commit(
                booking,
                from,
                Action::Reschedule,
                actor,
                reason,
                Some((old_start, span.start)),
            )
            .await
        }
        .await;
        self.locks.release(guard).await;
        result
    }

    /// `confirmed → completed`. Expert only, once the appointment has started.
    pub async fn complete_booking(&self, booking_id: Ulid, actor: Ulid) -> Result<Booking, EngineError> {
        let (mut booking, to) = self.begin(booking_id, actor, Action::Complete).await?;
        if self.now() < booking.start {
            return Err(EngineError::TooEarly("appointment has not started"));
        }
        let from = booking.status;
        booking.status = to;
        self.commit(booking, from, Action::Complete, actor, None, None).await
    }

    /// `confirmed → no_show | missed` once the appointment window is over. Reported by
    /// the expert it records the user as absent (`no_show`); reported by the user it
    /// records the expert as absent (`missed`).
    pub async fn report_no_show(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_text("reason", reason.as_deref(), MAX_NOTE_LEN)?;
        let (mut booking, to) = self.begin(booking_id, actor, Action::NoShow).await?;
        if self.now() < booking.end() {
            return Err(EngineError::TooEarly("appointment window has not elapsed"));
        }
        let from = booking.status;
        booking.status = to;
        self.commit(booking, from, Action::NoShow, actor, reason, None).await
    }

    // ── Expert calendar ──────────────────────────────────────

    /// Replace every working-hour rule of an expert.
    pub async fn set_working_hours(
        &self,
        expert_id: Ulid,
        input: Vec<WorkingHoursInput>,
    ) -> Result<Vec<WorkingHourRule>, EngineError> {
        if input.len() > MAX_WORKING_HOUR_RULES {
            return Err(validation(format!(
                "at most {MAX_WORKING_HOUR_RULES} working-hour rules"
            )));
        }
        let mut rules = Vec::with_capacity(input.len());
        for r in input {
            if r.day_of_week > 6 {
                return Err(validation("day_of_week must be 0 (Sunday) to 6 (Saturday)"));
            }
            if r.start_time >= r.end_time {
                return Err(validation("working hours must start before they end"));
            }
            rules.push(WorkingHourRule {
                id: Ulid::new(),
                expert_id,
                day_of_week: r.day_of_week,
                start_time: r.start_time,
                end_time: r.end_time,
                active: r.active,
            });
        }
        rules.sort_by_key(|r| (r.day_of_week, r.start_time));
        self.store_call(self.store.replace_working_hours(expert_id, rules.clone()))
            .await?;
        tracing::info!(expert = %expert_id, rules = rules.len(), "working hours replaced");
        Ok(rules)
    }

    pub async fn add_unavailability(
        &self,
        req: NewUnavailability,
    ) -> Result<UnavailabilityWindow, EngineError> {
        check_timestamp("start", req.start)?;
        check_timestamp("end", req.end)?;
        if req.start >= req.end {
            return Err(validation("unavailability must start before it ends"));
        }
        if let Some(recurrence) = req.recurrence
            && req.end - req.start > recurrence.period_ms() {
                return Err(validation("window is longer than its recurrence period"));
            }
        if let Some(until) = req.until {
            if req.recurrence.is_none() {
                return Err(validation("until requires a recurrence"));
            }
            if until < req.start {
                return Err(validation("until is before start"));
            }
        }
        check_text("reason", req.reason.as_deref(), MAX_NOTE_LEN)?;

        let existing = self
            .store_call(self.store.unavailability(
                req.expert_id,
                Span::new(MIN_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS),
            ))
            .await?;
        if existing.len() >= MAX_UNAVAILABILITY_PER_EXPERT {
            return Err(validation(format!(
                "at most {MAX_UNAVAILABILITY_PER_EXPERT} unavailability windows per expert"
            )));
        }

        let window = UnavailabilityWindow {
            id: Ulid::new(),
            expert_id: req.expert_id,
            start: req.start,
            end: req.end,
            recurrence: req.recurrence,
            until: req.until,
            reason: req.reason,
        };
        self.store_call(self.store.add_unavailability(window.clone()))
            .await?;
        tracing::info!(expert = %window.expert_id, window = %window.id, "unavailability added");
        Ok(window)
    }

    pub async fn remove_unavailability(&self, id: Ulid) -> Result<UnavailabilityWindow, EngineError> {
        let window = self.store_call(self.store.remove_unavailability(id)).await?;
        tracing::info!(expert = %window.expert_id, window = %id, "unavailability removed");
        Ok(window)
    }
}
