use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::slots::{SlotRequest, generate_slots};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.load(id).await
    }

    /// Audit trail of one booking, oldest first.
    pub async fn status_history(&self, booking_id: Ulid) -> Result<Vec<StatusHistoryEntry>, EngineError> {
        self.store_call(self.store.status_history(booking_id)).await
    }

    /// Bookable slots of `slot_minutes` for an expert between two local dates (inclusive).
    /// Reads working hours, unavailability and blocking bookings from the store.
    pub async fn available_slots(
        &self,
        expert_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        slot_minutes: u32,
    ) -> Result<Vec<Span>, EngineError> {
        if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&slot_minutes) {
            return Err(EngineError::Validation(format!(
                "slot length must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES} minutes"
            )));
        }
        if from > to {
            return Err(EngineError::Validation("from is after to".into()));
        }
        if (to - from).num_days() >= MAX_SLOT_QUERY_DAYS {
            return Err(EngineError::Validation(format!(
                "date range longer than {MAX_SLOT_QUERY_DAYS} days"
            )));
        }

        let tz = self.config.timezone;
        let range = Span::new(calendar::day_span(tz, from).start, calendar::day_span(tz, to).end);
        if range.start < MIN_VALID_TIMESTAMP_MS || range.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::Validation("date range out of range".into()));
        }

        let rules = self.store_call(self.store.working_hours(expert_id)).await?;
        let unavailability = self
            .store_call(self.store.unavailability(expert_id, range))
            .await?;
        let busy: Vec<Span> = self
            .store_call(self.store.bookings_for_owner(OwnerKind::Expert, expert_id, range))
            .await?
            .into_iter()
            .filter(|b| b.status.is_blocking())
            .map(|b| b.span())
            .collect();

        let slots = generate_slots(&SlotRequest {
            tz,
            from,
            to,
            slot_minutes,
            now: self.now(),
            rules: &rules,
            unavailability: &unavailability,
            busy: &busy,
        });
        tracing::debug!(expert = %expert_id, %from, %to, slots = slots.len(), "slots generated");
        Ok(slots)
    }

    /// Repopulate one owner's day bucket from the store and drop references the store
    /// no longer considers blocking. Returns how many bookings are indexed.
    pub async fn rebuild_index(
        &self,
        owner: OwnerKind,
        owner_id: Ulid,
        date: NaiveDate,
    ) -> Result<usize, EngineError> {
        let tz = self.config.timezone;
        let day = calendar::day_span(tz, date);
        let live: Vec<Booking> = self
            .store_call(self.store.bookings_for_owner(owner, owner_id, day))
            .await?
            .into_iter()
            .filter(|b| b.status.is_blocking() && calendar::local_date(tz, b.start) == date)
            .collect();
        let live_ids: HashSet<Ulid> = live.iter().map(|b| b.id).collect();

        if let Some(cached) = self.index.list_for_owner_day(owner, owner_id, date).await {
            for stale in cached.iter().filter(|e| !live_ids.contains(&e.booking_id)) {
                self.index.remove(stale.booking_id).await;
            }
        }
        let now = self.now();
        for booking in &live {
            self.index.sync(booking, now).await;
        }

        tracing::info!(
            owner = owner.as_str(),
            %owner_id,
            %date,
            bookings = live.len(),
            "index bucket rebuilt"
        );
        Ok(live.len())
    }
}
