mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod slots;

pub use conflict::{Source, Verdict};
pub use error::EngineError;
pub use lifecycle::{Action, Party};
pub use mutations::{NewBooking, NewUnavailability, WorkingHoursInput};
pub use slots::{SlotRequest, generate_slots, merge_overlapping, subtract_intervals};

use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::cache::CacheClient;
use crate::calendar;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::index::AvailabilityIndex;
use crate::lock::ReservationLocks;
use crate::model::*;
use crate::notify::{Outbound, Outbox};
use crate::store::{BookingStore, StoreError};

/// The availability and booking conflict engine. Every collaborator is injected; the
/// engine itself holds no booking state.
pub struct Engine {
    pub(super) store: Arc<dyn BookingStore>,
    pub(super) index: AvailabilityIndex,
    pub(super) locks: ReservationLocks,
    pub(super) outbox: Outbox,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn BookingStore>,
        cache: Arc<dyn CacheClient>,
        outbox: Outbox,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let index = AvailabilityIndex::new(
            cache.clone(),
            config.timezone,
            config.index_ttl_margin,
            config.cache_timeout,
        );
        let locks = ReservationLocks::new(cache, config.lock.clone());
        Self {
            store,
            index,
            locks,
            outbox,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Run one store call under the store timeout.
    pub(super) async fn store_call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(EngineError::Timeout("store")),
        }
    }

    pub(super) async fn load(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store_call(self.store.get_booking(id))
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Queue the lifecycle event and a realtime notice for the counterparty of `actor`.
    pub(super) fn emit(
        &self,
        action: Action,
        booking: &Booking,
        actor: Ulid,
        data: serde_json::Value,
    ) {
        info!(
            action = action.as_str(),
            booking = %booking.id,
            status = %booking.status,
            %actor,
            "booking transition"
        );

        self.outbox.enqueue(Outbound::Event(LifecycleEvent {
            event_type: action.event_type().to_string(),
            booking_id: booking.id,
            user_id: booking.user_id,
            expert_id: booking.expert_id,
            timestamp: self.now(),
            event_data: data,
        }));

        let recipient = if actor == booking.expert_id {
            booking.user_id
        } else {
            booking.expert_id
        };
        let when = calendar::format_local(self.config.timezone, booking.start);
        let message = match action {
            Action::Create => format!("New booking request for {when}"),
            Action::Confirm => format!("Your booking on {when} was confirmed"),
            Action::Reject => format!("Your booking request for {when} was declined"),
            Action::Cancel => format!("The booking on {when} was cancelled"),
            Action::Reschedule => format!("A booking was moved to {when}"),
            Action::Complete => format!("The consultation on {when} is complete"),
            Action::NoShow => format!("The booking on {when} was marked as {}", booking.status),
        };
        self.outbox.enqueue(Outbound::Push {
            owner_id: recipient,
            message,
        });
    }
}
