use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Booking, BookingStatus};

use super::EngineError;

/// Named operations that move a booking through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Confirm,
    Reject,
    Cancel,
    Reschedule,
    Complete,
    NoShow,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Confirm => "confirm",
            Action::Reject => "reject",
            Action::Cancel => "cancel",
            Action::Reschedule => "reschedule",
            Action::Complete => "complete",
            Action::NoShow => "no_show",
        }
    }

    /// Event type published to downstream consumers.
    pub fn event_type(&self) -> &'static str {
        match self {
            Action::Create => "booking.created",
            Action::Confirm => "booking.confirmed",
            Action::Reject => "booking.rejected",
            Action::Cancel => "booking.cancelled",
            Action::Reschedule => "booking.rescheduled",
            Action::Complete => "booking.completed",
            Action::NoShow => "booking.no_show",
        }
    }

    fn permits(&self, party: Party) -> bool {
        match self {
            Action::Create => party == Party::User,
            Action::Confirm | Action::Reject | Action::Complete => party == Party::Expert,
            Action::Cancel | Action::Reschedule | Action::NoShow => true,
        }
    }
}

/// Which side of the booking the acting identity is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    User,
    Expert,
}

impl Party {
    pub fn of(booking: &Booking, actor: Ulid) -> Option<Party> {
        if actor == booking.expert_id {
            Some(Party::Expert)
        } else if actor == booking.user_id {
            Some(Party::User)
        } else {
            None
        }
    }
}

/// Authorization: the actor must be a party to the booking and the action must be one
/// that party may take.
pub fn authorize(booking: &Booking, actor: Ulid, action: Action) -> Result<Party, EngineError> {
    match Party::of(booking, actor) {
        Some(party) if action.permits(party) => Ok(party),
        _ => Err(EngineError::Forbidden {
            actor,
            booking: booking.id,
        }),
    }
}

/// The status `action` moves a booking to from `from`.
///
/// ```text
/// pending   → confirmed | rejected | cancelled
/// confirmed → completed | cancelled | missed | no_show
/// ```
///
/// Reschedule keeps the status. Nothing ever re-enters `pending`.
pub fn next_status(
    from: BookingStatus,
    action: Action,
    party: Party,
) -> Result<BookingStatus, EngineError> {
    use BookingStatus::*;
    let to = match (from, action) {
        (Pending, Action::Confirm) => Confirmed,
        (Pending, Action::Reject) => Rejected,
        (Pending | Confirmed, Action::Cancel) => Cancelled,
        (Pending | Confirmed, Action::Reschedule) => from,
        (Confirmed, Action::Complete) => Completed,
        // The reporter is the one who showed up: an expert reports the user absent,
        // a user reports the expert absent.
        (Confirmed, Action::NoShow) => match party {
            Party::Expert => NoShow,
            Party::User => Missed,
        },
        _ => return Err(EngineError::IllegalTransition { from, action }),
    };
    Ok(to)
}
