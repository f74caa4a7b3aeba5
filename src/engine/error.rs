use ulid::Ulid;

use crate::model::BookingStatus;
use crate::store::StoreError;

use super::lifecycle::Action;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input, rejected before any I/O.
    Validation(String),
    ExpertUnavailable { conflicting: Option<Ulid> },
    UserConflict { conflicting: Option<Ulid> },
    /// Reservation lock not obtained in time. Retryable; says nothing about the slot.
    Contended,
    Forbidden { actor: Ulid, booking: Ulid },
    NotFound(Ulid),
    IllegalTransition { from: BookingStatus, action: Action },
    LeadTimeViolation { required_minutes: i64 },
    TooEarly(&'static str),
    Store(String),
    Timeout(&'static str),
}

impl EngineError {
    /// Stable machine-readable code for callers.
    pub fn code(&self) -> String {
        match self {
            EngineError::Validation(_) => "validation".into(),
            EngineError::ExpertUnavailable { .. } => "expert_unavailable".into(),
            EngineError::UserConflict { .. } => "user_conflict".into(),
            EngineError::Contended => "contended".into(),
            EngineError::Forbidden { .. } => "forbidden".into(),
            EngineError::NotFound(_) => "not_found".into(),
            EngineError::IllegalTransition { from, action } => {
                format!("{}_cannot_{}", from.as_str(), action.as_str())
            }
            EngineError::LeadTimeViolation { .. } => "lead_time".into(),
            EngineError::TooEarly(_) => "too_early".into(),
            EngineError::Store(_) => "store_error".into(),
            EngineError::Timeout(_) => "timeout".into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Contended | EngineError::Timeout(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::ExpertUnavailable { conflicting } => match conflicting {
                Some(id) => write!(f, "expert is not available at that time (booking {id})"),
                None => write!(f, "expert is not available at that time"),
            },
            EngineError::UserConflict { conflicting } => match conflicting {
                Some(id) => write!(f, "you already have a booking at that time (booking {id})"),
                None => write!(f, "you already have a booking at that time"),
            },
            EngineError::Contended => {
                write!(f, "slot is being booked by someone else, try again")
            }
            EngineError::Forbidden { actor, booking } => {
                write!(f, "{actor} may not modify booking {booking}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::IllegalTransition { from, action } => {
                write!(f, "cannot {} a {} booking", action.as_str(), from.as_str())
            }
            EngineError::LeadTimeViolation { required_minutes } => write!(
                f,
                "confirmed bookings cannot be changed less than {required_minutes} minutes before start"
            ),
            EngineError::TooEarly(msg) => write!(f, "too early: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
            EngineError::Timeout(what) => write!(f, "timed out waiting for {what}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Exclusion {
                owner: crate::model::OwnerKind::Expert,
                conflicting,
            } => EngineError::ExpertUnavailable {
                conflicting: Some(conflicting),
            },
            StoreError::Exclusion {
                owner: crate::model::OwnerKind::User,
                conflicting,
            } => EngineError::UserConflict {
                conflicting: Some(conflicting),
            },
            // Someone else transitioned the row between our read and write.
            StoreError::StaleWrite(_) => EngineError::Contended,
            other => EngineError::Store(other.to_string()),
        }
    }
}
