use std::fmt;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval test: `[start_a, end_a)` intersects `[start_b, end_b)`.
/// Back-to-back ranges do not overlap.
pub fn overlaps(start_a: Ms, end_a: Ms, start_b: Ms, end_b: Ms) -> bool {
    start_a < end_b && end_a > start_b
}

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

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Closed set of booking states. Only `Pending` and `Confirmed` occupy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
    Completed,
    Missed,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::Missed => "missed",
            BookingStatus::NoShow => "no_show",
        }
    }

    /// Blocking statuses still hold the slot for both owners.
    pub fn is_blocking(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_blocking()
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    Failed,
}

/// How the consultation takes place; decides whether `meeting_link` is a URL or an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingKind {
    Online,
    InPerson,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::Online => "online",
            BookingKind::InPerson => "in_person",
        }
    }
}

/// Which side of a booking a slot belongs to. Each side is conflict-checked on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Expert,
    User,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Expert => "expert",
            OwnerKind::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub expert_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub kind: BookingKind,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub user_notes: Option<String>,
    pub expert_notes: Option<String>,
    pub meeting_link: Option<String>,
    /// Minor currency units; `None` until priced.
    pub fee: Option<u64>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<Ulid>,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    /// Always derived from `start + duration`; never stored.
    pub fn end(&self) -> Ms {
        self.start + self.duration_minutes as Ms * MINUTE_MS
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }

    pub fn owner_id(&self, kind: OwnerKind) -> Ulid {
        match kind {
            OwnerKind::Expert => self.expert_id,
            OwnerKind::User => self.user_id,
        }
    }

    pub fn is_party(&self, actor: Ulid) -> bool {
        actor == self.user_id || actor == self.expert_id
    }
}

/// Cache projection of a booking. Disposable: always rebuildable from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub expert_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub status: BookingStatus,
    pub kind: BookingKind,
}

impl IndexEntry {
    pub fn end(&self) -> Ms {
        self.start + self.duration_minutes as Ms * MINUTE_MS
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }

    pub fn owner_id(&self, kind: OwnerKind) -> Ulid {
        match kind {
            OwnerKind::Expert => self.expert_id,
            OwnerKind::User => self.user_id,
        }
    }
}

impl From<&Booking> for IndexEntry {
    fn from(b: &Booking) -> Self {
        Self {
            booking_id: b.id,
            user_id: b.user_id,
            expert_id: b.expert_id,
            start: b.start,
            duration_minutes: b.duration_minutes,
            status: b.status,
            kind: b.kind,
        }
    }
}

/// Weekly opening window of an expert, in the booking timezone's wall-clock time.
/// Several rules may cover the same weekday (split shifts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHourRule {
    pub id: Ulid,
    pub expert_id: Ulid,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Daily,
    Weekly,
}

impl Recurrence {
    pub fn period_ms(&self) -> Ms {
        match self {
            Recurrence::Daily => DAY_MS,
            Recurrence::Weekly => 7 * DAY_MS,
        }
    }
}

/// Time an expert is away. Only ever subtracts from working hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailabilityWindow {
    pub id: Ulid,
    pub expert_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub recurrence: Option<Recurrence>,
    /// Last instant at which an occurrence may start.
    pub until: Option<Ms>,
    pub reason: Option<String>,
}

impl UnavailabilityWindow {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    /// Expand into the concrete spans that intersect `query`, clamped to it.
    pub fn occurrences(&self, query: &Span) -> Vec<Span> {
        let first = self.span();
        let Some(recurrence) = self.recurrence else {
            if first.overlaps(query) {
                return vec![clamp(&first, query)];
            }
            return Vec::new();
        };

        let period = recurrence.period_ms();
        let len = first.duration_ms();
        let mut k = if query.start > first.end {
            (query.start - first.end) / period
        } else {
            0
        };

        let mut out = Vec::new();
        loop {
            let start = first.start + k * period;
            if start >= query.end || self.until.is_some_and(|u| start > u) {
                break;
            }
            let occ = Span::new(start, start + len);
            if occ.overlaps(query) {
                out.push(clamp(&occ, query));
            }
            k += 1;
        }
        out
    }
}

fn clamp(span: &Span, to: &Span) -> Span {
    Span::new(span.start.max(to.start), span.end.min(to.end))
}

/// One row of the append-only status audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub booking_id: Ulid,
    pub old_status: Option<BookingStatus>,
    pub new_status: BookingStatus,
    pub actor_id: Ulid,
    pub reason: Option<String>,
    pub at: Ms,
    pub rescheduled_from: Option<Ms>,
    pub rescheduled_to: Option<Ms>,
}

/// Payload published to the event bus after every lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_type: String,
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub expert_id: Ulid,
    pub timestamp: Ms,
    pub event_data: serde_json::Value,
}

/// Store mutations, flat, no nesting. This is the journal record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    BookingInserted {
        booking: Booking,
        entry: StatusHistoryEntry,
    },
    BookingUpdated {
        booking: Booking,
        entry: StatusHistoryEntry,
    },
    /// Written only by compaction: a booking together with its full history.
    BookingRestored {
        booking: Booking,
        history: Vec<StatusHistoryEntry>,
    },
    WorkingHoursReplaced {
        expert_id: Ulid,
        rules: Vec<WorkingHourRule>,
    },
    UnavailabilityAdded {
        window: UnavailabilityWindow,
    },
    UnavailabilityRemoved {
        id: Ulid,
        expert_id: Ulid,
    },
}
