use crate::model::{DAY_MS, Ms};

pub const MIN_DURATION_MINUTES: u32 = 15;
pub const MAX_DURATION_MINUTES: u32 = 240;

/// Longest booking in ms; bounds how far back a conflicting booking can start.
pub const MAX_DURATION_MS: Ms = MAX_DURATION_MINUTES as Ms * 60_000;

pub const MAX_SLOT_QUERY_DAYS: i64 = 62;
pub const MAX_SLOT_QUERY_MS: Ms = MAX_SLOT_QUERY_DAYS * DAY_MS;

pub const MAX_NOTE_LEN: usize = 2000;
pub const MAX_LINK_LEN: usize = 2000;
pub const MAX_WORKING_HOUR_RULES: usize = 32;
pub const MAX_UNAVAILABILITY_PER_EXPERT: usize = 1000;

/// Timestamps outside [2000-01-01, 2100-01-01) are rejected as malformed.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_LINE_LEN: usize = 64 * 1024;
