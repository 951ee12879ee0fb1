use crate::model::{Ms, HOUR_MS, MINUTE_MS};

/// Longest window a single hold may pin.
pub const MAX_HOLD_DURATION_MS: Ms = 8 * HOUR_MS;

/// Longest a hold may stay active before the reaper takes it.
pub const MAX_HOLD_TTL_MS: Ms = 2 * HOUR_MS;

/// Shortest hold lifetime a policy may ask for.
pub const MIN_HOLD_TTL_MS: Ms = MINUTE_MS;

/// Longest single booking.
pub const MAX_BOOKING_DURATION_MS: Ms = 24 * HOUR_MS;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000; // 2100-01-01

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
pub const MAX_CONTACT_LEN: usize = 320;
pub const MAX_SESSION_ID_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 1024;

/// Upper bound on rows one sweep pass will touch.
pub const MAX_SWEEP_BATCH: usize = 10_000;
