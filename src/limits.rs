use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_CAPACITY: u32 = 100_000;
pub const MAX_SEATS_PER_RESERVATION: u32 = 10_000;
/// One week.
pub const MAX_DURATION_MINUTES: u32 = 7 * 24 * 60;

/// Writes per atomic batch. Larger cascades are split into several batches.
pub const MAX_BATCH_WRITES: usize = 500;
/// Values per `In` predicate. Larger id sets are queried in chunks.
pub const MAX_IN_VALUES: usize = 30;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Documents per `list` page.
pub const MAX_LIST_RESULTS: usize = 200;

/// Longest accepted ingress line in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
