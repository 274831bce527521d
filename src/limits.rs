//! Hard limits on hall size and request shape.

pub const MAX_HALLS: usize = 1024;
pub const MAX_HALL_NAME_LEN: usize = 128;

pub const MAX_ACCOUNTS_PER_HALL: usize = 100_000;
pub const MAX_ROOMS_PER_HALL: usize = 50_000;
pub const MAX_ROOM_CAPACITY: u32 = 64;

/// Names, emails, room numbers, identity numbers.
pub const MAX_NAME_LEN: usize = 256;
/// Descriptions, notes, comments, reasons.
pub const MAX_TEXT_LEN: usize = 4096;

pub const MAX_PASSES_PER_REQUESTER: usize = 1_000;
pub const MAX_PASS_DAYS: i64 = 31;

pub const MAX_TICKETS_PER_HALL: usize = 500_000;

pub const MAX_ATTACHMENT_BYTES: usize = 8 * 1024 * 1024;

pub const MAX_BLACKLIST_ENTRIES: usize = 100_000;
