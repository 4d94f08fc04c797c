use chrono::NaiveDate;

pub const MAX_PROPERTIES: usize = 100_000;
pub const MAX_BOOKINGS_PER_PROPERTY: usize = 50_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_GUESTS: u32 = 64;
pub const MAX_BATCH_SIZE: usize = 1_000;

/// Longest single stay, in nights.
pub const MAX_STAY_NIGHTS: i64 = 365;
/// Widest availability search window, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3 * 366;

/// Earliest check-in the ledger accepts.
pub fn min_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Latest check-out the ledger accepts.
pub fn max_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2200, 1, 1).unwrap_or(NaiveDate::MAX)
}
