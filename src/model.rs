use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Minor currency units (cents). The only money type.
pub type Money = i64;

/// Half-open stay `[check_in, check_out)` measured in calendar days.
///
/// A guest sleeps the nights of `check_in ..= check_out - 1`; `check_out` is
/// the morning they leave. No time-of-day is ever attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl Stay {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "Stay check_in must be before check_out");
        Self { check_in, check_out }
    }

    /// Build a stay from untrusted dates. Never swaps or clamps.
    pub fn checked(check_in: NaiveDate, check_out: NaiveDate) -> Result<Self, EngineError> {
        if check_in >= check_out {
            return Err(EngineError::InvalidInterval { check_in, check_out });
        }
        Ok(Self { check_in, check_out })
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    /// `[a1,a2)` and `[b1,b2)` overlap iff `a1 < b2 && b1 < a2`.
    pub fn overlaps(&self, other: &Stay) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }
}

impl fmt::Display for Stay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

/// Walk calendar days one at a time with `succ_opt`, so month ends and leap
/// days never skew the sequence.
fn days_between(start: NaiveDate, end: NaiveDate, include_end: bool) -> impl Iterator<Item = NaiveDate> {
    std::iter::successors(Some(start), |d| d.succ_opt())
        .take_while(move |d| if include_end { *d <= end } else { *d < end })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 3] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Allowed lifecycle moves: pending → confirmed | cancelled, confirmed → cancelled.
    pub fn can_become(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which bookings occupy a property's calendar, and how blocked dates are drawn.
///
/// Cancelled bookings never occupy. Overlap checks are always half-open;
/// `checkout_day_blocked` only affects the enumerated blocked-date set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyPolicy {
    pub pending_blocks: bool,
    pub checkout_day_blocked: bool,
}

impl Default for OccupancyPolicy {
    fn default() -> Self {
        Self {
            pending_blocks: true,
            checkout_day_blocked: true,
        }
    }
}

impl OccupancyPolicy {
    pub fn occupies(&self, status: BookingStatus) -> bool {
        match status {
            BookingStatus::Confirmed => true,
            BookingStatus::Pending => self.pending_blocks,
            BookingStatus::Cancelled => false,
        }
    }

    /// Statuses a booking store should filter out before handing bookings over.
    pub fn excluded_statuses(&self) -> Vec<BookingStatus> {
        BookingStatus::ALL
            .into_iter()
            .filter(|s| !self.occupies(*s))
            .collect()
    }

    pub fn blocked_dates(&self, stay: &Stay) -> impl Iterator<Item = NaiveDate> {
        days_between(stay.check_in, stay.check_out, self.checkout_day_blocked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub guest_id: Ulid,
    pub stay: Stay,
    pub guests: u32,
    pub total_price: Money,
    pub status: BookingStatus,
}

#[derive(Debug, Clone)]
pub struct PropertyState {
    pub id: Ulid,
    pub host_id: Ulid,
    pub name: Option<String>,
    pub nightly_rate: Money,
    pub max_guests: u32,
    /// All bookings ever recorded (cancelled included), sorted by `stay.check_in`.
    pub bookings: Vec<Booking>,
}

impl PropertyState {
    pub fn new(id: Ulid, host_id: Ulid, name: Option<String>, nightly_rate: Money, max_guests: u32) -> Self {
        Self {
            id,
            host_id,
            name,
            nightly_rate,
            max_guests,
            bookings: Vec::new(),
        }
    }

    pub fn price_for(&self, stay: &Stay) -> Money {
        self.nightly_rate.saturating_mul(stay.nights())
    }

    /// Insert booking maintaining sort order by check-in.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.stay.check_in, |b| b.stay.check_in)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Return only bookings whose stay overlaps the query, whatever their status.
    /// Uses binary search to skip bookings checking in at or after `query.check_out`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.check_in < query.check_out);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.check_out > query.check_in)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PropertyListed {
        id: Ulid,
        host_id: Ulid,
        name: Option<String>,
        nightly_rate: Money,
        max_guests: u32,
    },
    PropertyUpdated {
        id: Ulid,
        name: Option<String>,
        nightly_rate: Money,
        max_guests: u32,
    },
    PropertyDelisted {
        id: Ulid,
    },
    BookingRecorded {
        id: Ulid,
        property_id: Ulid,
        guest_id: Ulid,
        stay: Stay,
        guests: u32,
        total_price: Money,
        status: BookingStatus,
    },
    BookingStatusChanged {
        id: Ulid,
        property_id: Ulid,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: Ulid,
        property_id: Ulid,
        stay: Stay,
        total_price: Money,
    },
    BookingPurged {
        id: Ulid,
        property_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: Ulid,
    pub host_id: Ulid,
    pub name: Option<String>,
    pub nightly_rate: Money,
    pub max_guests: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub property_id: Ulid,
    pub guest_id: Ulid,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
    pub total_price: Money,
    pub status: BookingStatus,
}

impl BookingInfo {
    pub fn from_booking(property_id: Ulid, b: &Booking) -> Self {
        Self {
            id: b.id,
            property_id,
            guest_id: b.guest_id,
            check_in: b.stay.check_in,
            check_out: b.stay.check_out,
            guests: b.guests,
            total_price: b.total_price,
            status: b.status,
        }
    }
}

/// What a booking store hands to the availability engine: dates and status only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookedStay {
    pub id: Ulid,
    pub stay: Stay,
    pub status: BookingStatus,
}

#[cfg(test)]
pub(crate) fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

#[cfg(test)]
pub(crate) fn stay(check_in: &str, check_out: &str) -> Stay {
    Stay::new(day(check_in), day(check_out))
}
