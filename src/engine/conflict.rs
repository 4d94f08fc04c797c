use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_stay(stay: &Stay) -> Result<(), EngineError> {
    if stay.check_in < min_valid_date() || stay.check_out > max_valid_date() {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(crate) fn validate_guests(ps: &PropertyState, guests: u32) -> Result<(), EngineError> {
    if guests == 0 {
        return Err(EngineError::InvalidInput("a booking needs at least one guest"));
    }
    if guests > ps.max_guests {
        return Err(EngineError::TooManyGuests {
            requested: guests,
            max: ps.max_guests,
        });
    }
    Ok(())
}

/// Reject `stay` if it overlaps any occupying booking on the property.
/// `ignore` skips the booking being amended or confirmed.
pub(crate) fn check_no_conflict(
    ps: &PropertyState,
    stay: &Stay,
    policy: &OccupancyPolicy,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    for booking in ps.overlapping(stay) {
        if Some(booking.id) == ignore || !policy.occupies(booking.status) {
            continue;
        }
        return Err(EngineError::Conflict(booking.id));
    }
    Ok(())
}

/// Pairwise check of stays requested together for one property.
pub(crate) fn check_batch_disjoint(batch: &[(Ulid, Stay)]) -> Result<(), EngineError> {
    for i in 0..batch.len() {
        for j in (i + 1)..batch.len() {
            if batch[i].1.overlaps(&batch[j].1) {
                return Err(EngineError::Conflict(batch[i].0));
            }
        }
    }
    Ok(())
}
