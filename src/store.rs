//! The persistence seam the availability engine reads through.
//!
//! The ledger (`Engine`) is the production implementation; tests swap in
//! fakes. Implementations are passed in explicitly, never reached through a
//! global.

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{BookedStay, BookingStatus};

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Every booking on the property whose status is not in `exclude`.
    /// An unknown property has no bookings.
    async fn list_bookings_for_property(
        &self,
        property_id: Ulid,
        exclude: &[BookingStatus],
    ) -> Result<Vec<BookedStay>, StoreError>;
}
