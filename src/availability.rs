//! Availability queries for one property: "does this stay collide with an
//! existing booking?" and "which calendar dates are blocked?".
//!
//! Stateless apart from the injected store. Given the same bookings it
//! always answers the same. `has_overlap` is a fast pre-check for callers;
//! the ledger's guarded insert is what actually prevents double bookings.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::{self, EngineError};
use crate::limits::MAX_QUERY_WINDOW_DAYS;
use crate::model::*;
use crate::store::BookingStore;

#[derive(Clone)]
pub struct AvailabilityEngine {
    store: Arc<dyn BookingStore>,
    policy: OccupancyPolicy,
}

impl AvailabilityEngine {
    pub fn new(store: Arc<dyn BookingStore>, policy: OccupancyPolicy) -> Self {
        Self { store, policy }
    }

    /// Occupying bookings only; the store does the status filtering.
    async fn occupied(&self, property_id: Ulid) -> Result<Vec<BookedStay>, EngineError> {
        let exclude = self.policy.excluded_statuses();
        let mut booked = self
            .store
            .list_bookings_for_property(property_id, &exclude)
            .await
            .map_err(|e| EngineError::RetrievalFailed(e.to_string()))?;
        // A store that ignores `exclude` must not leak cancelled stays into the answer.
        booked.retain(|b| self.policy.occupies(b.status));
        Ok(booked)
    }

    pub async fn has_overlap(&self, property_id: Ulid, stay: &Stay) -> Result<bool, EngineError> {
        Ok(self.conflicting_booking(property_id, stay).await?.is_some())
    }

    /// Like `has_overlap`, for dates that have not been validated yet.
    pub async fn has_overlap_dates(
        &self,
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<bool, EngineError> {
        let stay = Stay::checked(check_in, check_out)?;
        self.has_overlap(property_id, &stay).await
    }

    /// The id of an occupying booking that overlaps `stay`, if any.
    pub async fn conflicting_booking(
        &self,
        property_id: Ulid,
        stay: &Stay,
    ) -> Result<Option<Ulid>, EngineError> {
        let occupied = self.occupied(property_id).await?;
        Ok(engine::first_overlap(&occupied, stay))
    }

    /// Every calendar date an occupying booking blocks, ascending and
    /// deduplicated. An unknown property yields the empty set.
    pub async fn blocked_dates(&self, property_id: Ulid) -> Result<BTreeSet<NaiveDate>, EngineError> {
        let occupied = self.occupied(property_id).await?;
        Ok(engine::blocked_dates(occupied.iter().map(|b| &b.stay), &self.policy))
    }

    /// Blocked dates as the JSON array of `YYYY-MM-DD` strings clients expect.
    pub async fn blocked_dates_json(&self, property_id: Ulid) -> Result<String, EngineError> {
        let dates = self.blocked_dates(property_id).await?;
        Ok(dates_to_json(&dates))
    }

    /// Stretches of `window` that nobody occupies, as bookable stays.
    pub async fn free_windows(&self, property_id: Ulid, window: &Stay) -> Result<Vec<Stay>, EngineError> {
        if window.nights() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let occupied = self.occupied(property_id).await?;
        let stays: Vec<Stay> = occupied.iter().map(|b| b.stay).collect();
        Ok(engine::free_windows(window, &stays))
    }
}

pub fn dates_to_json(dates: &BTreeSet<NaiveDate>) -> String {
    let days: Vec<String> = dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect();
    serde_json::Value::from(days).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::store::StoreError;

    /// In-memory store that filters by status the way a database query would.
    #[derive(Default)]
    struct FakeStore {
        bookings: Mutex<HashMap<Ulid, Vec<BookedStay>>>,
    }

    impl FakeStore {
        fn add(&self, property_id: Ulid, check_in: &str, check_out: &str, status: BookingStatus) -> Ulid {
            let id = Ulid::new();
            self.bookings
                .lock()
                .unwrap()
                .entry(property_id)
                .or_default()
                .push(BookedStay {
                    id,
                    stay: stay(check_in, check_out),
                    status,
                });
            id
        }
    }

    #[async_trait]
    impl BookingStore for FakeStore {
        async fn list_bookings_for_property(
            &self,
            property_id: Ulid,
            exclude: &[BookingStatus],
        ) -> Result<Vec<BookedStay>, StoreError> {
            Ok(self
                .bookings
                .lock()
                .unwrap()
                .get(&property_id)
                .map(|v| v.iter().filter(|b| !exclude.contains(&b.status)).copied().collect())
                .unwrap_or_default())
        }
    }

    /// Returns everything regardless of `exclude`.
    struct SloppyStore(Vec<BookedStay>);

    #[async_trait]
    impl BookingStore for SloppyStore {
        async fn list_bookings_for_property(
            &self,
            _property_id: Ulid,
            _exclude: &[BookingStatus],
        ) -> Result<Vec<BookedStay>, StoreError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl BookingStore for BrokenStore {
        async fn list_bookings_for_property(
            &self,
            _property_id: Ulid,
            _exclude: &[BookingStatus],
        ) -> Result<Vec<BookedStay>, StoreError> {
            Err(StoreError::Unavailable("connection reset".into()))
        }
    }

    fn engine_over(store: Arc<FakeStore>) -> AvailabilityEngine {
        AvailabilityEngine::new(store, OccupancyPolicy::default())
    }

    #[tokio::test]
    async fn touching_stays_do_not_overlap() {
        let store = Arc::new(FakeStore::default());
        let pid = Ulid::new();
        store.add(pid, "2025-01-10", "2025-01-15", BookingStatus::Confirmed);
        let avail = engine_over(store);

        assert!(!avail.has_overlap(pid, &stay("2025-01-15", "2025-01-20")).await.unwrap());
        assert!(avail.has_overlap(pid, &stay("2025-01-12", "2025-01-13")).await.unwrap());
    }

    #[tokio::test]
    async fn conflicting_booking_reports_id() {
        let store = Arc::new(FakeStore::default());
        let pid = Ulid::new();
        let existing = store.add(pid, "2025-01-10", "2025-01-15", BookingStatus::Pending);
        let avail = engine_over(store);

        let hit = avail
            .conflicting_booking(pid, &stay("2025-01-14", "2025-01-16"))
            .await
            .unwrap();
        assert_eq!(hit, Some(existing));
    }

    #[tokio::test]
    async fn blocked_dates_dedup_turnover_day() {
        let store = Arc::new(FakeStore::default());
        let pid = Ulid::new();
        store.add(pid, "2025-01-10", "2025-01-12", BookingStatus::Confirmed);
        store.add(pid, "2025-01-12", "2025-01-14", BookingStatus::Pending);
        let avail = engine_over(store);

        let blocked = avail.blocked_dates(pid).await.unwrap();
        let expected: BTreeSet<_> = ["2025-01-10", "2025-01-11", "2025-01-12", "2025-01-13", "2025-01-14"]
            .iter()
            .map(|d| day(d))
            .collect();
        assert_eq!(blocked, expected);
    }

    #[tokio::test]
    async fn blocked_dates_json_format() {
        let store = Arc::new(FakeStore::default());
        let pid = Ulid::new();
        store.add(pid, "2025-02-27", "2025-03-01", BookingStatus::Confirmed);
        let avail = engine_over(store);

        let json = avail.blocked_dates_json(pid).await.unwrap();
        assert_eq!(json, r#"["2025-02-27","2025-02-28","2025-03-01"]"#);
    }

    #[tokio::test]
    async fn unknown_property_is_empty() {
        let avail = engine_over(Arc::new(FakeStore::default()));
        let pid = Ulid::new();
        assert!(avail.blocked_dates(pid).await.unwrap().is_empty());
        assert_eq!(avail.blocked_dates_json(pid).await.unwrap(), "[]");
        assert!(!avail.has_overlap(pid, &stay("2025-01-01", "2025-01-05")).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_bookings_never_block() {
        let store = Arc::new(FakeStore::default());
        let pid = Ulid::new();
        store.add(pid, "2025-01-10", "2025-01-15", BookingStatus::Cancelled);
        let avail = engine_over(store);

        assert!(!avail.has_overlap(pid, &stay("2025-01-11", "2025-01-12")).await.unwrap());
        assert!(avail.blocked_dates(pid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_filtered_even_if_store_ignores_exclude() {
        let store = Arc::new(SloppyStore(vec![BookedStay {
            id: Ulid::new(),
            stay: stay("2025-01-10", "2025-01-15"),
            status: BookingStatus::Cancelled,
        }]));
        let avail = AvailabilityEngine::new(store, OccupancyPolicy::default());
        assert!(avail.blocked_dates(Ulid::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_ignored_under_lenient_policy() {
        let store = Arc::new(FakeStore::default());
        let pid = Ulid::new();
        store.add(pid, "2025-01-10", "2025-01-12", BookingStatus::Pending);
        store.add(pid, "2025-01-20", "2025-01-21", BookingStatus::Confirmed);
        let policy = OccupancyPolicy {
            pending_blocks: false,
            checkout_day_blocked: false,
        };
        let avail = AvailabilityEngine::new(store, policy);

        assert!(!avail.has_overlap(pid, &stay("2025-01-10", "2025-01-12")).await.unwrap());
        let blocked: Vec<_> = avail.blocked_dates(pid).await.unwrap().into_iter().collect();
        assert_eq!(blocked, vec![day("2025-01-20")]);
    }

    #[tokio::test]
    async fn invalid_interval_rejected_not_fixed() {
        let avail = engine_over(Arc::new(FakeStore::default()));
        let result = avail
            .has_overlap_dates(Ulid::new(), day("2025-01-15"), day("2025-01-10"))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidInterval { .. })));
        let result = avail
            .has_overlap_dates(Ulid::new(), day("2025-01-15"), day("2025-01-15"))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidInterval { .. })));
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let avail = AvailabilityEngine::new(Arc::new(BrokenStore), OccupancyPolicy::default());
        let pid = Ulid::new();

        match avail.has_overlap(pid, &stay("2025-01-01", "2025-01-02")).await {
            Err(EngineError::RetrievalFailed(msg)) => assert!(msg.contains("connection reset")),
            other => panic!("expected RetrievalFailed, got {other:?}"),
        }
        assert!(matches!(
            avail.blocked_dates(pid).await,
            Err(EngineError::RetrievalFailed(_))
        ));
    }

    #[tokio::test]
    async fn free_windows_between_bookings() {
        let store = Arc::new(FakeStore::default());
        let pid = Ulid::new();
        store.add(pid, "2025-08-05", "2025-08-10", BookingStatus::Confirmed);
        store.add(pid, "2025-08-12", "2025-08-15", BookingStatus::Cancelled);
        let avail = engine_over(store);

        let free = avail
            .free_windows(pid, &stay("2025-08-01", "2025-08-20"))
            .await
            .unwrap();
        assert_eq!(
            free,
            vec![stay("2025-08-01", "2025-08-05"), stay("2025-08-10", "2025-08-20")]
        );
    }

    #[tokio::test]
    async fn free_windows_limit() {
        let avail = engine_over(Arc::new(FakeStore::default()));
        let result = avail
            .free_windows(Ulid::new(), &stay("2020-01-01", "2030-01-01"))
            .await;
        assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    }
}
