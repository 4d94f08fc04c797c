use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_batch_disjoint, check_no_conflict, validate_guests, validate_stay};
use super::{apply_to_property, Engine, EngineError, WalCommand};

/// One row of a booking request, as the guest submits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub property_id: Ulid,
    pub guest_id: Ulid,
    pub stay: Stay,
    pub guests: u32,
}

fn validate_listing(name: &Option<String>, nightly_rate: Money, max_guests: u32) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("property name too long"));
        }
    if nightly_rate <= 0 {
        return Err(EngineError::InvalidInput("nightly_rate must be positive"));
    }
    if max_guests == 0 {
        return Err(EngineError::InvalidInput("max_guests must be at least 1"));
    }
    if max_guests > MAX_GUESTS {
        return Err(EngineError::LimitExceeded("max_guests too large"));
    }
    Ok(())
}

impl Engine {
    pub async fn list_property(
        &self,
        id: Ulid,
        host_id: Ulid,
        name: Option<String>,
        nightly_rate: Money,
        max_guests: u32,
    ) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        if self.state.len() >= MAX_PROPERTIES {
            return Err(EngineError::LimitExceeded("too many properties"));
        }
        validate_listing(&name, nightly_rate, max_guests)?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::PropertyListed {
            id,
            host_id,
            name: name.clone(),
            nightly_rate,
            max_guests,
        };
        self.wal_append(&event).await?;
        let ps = PropertyState::new(id, host_id, name, nightly_rate, max_guests);
        self.state.insert(id, Arc::new(RwLock::new(ps)));
        tracing::debug!("listed property {id} for host {host_id}");
        Ok(())
    }

    pub async fn update_property(
        &self,
        id: Ulid,
        name: Option<String>,
        nightly_rate: Money,
        max_guests: u32,
    ) -> Result<(), EngineError> {
        validate_listing(&name, nightly_rate, max_guests)?;
        let _gate = self.write_gate.read().await;
        let mut guard = self.lock_property(id).await?;
        let event = Event::PropertyUpdated {
            id,
            name,
            nightly_rate,
            max_guests,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove a listing. Refused while a non-cancelled booking has not yet checked out.
    pub async fn delist_property(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let guard = self.lock_property(id).await?;
        let today = chrono::Utc::now().date_naive();
        if guard
            .bookings
            .iter()
            .any(|b| b.status != BookingStatus::Cancelled && b.stay.check_out > today)
        {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::PropertyDelisted { id };
        self.wal_append(&event).await?;
        for b in &guard.bookings {
            self.booking_to_property.remove(&b.id);
        }
        self.state.remove(&id);
        tracing::debug!("delisted property {id}");
        Ok(())
    }

    /// The guarded insert: overlap check and write happen under one property
    /// write lock, so two racing requests for overlapping stays can never both win.
    /// New bookings start out pending.
    pub async fn request_booking(&self, req: BookingRequest) -> Result<BookingInfo, EngineError> {
        validate_stay(&req.stay)?;
        if self.booking_to_property.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let _gate = self.write_gate.read().await;
        let mut guard = self.lock_property(req.property_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many bookings on property"));
        }
        validate_guests(&guard, req.guests)?;
        check_no_conflict(&guard, &req.stay, &self.policy, None)?;

        let event = recorded_event(&guard, &req);
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard
            .booking(req.id)
            .ok_or(EngineError::NotFound(req.id))?;
        Ok(BookingInfo::from_booking(req.property_id, booking))
    }

    /// Atomically request several stays. All-or-nothing: if any one conflicts,
    /// or the WAL write fails, none are recorded. Requests may span different
    /// properties.
    pub async fn batch_request_bookings(
        &self,
        requests: Vec<BookingRequest>,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut seen = HashSet::with_capacity(requests.len());
        let mut rows_per_property: HashMap<Ulid, usize> = HashMap::new();
        for req in &requests {
            validate_stay(&req.stay)?;
            if !seen.insert(req.id) || self.booking_to_property.contains_key(&req.id) {
                return Err(EngineError::AlreadyExists(req.id));
            }
            *rows_per_property.entry(req.property_id).or_default() += 1;
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut property_ids: Vec<Ulid> = rows_per_property.keys().copied().collect();
        property_ids.sort();

        let _gate = self.write_gate.read().await;
        let mut guards = Vec::with_capacity(property_ids.len());
        let mut slot = HashMap::new();
        for pid in &property_ids {
            let guard = self.lock_property(*pid).await?;
            if guard.bookings.len() + rows_per_property[pid] > MAX_BOOKINGS_PER_PROPERTY {
                return Err(EngineError::LimitExceeded("too many bookings on property"));
            }
            slot.insert(*pid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate against current state and within the batch.
        let mut by_property: HashMap<Ulid, Vec<(Ulid, Stay)>> = HashMap::new();
        for req in &requests {
            let guard = &guards[slot[&req.property_id]];
            validate_guests(guard, req.guests)?;
            check_no_conflict(guard, &req.stay, &self.policy, None)?;
            by_property
                .entry(req.property_id)
                .or_default()
                .push((req.id, req.stay));
        }
        for batch in by_property.values() {
            check_batch_disjoint(batch)?;
        }

        // Phase 2: all validated. One WAL unit for the whole batch; nothing
        // is applied unless every event is durable.
        let events: Vec<Event> = requests
            .iter()
            .map(|req| recorded_event(&guards[slot[&req.property_id]], req))
            .collect();
        self.wal_append_all(events.clone()).await?;

        let mut created = Vec::with_capacity(requests.len());
        for (req, event) in requests.iter().zip(&events) {
            let guard = &mut guards[slot[&req.property_id]];
            apply_to_property(guard, event, &self.booking_to_property);
            if let Some(b) = guard.booking(req.id) {
                created.push(BookingInfo::from_booking(req.property_id, b));
            }
        }
        Ok(created)
    }

    /// Host accepts a pending booking. Re-checked for overlap, since pending
    /// bookings may not have been occupying under the active policy.
    pub async fn confirm_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        self.transition(id, BookingStatus::Confirmed, None).await
    }

    /// Host declines a pending booking.
    pub async fn reject_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        self.transition(id, BookingStatus::Cancelled, Some(BookingStatus::Pending))
            .await
    }

    /// Soft cancel: the booking is kept with status `cancelled` and stops
    /// occupying its dates.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        self.transition(id, BookingStatus::Cancelled, None).await
    }

    async fn transition(
        &self,
        id: Ulid,
        to: BookingStatus,
        only_from: Option<BookingStatus>,
    ) -> Result<BookingInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        let (property_id, mut guard) = self.resolve_booking_write(&id).await?;
        let (from, stay) = guard
            .booking(id)
            .map(|b| (b.status, b.stay))
            .ok_or(EngineError::NotFound(id))?;
        if !from.can_become(to) || only_from.is_some_and(|s| s != from) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }
        if self.policy.occupies(to) {
            check_no_conflict(&guard, &stay, &self.policy, Some(id))?;
        }

        let event = Event::BookingStatusChanged {
            id,
            property_id,
            status: to,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!("booking {id}: {from} -> {to}");
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        Ok(BookingInfo::from_booking(property_id, booking))
    }

    /// Amend the dates of a live booking. The old dates are released in the
    /// same step; the price is recomputed at the current nightly rate.
    pub async fn reschedule_booking(&self, id: Ulid, stay: Stay) -> Result<BookingInfo, EngineError> {
        validate_stay(&stay)?;
        let _gate = self.write_gate.read().await;
        let (property_id, mut guard) = self.resolve_booking_write(&id).await?;
        let status = guard
            .booking(id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        if status == BookingStatus::Cancelled {
            return Err(EngineError::InvalidInput("cannot reschedule a cancelled booking"));
        }
        check_no_conflict(&guard, &stay, &self.policy, Some(id))?;

        let event = Event::BookingRescheduled {
            id,
            property_id,
            stay,
            total_price: guard.price_for(&stay),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        Ok(BookingInfo::from_booking(property_id, booking))
    }

    /// Hard delete: the booking record is gone, not just cancelled.
    pub async fn purge_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.write_gate.read().await;
        let (property_id, mut guard) = self.resolve_booking_write(&id).await?;
        let event = Event::BookingPurged { id, property_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(property_id)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds the write gate exclusively from snapshot to file swap: every
    /// event already in the old log is applied in memory, and no new event
    /// can land in the old log before it is replaced.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();
        let properties: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for ps in properties {
            let guard = ps.read().await;
            events.push(Event::PropertyListed {
                id: guard.id,
                host_id: guard.host_id,
                name: guard.name.clone(),
                nightly_rate: guard.nightly_rate,
                max_guests: guard.max_guests,
            });
            for b in &guard.bookings {
                events.push(Event::BookingRecorded {
                    id: b.id,
                    property_id: guard.id,
                    guest_id: b.guest_id,
                    stay: b.stay,
                    guests: b.guests,
                    total_price: b.total_price,
                    status: b.status,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn recorded_event(ps: &PropertyState, req: &BookingRequest) -> Event {
    Event::BookingRecorded {
        id: req.id,
        property_id: req.property_id,
        guest_id: req.guest_id,
        stay: req.stay,
        guests: req.guests,
        total_price: ps.price_for(&req.stay),
        status: BookingStatus::Pending,
    }
}
