mod conflict;
mod error;
mod mutations;
mod occupancy;
mod queries;

pub use error::EngineError;
pub use mutations::BookingRequest;
pub use occupancy::{blocked_dates, first_overlap, free_windows, merge_overlapping, subtract_stays};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One caller's events, made durable together or not at all.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it (the batch window).
/// 3. One flush_sync for the whole batch, then answer every sender.
///
/// A non-append command ends the batch early; the batch is flushed first.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (events, response) = match cmd {
            WalCommand::Append { events, response } => (events, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch: Vec<PendingAppend> = vec![(events, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let event_count: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(event_count as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {event_count} events: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .flat_map(|(events, _)| events)
        .try_for_each(|event| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch; the callers of this batch are all told it failed.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking ledger: every property's bookings in memory, one lock per
/// property, all changes made durable through the WAL before they apply.
pub struct Engine {
    pub state: DashMap<Ulid, SharedPropertyState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → property id
    pub(super) booking_to_property: DashMap<Ulid, Ulid>,
    pub(super) policy: OccupancyPolicy,
    /// Shared by every mutation for its whole duration; compaction takes it
    /// exclusively so its snapshot and the log it replaces agree.
    pub(super) write_gate: RwLock<()>,
}

/// Apply an event directly to a PropertyState (caller holds the lock).
fn apply_to_property(ps: &mut PropertyState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingRecorded {
            id,
            property_id,
            guest_id,
            stay,
            guests,
            total_price,
            status,
        } => {
            ps.insert_booking(Booking {
                id: *id,
                guest_id: *guest_id,
                stay: *stay,
                guests: *guests,
                total_price: *total_price,
                status: *status,
            });
            index.insert(*id, *property_id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = ps.bookings.iter_mut().find(|b| b.id == *id) {
                b.status = *status;
            }
        }
        Event::BookingRescheduled {
            id,
            stay,
            total_price,
            ..
        } => {
            // Re-insert to keep the check-in ordering.
            if let Some(mut b) = ps.remove_booking(*id) {
                b.stay = *stay;
                b.total_price = *total_price;
                ps.insert_booking(b);
            }
        }
        Event::BookingPurged { id, .. } => {
            ps.remove_booking(*id);
            index.remove(id);
        }
        Event::PropertyUpdated {
            name,
            nightly_rate,
            max_guests,
            ..
        } => {
            ps.name = name.clone();
            ps.nightly_rate = *nightly_rate;
            ps.max_guests = *max_guests;
        }
        // Listed/Delisted are handled at the DashMap level, not here
        Event::PropertyListed { .. } | Event::PropertyDelisted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: OccupancyPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            booking_to_property: DashMap::new(),
            policy,
            write_gate: RwLock::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never use blocking_write here: this runs inside a runtime.
        for event in &events {
            match event {
                Event::PropertyListed {
                    id,
                    host_id,
                    name,
                    nightly_rate,
                    max_guests,
                } => {
                    let ps = PropertyState::new(*id, *host_id, name.clone(), *nightly_rate, *max_guests);
                    engine.state.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::PropertyDelisted { id } => {
                    if let Some((_, ps)) = engine.state.remove(id)
                        && let Ok(guard) = ps.try_read()
                    {
                        for b in &guard.bookings {
                            engine.booking_to_property.remove(&b.id);
                        }
                    }
                }
                other => {
                    if let Some(property_id) = event_property_id(other)
                        && let Some(entry) = engine.state.get(&property_id)
                    {
                        let ps = entry.clone();
                        let Ok(mut guard) = ps.try_write() else {
                            return Err(io::Error::other("replay: property lock contended"));
                        };
                        apply_to_property(&mut guard, other, &engine.booking_to_property);
                    }
                }
            }
        }

        tracing::info!(
            "replayed {} events: {} properties, {} bookings",
            events.len(),
            engine.state.len(),
            engine.booking_to_property.len()
        );
        Ok(engine)
    }

    pub fn policy(&self) -> &OccupancyPolicy {
        &self.policy
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    /// Write several events as one unit: all of them are flushed by the same
    /// fsync, and the caller hears back once for the lot.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_property(&self, id: &Ulid) -> Option<SharedPropertyState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_property_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_property.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append then apply, under a lock the caller already holds.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut PropertyState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_property(ps, event, &self.booking_to_property);
        Ok(())
    }

    /// Lookup booking → property, acquire the property's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<PropertyState>), EngineError> {
        let property_id = self
            .get_property_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = self.lock_property(property_id).await?;
        Ok((property_id, guard))
    }

    /// Acquire a property's write lock, failing with `NotFound` if the
    /// property was delisted while this caller waited for the lock.
    pub(super) async fn lock_property(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<PropertyState>, EngineError> {
        let ps = self.get_property(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ps.clone().write_owned().await;
        match self.state.get(&id) {
            Some(current) if Arc::ptr_eq(current.value(), &ps) => Ok(guard),
            _ => Err(EngineError::NotFound(id)),
        }
    }
}

/// Extract the property id from an event (for non-Listed/Delisted events).
fn event_property_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingRecorded { property_id, .. }
        | Event::BookingStatusChanged { property_id, .. }
        | Event::BookingRescheduled { property_id, .. }
        | Event::BookingPurged { property_id, .. } => Some(*property_id),
        Event::PropertyUpdated { id, .. } => Some(*id),
        Event::PropertyListed { .. } | Event::PropertyDelisted { .. } => None,
    }
}
