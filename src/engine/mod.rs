mod capacity;
mod error;
mod ledger;
mod mutations;
mod policy;
mod queries;
mod waitlist;

pub use error::EngineError;
pub(crate) use policy::now_ms;
pub use policy::{cancellation_allowed, pending_expired, PolicyConfig};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedClassState = Arc<RwLock<ClassState>>;
pub type SharedPackageState = Arc<RwLock<PackageState>>;

// ── Journal writer task ──────────────────────────────────

pub(super) enum WalCommand {
    Append { event: Event, ack: oneshot::Sender<io::Result<()>> },
    Compact { snapshot: Vec<Event>, ack: oneshot::Sender<io::Result<()>> },
    AppendsSinceCompact { ack: oneshot::Sender<u64> },
}

type Waiter = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the journal. Appends are committed in batches: whatever is already
/// queued behind the first append joins the same fsync, and every waiter
/// in the batch hears the shared outcome. Compaction and the counter read
/// ride the same channel, so they serialize with appends without a lock.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, ack) = match cmd {
            WalCommand::Append { event, ack } => (event, ack),
            other => {
                serve(&mut wal, other);
                continue;
            }
        };

        // The batch window: drain whatever is queued right now.
        let mut batch: Vec<Waiter> = vec![(event, ack)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, ack } => batch.push((event, ack)),
                other => {
                    // Commit the open batch before serving this, so a
                    // compaction swap never races buffered frames.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            serve(&mut wal, cmd);
        }
    }
}

/// Stage every frame, fsync once, then send the shared outcome to every
/// waiter in the batch.
fn commit_batch(wal: &mut Wal, batch: Vec<Waiter>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut outcome = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            outcome = Err(e);
            break;
        }
    }
    // Flush even after a failed append, so stale buffered frames cannot
    // leak into a later batch (these waiters are all told this one failed).
    let flushed = wal.flush_sync();
    if outcome.is_ok() {
        outcome = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, ack) in batch {
        let shared = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(shared);
    }
}

fn serve(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, ack } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = ack.send(result);
        }
        WalCommand::AppendsSinceCompact { ack } => {
            let _ = ack.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends batch in the main loop"),
    }
}

pub struct Engine {
    pub classes: DashMap<Ulid, SharedClassState>,
    pub packages: DashMap<Ulid, SharedPackageState>,
    pub notify: Arc<NotifyHub>,
    pub policy: PolicyConfig,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → class instance id
    pub(super) booking_to_class: DashMap<Ulid, Ulid>,
    /// Registrations hold this shared across their append+insert window —
    /// no shard exists yet for compaction to guard; compaction takes it
    /// exclusive while it snapshots.
    pub(super) catalog_gate: RwLock<()>,
}

/// Apply a class-scoped event to a ClassState (no locking — caller holds the lock).
/// Every seat-counter movement goes through here, so live state, a replayed
/// journal, and a compacted journal all agree.
fn apply_to_class(cs: &mut ClassState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ClassCancelled { reason, .. } => {
            cs.cancelled = Some(reason.clone());
        }
        Event::BookingCreated { booking, .. } => {
            booking_index.insert(booking.id, booking.class_id);
            if booking.seat_reserved {
                cs.commit_seat();
            }
            cs.insert_booking(booking.clone());
        }
        Event::BookingPromoted {
            id, credits_used, at, ..
        } => {
            cs.commit_seat();
            if let Some(b) = cs.booking_mut(*id) {
                b.status = BookingStatus::Confirmed;
                b.credits_used = *credits_used;
                b.seat_reserved = true;
                b.updated_at = *at;
            }
        }
        Event::BookingWaitlisted { id, at, .. } => {
            if let Some(b) = cs.booking_mut(*id) {
                b.status = BookingStatus::Waitlisted;
                b.seat_reserved = false;
                b.updated_at = *at;
            }
        }
        Event::PaymentConfirmed {
            id, newly_seated, at, ..
        } => {
            if *newly_seated {
                cs.commit_seat();
            }
            if let Some(b) = cs.booking_mut(*id) {
                b.status = BookingStatus::Confirmed;
                b.seat_reserved = true;
                b.updated_at = *at;
            }
        }
        Event::BookingCancelled {
            id,
            reason,
            released_seat,
            at,
            ..
        } => {
            if *released_seat {
                cs.free_seat();
            }
            if let Some(b) = cs.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
                b.cancel_reason = Some(*reason);
                b.seat_reserved = false;
                b.updated_at = *at;
            }
        }
        Event::BookingCompleted { id, at, .. } => {
            cs.free_seat();
            if let Some(b) = cs.booking_mut(*id) {
                b.status = BookingStatus::Completed;
                b.seat_reserved = false;
                b.updated_at = *at;
            }
        }
        // Class/package registration is handled at the DashMap level, not here
        Event::ClassRegistered { .. }
        | Event::PackageRegistered { .. }
        | Event::PackageDeactivated { .. } => {}
    }
}

/// Apply a package-scoped event to a PackageState (caller holds the lock).
/// Balance arithmetic lives here and nowhere else.
fn apply_to_package(ps: &mut PackageState, event: &Event) {
    match event {
        Event::BookingCreated { debit: Some(d), .. }
        | Event::BookingPromoted { debit: Some(d), .. } => ps.commit_debit(d.amount),
        Event::BookingCancelled {
            id,
            refund: Some(r),
            ..
        } => ps.commit_refund(*id, r.amount),
        Event::PackageDeactivated { .. } => ps.active = false,
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        Self::with_policy(wal_path, notify, PolicyConfig::default())
    }

    pub fn with_policy(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        policy: PolicyConfig,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            classes: DashMap::new(),
            packages: DashMap::new(),
            notify,
            policy,
            wal_tx,
            booking_to_class: DashMap::new(),
            catalog_gate: RwLock::new(()),
        };

        // During replay nothing else holds these Arcs, so try_write always
        // succeeds. blocking_write is off the table: engines get built inside
        // the runtime when a studio is first touched.
        for event in &events {
            match event {
                Event::ClassRegistered {
                    id,
                    start_at,
                    capacity,
                } => {
                    let cs = ClassState::new(*id, *start_at, *capacity);
                    engine.classes.insert(*id, Arc::new(RwLock::new(cs)));
                }
                Event::PackageRegistered {
                    id,
                    owner,
                    balance,
                    expires_at,
                    active,
                    refunded,
                } => {
                    let mut ps = PackageState::new(*id, *owner, *balance, *expires_at);
                    ps.active = *active;
                    ps.refunded = refunded.iter().copied().collect();
                    engine.packages.insert(*id, Arc::new(RwLock::new(ps)));
                }
                other => {
                    if let Some(class_id) = event_class_id(other)
                        && let Some(entry) = engine.classes.get(&class_id) {
                            let cs_arc = entry.clone();
                            let mut guard = cs_arc.try_write().expect("replay: sole owner");
                            apply_to_class(&mut guard, other, &engine.booking_to_class);
                        }
                    if let Some(package_id) = event_package_id(other)
                        && let Some(entry) = engine.packages.get(&package_id) {
                            let ps_arc = entry.clone();
                            let mut guard = ps_arc.try_write().expect("replay: sole owner");
                            apply_to_package(&mut guard, other);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Hand one event to the writer task and wait for its batch to commit.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), ack: tx })
            .await
            .map_err(|_| EngineError::Unavailable("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("journal writer dropped ack".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub fn get_class(&self, id: &Ulid) -> Option<SharedClassState> {
        self.classes.get(id).map(|e| e.value().clone())
    }

    pub fn get_package(&self, id: &Ulid) -> Option<SharedPackageState> {
        self.packages.get(id).map(|e| e.value().clone())
    }

    pub fn class_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_class.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call. The journal append is the
    /// commit point: an error here means nothing was applied. `package`
    /// carries the lock guard for the event's credit rider, if it has one.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut ClassState,
        package: Option<&mut PackageState>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_class(cs, event, &self.booking_to_class);
        if let Some(ps) = package {
            apply_to_package(ps, event);
        }
        self.notify.send(cs.id, event);
        Ok(())
    }

    /// Lookup booking → class, get class, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ClassState>), EngineError> {
        let class_id = self
            .class_of_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let cs = self
            .get_class(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let guard = cs.write_owned().await;
        Ok((class_id, guard))
    }
}

/// Extract the class instance id from an event (None for registry events).
fn event_class_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ClassCancelled { id, .. } => Some(*id),
        Event::BookingCreated { booking, .. } => Some(booking.class_id),
        Event::BookingPromoted { class_id, .. }
        | Event::BookingWaitlisted { class_id, .. }
        | Event::PaymentConfirmed { class_id, .. }
        | Event::BookingCancelled { class_id, .. }
        | Event::BookingCompleted { class_id, .. } => Some(*class_id),
        Event::ClassRegistered { .. }
        | Event::PackageRegistered { .. }
        | Event::PackageDeactivated { .. } => None,
    }
}

/// Extract the package id whose balance an event touches, if any.
fn event_package_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { debit: Some(d), .. }
        | Event::BookingPromoted { debit: Some(d), .. } => Some(d.package_id),
        Event::BookingCancelled {
            refund: Some(r), ..
        } => Some(r.package_id),
        Event::PackageDeactivated { id } => Some(*id),
        _ => None,
    }
}
