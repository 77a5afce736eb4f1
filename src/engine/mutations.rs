use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{reason_label, status_label};

use super::policy::{cancellation_allowed, now_ms, pending_expired, validate_time};
use super::{apply_to_package, Engine, EngineError, WalCommand};

impl Engine {
    // ── Catalog: class instances and packages ───────────────────────

    pub async fn register_class(
        &self,
        id: Ulid,
        start_at: Ms,
        capacity: u32,
    ) -> Result<(), EngineError> {
        validate_time(start_at)?;
        if capacity == 0 {
            return Err(EngineError::Validation("capacity must be positive"));
        }
        if capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        if self.classes.len() >= MAX_CLASSES_PER_STUDIO {
            return Err(EngineError::LimitExceeded("too many classes"));
        }
        if self.classes.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        // No shard guards an entity still being registered, so the gate
        // keeps this append+insert pair out of a compaction snapshot.
        let _gate = self.catalog_gate.read().await;
        let event = Event::ClassRegistered { id, start_at, capacity };
        self.wal_append(&event).await?;
        let cs = ClassState::new(id, start_at, capacity);
        self.classes.insert(id, Arc::new(RwLock::new(cs)));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Studio-side cancellation of a whole class instance. Every active
    /// booking is cancelled and credit debits are refunded; the cancellation
    /// window does not apply and nothing is promoted — there is no class
    /// left to promote into. The cancelled marker is journalled after the
    /// rows, so a run cut short by an append failure leaves a class that
    /// can simply be cancelled again. Returns the number of bookings
    /// cancelled.
    pub async fn cancel_class(&self, id: Ulid, reason: &str) -> Result<u32, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let cs = self.get_class(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = cs.write_owned().await;
        if guard.cancelled.is_some() {
            return Err(EngineError::ClassCancelled(id));
        }
        let now = now_ms();

        let rows: Vec<Booking> = guard.bookings.iter().filter(|b| b.is_active()).cloned().collect();
        let mut cancelled = 0u32;
        for row in rows {
            let mut refund = None;
            let mut pkg_guard = None;
            if let (Some(amount), Some(package_id)) = (row.credits_used, row.package_id())
                && amount > 0
                && let Some(ps) = self.get_package(&package_id) {
                    let pg = ps.write_owned().await;
                    refund = pg
                        .validate_refund(row.id, amount)
                        .map(|amount| CreditDelta { package_id, amount });
                    pkg_guard = Some(pg);
                }

            let event = Event::BookingCancelled {
                id: row.id,
                class_id: id,
                reason: CancelReason::ClassCancelled,
                released_seat: row.seat_reserved,
                refund,
                at: now,
            };
            self.persist_and_apply(&mut guard, pkg_guard.as_deref_mut(), &event)
                .await?;
            metrics::counter!(
                crate::observability::CANCELLATIONS_TOTAL,
                "reason" => reason_label(CancelReason::ClassCancelled)
            )
            .increment(1);
            if let Some(r) = refund {
                metrics::counter!(crate::observability::CREDITS_REFUNDED_TOTAL)
                    .increment(r.amount as u64);
            }
            cancelled += 1;
        }

        let event = Event::ClassCancelled { id, reason: reason.to_string() };
        self.persist_and_apply(&mut guard, None, &event).await?;
        // Terminal for the class: nothing is ever sent on its channel again.
        self.notify.remove(&id);
        Ok(cancelled)
    }

    pub async fn register_package(
        &self,
        id: Ulid,
        owner: Ulid,
        balance: PackageBalance,
        expires_at: Ms,
    ) -> Result<(), EngineError> {
        validate_time(expires_at)?;
        if let PackageBalance::Metered { remaining, total } = balance
            && remaining > total {
                return Err(EngineError::Validation("remaining exceeds total"));
            }
        if self.packages.len() >= MAX_PACKAGES_PER_STUDIO {
            return Err(EngineError::LimitExceeded("too many packages"));
        }
        if self.packages.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let _gate = self.catalog_gate.read().await;
        let event = Event::PackageRegistered {
            id,
            owner,
            balance,
            expires_at,
            active: true,
            refunded: Vec::new(),
        };
        self.wal_append(&event).await?;
        let ps = PackageState::new(id, owner, balance, expires_at);
        self.packages.insert(id, Arc::new(RwLock::new(ps)));
        Ok(())
    }

    /// Deactivated packages reject new debits; refunds still land.
    /// Idempotent: deactivating twice is Ok.
    pub async fn deactivate_package(&self, id: Ulid) -> Result<(), EngineError> {
        let ps = self.get_package(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ps.write_owned().await;
        if !guard.active {
            return Ok(());
        }
        let event = Event::PackageDeactivated { id };
        self.wal_append(&event).await?;
        apply_to_package(&mut guard, &event);
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────────────────

    /// Request a seat on a class instance. The outcome is decided under the
    /// class write lock: a free seat confirms the booking (or parks it in
    /// pending_payment for cash), a full class waitlists it. Nothing is
    /// journalled or mutated until every check has passed, so any error
    /// means no seat was taken and no credit moved.
    pub async fn create_booking(
        &self,
        class_id: Ulid,
        user_id: Ulid,
        payment: PaymentMethod,
    ) -> Result<BookingReceipt, EngineError> {
        let cs = self
            .get_class(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let mut guard = cs.write_owned().await;

        if guard.cancelled.is_some() {
            return Err(EngineError::ClassCancelled(class_id));
        }
        let now = now_ms();
        if guard.start_at <= now {
            return Err(EngineError::PastClass(class_id));
        }
        if guard.active_booking_for_user(user_id).is_some() {
            return Err(EngineError::DuplicateBooking { class_id, user_id });
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_CLASS {
            return Err(EngineError::LimitExceeded("too many bookings on class"));
        }

        // The package must exist even when the request will only be
        // waitlisted; its balance is not checked until a seat is granted.
        let package = match payment {
            PaymentMethod::Credits { package_id } => {
                let ps = self
                    .get_package(&package_id)
                    .ok_or(EngineError::NotFound(package_id))?;
                Some((package_id, ps))
            }
            PaymentMethod::Cash => None,
        };

        // Package lock is taken after the class lock (fixed order, see
        // promote_next for the other taker).
        let mut pkg_guard = None;
        let (status, credits_used, seat_reserved, debit) = match (package, guard.has_free_seat()) {
            (None, true) => (BookingStatus::PendingPayment, Some(0), true, None),
            (None, false) => (BookingStatus::Waitlisted, Some(0), false, None),
            (Some(_), false) => (BookingStatus::Waitlisted, None, false, None),
            (Some((package_id, ps)), true) => {
                let pg = ps.write_owned().await;
                let debit = pg
                    .validate_debit(1, now)?
                    .map(|amount| CreditDelta { package_id, amount });
                let credits_used = debit.as_ref().map(|d| d.amount);
                pkg_guard = Some(pg);
                (BookingStatus::Confirmed, credits_used, true, debit)
            }
        };

        let booking = Booking {
            id: Ulid::new(),
            class_id,
            user_id,
            payment,
            status,
            credits_used,
            seat_reserved,
            created_at: now,
            updated_at: now,
            cancel_reason: None,
        };
        let event = Event::BookingCreated { booking: booking.clone(), debit };
        self.persist_and_apply(&mut guard, pkg_guard.as_deref_mut(), &event)
            .await?;

        metrics::counter!(
            crate::observability::BOOKINGS_TOTAL,
            "status" => status_label(status)
        )
        .increment(1);
        if let Some(d) = debit {
            metrics::counter!(crate::observability::CREDITS_DEBITED_TOTAL)
                .increment(d.amount as u64);
        }

        Ok(BookingReceipt {
            booking_id: booking.id,
            status,
            credits_used,
        })
    }

    /// User-side cancellation. Confirmed bookings are checked against the
    /// cancellation window and refunded (once) when a credit was debited;
    /// the freed seat is handed to the waitlist head inside this same
    /// critical section, so it is never observable as free in between.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor: Ulid,
    ) -> Result<CancelReceipt, EngineError> {
        let (class_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let row = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .clone();
        // A foreign booking id reads as NotFound — don't leak other users' rows.
        if row.user_id != actor {
            return Err(EngineError::NotFound(booking_id));
        }
        let now = now_ms();

        let released_seat = match row.status {
            BookingStatus::Waitlisted => false,
            BookingStatus::PendingPayment => row.seat_reserved,
            BookingStatus::Confirmed => {
                if !cancellation_allowed(guard.start_at, now, self.policy.cancellation_window_ms) {
                    return Err(EngineError::CancellationWindowClosed {
                        deadline: guard.start_at - self.policy.cancellation_window_ms,
                    });
                }
                true
            }
            BookingStatus::Cancelled | BookingStatus::Completed => {
                return Err(EngineError::NotFound(booking_id));
            }
        };

        // Only a confirmed booking can have an outstanding debit.
        let mut refund = None;
        let mut pkg_guard = None;
        if row.status == BookingStatus::Confirmed
            && let (Some(amount), Some(package_id)) = (row.credits_used, row.package_id())
            && amount > 0
            && let Some(ps) = self.get_package(&package_id) {
                let pg = ps.write_owned().await;
                refund = pg
                    .validate_refund(booking_id, amount)
                    .map(|amount| CreditDelta { package_id, amount });
                pkg_guard = Some(pg);
            }

        let event = Event::BookingCancelled {
            id: booking_id,
            class_id,
            reason: CancelReason::UserRequested,
            released_seat,
            refund,
            at: now,
        };
        self.persist_and_apply(&mut guard, pkg_guard.as_deref_mut(), &event)
            .await?;
        // Promotion may need a different package lock; release this one first.
        drop(pkg_guard);

        metrics::counter!(
            crate::observability::CANCELLATIONS_TOTAL,
            "reason" => reason_label(CancelReason::UserRequested)
        )
        .increment(1);
        if let Some(r) = refund {
            metrics::counter!(crate::observability::CREDITS_REFUNDED_TOTAL)
                .increment(r.amount as u64);
        }

        if released_seat {
            self.promote_next(&mut guard, now).await;
        }

        Ok(CancelReceipt {
            status: BookingStatus::Cancelled,
            credit_refunded: refund.is_some(),
            refunded_credits: refund.map_or(0, |r| r.amount),
        })
    }

    /// External payment collaborator reports a pending_payment booking as
    /// paid. Idempotent: confirming an already-confirmed booking is a no-op.
    pub async fn confirm_payment(&self, booking_id: Ulid) -> Result<BookingReceipt, EngineError> {
        let (class_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let row = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .clone();
        let now = now_ms();

        match row.status {
            BookingStatus::Confirmed => Ok(BookingReceipt {
                booking_id,
                status: BookingStatus::Confirmed,
                credits_used: row.credits_used,
            }),
            BookingStatus::PendingPayment if row.seat_reserved => {
                let event = Event::PaymentConfirmed {
                    id: booking_id,
                    class_id,
                    newly_seated: false,
                    at: now,
                };
                self.persist_and_apply(&mut guard, None, &event).await?;
                metrics::counter!(crate::observability::PAYMENTS_CONFIRMED_TOTAL).increment(1);
                Ok(BookingReceipt {
                    booking_id,
                    status: BookingStatus::Confirmed,
                    credits_used: row.credits_used,
                })
            }
            BookingStatus::PendingPayment => {
                // Deferred flow: this pending row holds no seat (journals
                // written before seats were reserved at booking time), so
                // the capacity decision runs now.
                if guard.has_free_seat() {
                    let event = Event::PaymentConfirmed {
                        id: booking_id,
                        class_id,
                        newly_seated: true,
                        at: now,
                    };
                    self.persist_and_apply(&mut guard, None, &event).await?;
                    metrics::counter!(crate::observability::PAYMENTS_CONFIRMED_TOTAL).increment(1);
                    Ok(BookingReceipt {
                        booking_id,
                        status: BookingStatus::Confirmed,
                        credits_used: row.credits_used,
                    })
                } else {
                    let event = Event::BookingWaitlisted { id: booking_id, class_id, at: now };
                    self.persist_and_apply(&mut guard, None, &event).await?;
                    Ok(BookingReceipt {
                        booking_id,
                        status: BookingStatus::Waitlisted,
                        credits_used: row.credits_used,
                    })
                }
            }
            BookingStatus::Waitlisted | BookingStatus::Cancelled | BookingStatus::Completed => {
                Err(EngineError::NotFound(booking_id))
            }
        }
    }

    /// Hand a freed seat to the first eligible waitlist entry, in enqueue
    /// order. A head whose package can no longer cover the debit is
    /// cancelled with `PackagePromotionFailed` and the scan moves to the
    /// next entry. Never bubbles an error: the caller's own event already
    /// committed, a failed promotion just leaves the seat free.
    async fn promote_next(&self, cs: &mut ClassState, now: Ms) {
        loop {
            let head = match cs.next_waitlisted() {
                Some(b) => b.clone(),
                None => return,
            };

            let mut pkg_guard = None;
            let debit = match head.payment {
                // Cash heads take the seat directly; payment settles at the studio.
                PaymentMethod::Cash => Ok(None),
                PaymentMethod::Credits { package_id } => match self.get_package(&package_id) {
                    None => Err(EngineError::NotFound(package_id)),
                    Some(ps) => {
                        let pg = ps.write_owned().await;
                        match pg.validate_debit(1, now) {
                            Ok(amount) => {
                                let delta =
                                    amount.map(|amount| CreditDelta { package_id, amount });
                                pkg_guard = Some(pg);
                                Ok(delta)
                            }
                            Err(e) => Err(e),
                        }
                    }
                },
            };

            let debit = match debit {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("waitlist promotion skips booking {}: {e}", head.id);
                    metrics::counter!(crate::observability::PROMOTION_SKIPS_TOTAL).increment(1);
                    let event = Event::BookingCancelled {
                        id: head.id,
                        class_id: cs.id,
                        reason: CancelReason::PackagePromotionFailed,
                        released_seat: false,
                        refund: None,
                        at: now,
                    };
                    if let Err(e) = self.persist_and_apply(cs, None, &event).await {
                        tracing::warn!("promotion skip not journalled for {}: {e}", head.id);
                        return;
                    }
                    metrics::counter!(
                        crate::observability::CANCELLATIONS_TOTAL,
                        "reason" => reason_label(CancelReason::PackagePromotionFailed)
                    )
                    .increment(1);
                    continue;
                }
            };

            let credits_used = match head.payment {
                PaymentMethod::Cash => Some(0),
                PaymentMethod::Credits { .. } => debit.as_ref().map(|d| d.amount),
            };
            let event = Event::BookingPromoted {
                id: head.id,
                class_id: cs.id,
                credits_used,
                debit,
                at: now,
            };
            if let Err(e) = self
                .persist_and_apply(cs, pkg_guard.as_deref_mut(), &event)
                .await
            {
                tracing::warn!("promotion not journalled for {}: {e}", head.id);
                return;
            }
            metrics::counter!(crate::observability::PROMOTIONS_TOTAL).increment(1);
            if let Some(d) = debit {
                metrics::counter!(crate::observability::CREDITS_DEBITED_TOTAL)
                    .increment(d.amount as u64);
            }
            return;
        }
    }

    // ── Sweeper entry points ─────────────────────────────────────────

    /// Classes whose start time has passed and that still carry active
    /// bookings. Skips classes whose lock is contended — the next sweep
    /// will pick them up.
    pub fn collect_elapsed_classes(&self, now: Ms) -> Vec<Ulid> {
        let mut elapsed = Vec::new();
        for entry in self.classes.iter() {
            let cs = entry.value().clone();
            if let Ok(guard) = cs.try_read()
                && guard.start_at <= now
                && guard.bookings.iter().any(|b| b.is_active()) {
                    elapsed.push(guard.id);
                }
        }
        elapsed
    }

    /// Settle a class that has started: confirmed bookings complete,
    /// everything still waitlisted or unpaid is cancelled. Seats drop back
    /// to zero. Returns the number of rows settled.
    pub async fn settle_elapsed_class(&self, class_id: Ulid, now: Ms) -> Result<u32, EngineError> {
        let cs = self
            .get_class(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let mut guard = cs.write_owned().await;
        if guard.start_at > now {
            return Ok(0);
        }

        let rows: Vec<Booking> = guard.bookings.iter().filter(|b| b.is_active()).cloned().collect();
        let mut settled = 0u32;
        for row in rows {
            match row.status {
                BookingStatus::Confirmed => {
                    let event = Event::BookingCompleted { id: row.id, class_id, at: now };
                    self.persist_and_apply(&mut guard, None, &event).await?;
                    metrics::counter!(crate::observability::COMPLETIONS_TOTAL).increment(1);
                }
                _ => {
                    let event = Event::BookingCancelled {
                        id: row.id,
                        class_id,
                        reason: CancelReason::ClassStarted,
                        released_seat: row.seat_reserved,
                        refund: None,
                        at: now,
                    };
                    self.persist_and_apply(&mut guard, None, &event).await?;
                    metrics::counter!(
                        crate::observability::CANCELLATIONS_TOTAL,
                        "reason" => reason_label(CancelReason::ClassStarted)
                    )
                    .increment(1);
                }
            }
            settled += 1;
        }
        // A settled class is inert; drop its broadcast channel.
        self.notify.remove(&class_id);
        Ok(settled)
    }

    /// pending_payment bookings whose TTL has elapsed. Same contention
    /// policy as `collect_elapsed_classes`.
    pub fn collect_stale_pending(&self, now: Ms) -> Vec<Ulid> {
        let ttl = self.policy.pending_payment_ttl_ms;
        let mut stale = Vec::new();
        for entry in self.classes.iter() {
            let cs = entry.value().clone();
            if let Ok(guard) = cs.try_read() {
                for b in &guard.bookings {
                    if b.status == BookingStatus::PendingPayment
                        && pending_expired(b.created_at, now, ttl)
                    {
                        stale.push(b.id);
                    }
                }
            }
        }
        stale
    }

    /// Cancel a pending_payment booking that was never paid. The freed seat
    /// goes to the waitlist head. Errors with NotFound when payment won the
    /// race since the sweep collected this id.
    pub async fn expire_pending_payment(&self, booking_id: Ulid) -> Result<(), EngineError> {
        let (class_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let row = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .clone();
        if row.status != BookingStatus::PendingPayment {
            return Err(EngineError::NotFound(booking_id));
        }
        let now = now_ms();

        let event = Event::BookingCancelled {
            id: booking_id,
            class_id,
            reason: CancelReason::PaymentTimeout,
            released_seat: row.seat_reserved,
            refund: None,
            at: now,
        };
        self.persist_and_apply(&mut guard, None, &event).await?;
        metrics::counter!(
            crate::observability::CANCELLATIONS_TOTAL,
            "reason" => reason_label(CancelReason::PaymentTimeout)
        )
        .increment(1);

        if row.seat_reserved {
            self.promote_next(&mut guard, now).await;
        }
        Ok(())
    }

    // ── WAL compaction ───────────────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state: one registration per class and package
    /// (packages snapshot their live balance and refund tokens), then one
    /// BookingCreated per roster row with its current status.
    ///
    /// Takes the catalog gate plus read guards on every shard up front and
    /// holds them through the file swap, so no append — registrations
    /// included, which have no shard to guard — can race the snapshot. Any
    /// contention aborts with Unavailable; the compactor just retries on
    /// its next tick.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = match self.catalog_gate.try_write() {
            Ok(g) => g,
            Err(_) => {
                return Err(EngineError::Unavailable("compact: registration in flight".into()))
            }
        };
        let mut class_guards = Vec::with_capacity(self.classes.len());
        for entry in self.classes.iter() {
            match entry.value().clone().try_read_owned() {
                Ok(g) => class_guards.push(g),
                Err(_) => return Err(EngineError::Unavailable("compact: class busy".into())),
            }
        }
        let mut package_guards = Vec::with_capacity(self.packages.len());
        for entry in self.packages.iter() {
            match entry.value().clone().try_read_owned() {
                Ok(g) => package_guards.push(g),
                Err(_) => return Err(EngineError::Unavailable("compact: package busy".into())),
            }
        }

        let mut events = Vec::new();
        for g in &class_guards {
            events.push(Event::ClassRegistered {
                id: g.id,
                start_at: g.start_at,
                capacity: g.capacity,
            });
            if let Some(reason) = &g.cancelled {
                events.push(Event::ClassCancelled { id: g.id, reason: reason.clone() });
            }
        }
        for g in &package_guards {
            events.push(Event::PackageRegistered {
                id: g.id,
                owner: g.owner,
                balance: g.balance,
                expires_at: g.expires_at,
                active: g.active,
                refunded: g.refunded.iter().copied().collect(),
            });
        }
        // Rows replay with debit: None — balances live in the package
        // snapshots above, and seat counters rebuild from seat_reserved.
        for g in &class_guards {
            for b in &g.bookings {
                events.push(Event::BookingCreated { booking: b.clone(), debit: None });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot: events, ack: tx })
            .await
            .map_err(|_| EngineError::Unavailable("journal writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::Unavailable("journal writer dropped ack".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()));
        drop(class_guards);
        drop(package_guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { ack: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
