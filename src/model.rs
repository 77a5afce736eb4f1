use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds since the Unix epoch. Every timestamp in the engine is one.
pub type Ms = i64;

/// How a booking is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    /// Drawn from a prepaid credit package.
    Credits { package_id: Ulid },
    /// Settled at the studio; the seat is still reserved at booking time.
    Cash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    PendingPayment,
    Confirmed,
    Waitlisted,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }
}

/// Why a booking ended up cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    UserRequested,
    /// The studio cancelled the whole class instance.
    ClassCancelled,
    /// Waitlist promotion could not debit the package (expired/insufficient).
    PackagePromotionFailed,
    /// A pending_payment booking outlived the payment TTL.
    PaymentTimeout,
    /// Still waitlisted or unpaid when the class started.
    ClassStarted,
}

/// Package entitlement: either unlimited access or a metered credit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageBalance {
    Unlimited,
    Metered { remaining: u32, total: u32 },
}

impl PackageBalance {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, PackageBalance::Unlimited)
    }

    /// Remaining credits; None for unlimited.
    pub fn remaining(&self) -> Option<u32> {
        match self {
            PackageBalance::Unlimited => None,
            PackageBalance::Metered { remaining, .. } => Some(*remaining),
        }
    }
}

/// One booking row. Lives in its class instance's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub class_id: Ulid,
    pub user_id: Ulid,
    pub payment: PaymentMethod,
    pub status: BookingStatus,
    /// Some(0) cash, Some(1) debited credit, None while waitlisted or unlimited.
    pub credits_used: Option<u32>,
    /// True while this row holds a seat (confirmed, or pending_payment
    /// under the cash flow — the seat is reserved at booking time).
    pub seat_reserved: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub cancel_reason: Option<CancelReason>,
}

impl Booking {
    pub fn package_id(&self) -> Option<Ulid> {
        match self.payment {
            PaymentMethod::Credits { package_id } => Some(package_id),
            PaymentMethod::Cash => None,
        }
    }

    /// Non-terminal: counts for duplicate detection and sweeping.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Per-class-instance state behind the class lock.
#[derive(Debug, Clone)]
pub struct ClassState {
    pub id: Ulid,
    pub start_at: Ms,
    pub capacity: u32,
    /// Some(reason) once the studio cancelled the class instance.
    pub cancelled: Option<String>,
    /// Seats currently held (confirmed + seat-holding pending_payment).
    pub confirmed_count: u32,
    /// All booking rows, sorted by `(created_at, id)` — waitlist order.
    pub bookings: Vec<Booking>,
}

impl ClassState {
    pub fn new(id: Ulid, start_at: Ms, capacity: u32) -> Self {
        Self {
            id,
            start_at,
            capacity,
            cancelled: None,
            confirmed_count: 0,
            bookings: Vec::new(),
        }
    }

    /// Insert a row maintaining `(created_at, id)` order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&(booking.created_at, booking.id), |b| (b.created_at, b.id))
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// The user's non-terminal booking on this class, if any.
    pub fn active_booking_for_user(&self, user_id: Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.user_id == user_id && b.is_active())
    }
}

/// Per-package state behind the package lock.
#[derive(Debug, Clone)]
pub struct PackageState {
    pub id: Ulid,
    pub owner: Ulid,
    pub balance: PackageBalance,
    pub expires_at: Ms,
    pub active: bool,
    /// Booking ids already refunded — the refund idempotency tokens.
    pub refunded: std::collections::HashSet<Ulid>,
}

impl PackageState {
    pub fn new(id: Ulid, owner: Ulid, balance: PackageBalance, expires_at: Ms) -> Self {
        Self {
            id,
            owner,
            balance,
            expires_at,
            active: true,
            refunded: std::collections::HashSet::new(),
        }
    }
}

/// A credit movement rider on a booking event, so one journal record
/// captures the whole transition (seat + credit) atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditDelta {
    pub package_id: Ulid,
    pub amount: u32,
}

/// The event types — flat. This is the journal record format; replaying
/// them in order reconstructs the full engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClassRegistered {
        id: Ulid,
        start_at: Ms,
        capacity: u32,
    },
    ClassCancelled {
        id: Ulid,
        reason: String,
    },
    /// Also the compaction snapshot record: `balance` and `refunded`
    /// carry the package's current values, not its initial ones.
    PackageRegistered {
        id: Ulid,
        owner: Ulid,
        balance: PackageBalance,
        expires_at: Ms,
        active: bool,
        refunded: Vec<Ulid>,
    },
    PackageDeactivated {
        id: Ulid,
    },
    /// Row snapshot at creation. Compaction re-emits rows with
    /// `debit: None` (balances live in PackageRegistered snapshots).
    BookingCreated {
        booking: Booking,
        debit: Option<CreditDelta>,
    },
    /// Waitlist head took a freed seat.
    BookingPromoted {
        id: Ulid,
        class_id: Ulid,
        credits_used: Option<u32>,
        debit: Option<CreditDelta>,
        at: Ms,
    },
    /// pending_payment fell back to the waitlist (deferred flow, class full).
    BookingWaitlisted {
        id: Ulid,
        class_id: Ulid,
        at: Ms,
    },
    PaymentConfirmed {
        id: Ulid,
        class_id: Ulid,
        /// True when the payment event itself claimed the seat
        /// (deferred flow); false when the seat was held since creation.
        newly_seated: bool,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        class_id: Ulid,
        reason: CancelReason,
        released_seat: bool,
        refund: Option<CreditDelta>,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        class_id: Ulid,
        at: Ms,
    },
}

impl Event {
    /// Short label for notify payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ClassRegistered { .. } => "class_registered",
            Event::ClassCancelled { .. } => "class_cancelled",
            Event::PackageRegistered { .. } => "package_registered",
            Event::PackageDeactivated { .. } => "package_deactivated",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingPromoted { .. } => "booking_promoted",
            Event::BookingWaitlisted { .. } => "booking_waitlisted",
            Event::PaymentConfirmed { .. } => "payment_confirmed",
            Event::BookingCancelled { .. } => "booking_cancelled",
            Event::BookingCompleted { .. } => "booking_completed",
        }
    }
}

// ── Operation results & query DTOs ───────────────────────────────

/// What `create_booking` / `confirm_payment` hand back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking_id: Ulid,
    pub status: BookingStatus,
    pub credits_used: Option<u32>,
}

/// What `cancel_booking` hands back. `status` is always `Cancelled` on
/// success; it rides along so callers can echo the row's final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelReceipt {
    pub status: BookingStatus,
    pub credit_refunded: bool,
    pub refunded_credits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityInfo {
    pub class_id: Ulid,
    pub capacity: u32,
    pub confirmed: u32,
    pub waitlisted: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: Ulid,
    pub start_at: Ms,
    pub capacity: u32,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub id: Ulid,
    pub owner: Ulid,
    pub balance: PackageBalance,
    pub expires_at: Ms,
    pub active: bool,
}
