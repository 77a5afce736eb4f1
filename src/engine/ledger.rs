//! Credit accounting. Validation runs in the mutation before the journal
//! append; the balance arithmetic runs in event apply. Both happen under
//! the package write lock. `remaining` is never touched anywhere else.

use ulid::Ulid;

use crate::limits::MAX_DEBIT_AMOUNT;
use crate::model::{Ms, PackageBalance, PackageState};

use super::EngineError;

impl PackageState {
    /// Can `amount` credits be taken right now?
    ///
    /// `Ok(None)` — unlimited package: the debit is a no-op success,
    /// nothing will be decremented. `Ok(Some(amount))` — metered package
    /// with enough balance. Check order: inactive, expired, insufficient.
    /// Inactive and expired packages reject even when unlimited — being
    /// unlimited skips the counter change, not the gate.
    pub fn validate_debit(&self, amount: u32, now: Ms) -> Result<Option<u32>, EngineError> {
        if amount == 0 {
            return Err(EngineError::Validation("debit amount must be positive"));
        }
        if amount > MAX_DEBIT_AMOUNT {
            return Err(EngineError::LimitExceeded("debit amount too large"));
        }
        if !self.active {
            return Err(EngineError::PackageInactive(self.id));
        }
        if now >= self.expires_at {
            return Err(EngineError::PackageExpired(self.id));
        }
        match self.balance {
            PackageBalance::Unlimited => Ok(None),
            PackageBalance::Metered { remaining, .. } if remaining < amount => {
                Err(EngineError::InsufficientCredits(self.id))
            }
            PackageBalance::Metered { .. } => Ok(Some(amount)),
        }
    }

    pub(crate) fn commit_debit(&mut self, amount: u32) {
        if let PackageBalance::Metered { remaining, .. } = &mut self.balance {
            *remaining = remaining.saturating_sub(amount);
        }
    }

    /// Would a refund of `amount` for `booking_id` move any credits?
    ///
    /// None (no-op): unlimited package, zero amount, or the booking id is
    /// already in the refunded set — a second refund for the same booking
    /// never double-credits. Refunds ignore active/expiry state: the user
    /// gets their credit back even if the package lapsed since booking.
    pub fn validate_refund(&self, booking_id: Ulid, amount: u32) -> Option<u32> {
        if self.balance.is_unlimited() || amount == 0 {
            return None;
        }
        if self.refunded.contains(&booking_id) {
            return None;
        }
        Some(amount)
    }

    pub(crate) fn commit_refund(&mut self, booking_id: Ulid, amount: u32) {
        if let PackageBalance::Metered { remaining, total } = &mut self.balance {
            *remaining = (*remaining + amount).min(*total);
        }
        self.refunded.insert(booking_id);
    }
}
