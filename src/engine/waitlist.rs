//! FIFO waitlist view over a class roster.
//!
//! There is no separate queue structure: the roster is kept sorted by
//! `(created_at, id)`, so the waitlist is simply the waitlisted rows in
//! roster order. Promotion and position queries walk that order.

use ulid::Ulid;

use crate::model::{Booking, BookingStatus, ClassState};

impl ClassState {
    /// Waitlisted rows in promotion order (oldest first).
    pub fn waitlisted(&self) -> impl Iterator<Item = &Booking> {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Waitlisted)
    }

    /// Head of the queue: the next row a freed seat would go to.
    pub fn next_waitlisted(&self) -> Option<&Booking> {
        self.waitlisted().next()
    }

    /// 1-based queue position, or `None` when the booking is not waitlisted.
    pub fn waitlist_position(&self, booking_id: Ulid) -> Option<u32> {
        let mut pos = 0u32;
        for b in self.waitlisted() {
            pos += 1;
            if b.id == booking_id {
                return Some(pos);
            }
        }
        None
    }

    pub fn waitlist_len(&self) -> u32 {
        self.waitlisted().count() as u32
    }
}

// ══════════════════════════ Tests ══════════════════════════
