//! Seat accounting. The free-seat check runs in the mutation before the
//! journal append; the counter arithmetic runs in event apply. Both happen
//! under the class write lock, so check-then-commit is race-free.

use crate::model::ClassState;

impl ClassState {
    pub fn seats_free(&self) -> u32 {
        self.capacity.saturating_sub(self.confirmed_count)
    }

    pub fn has_free_seat(&self) -> bool {
        self.confirmed_count < self.capacity
    }

    /// Count one more held seat (a granted reservation or a promotion).
    pub(crate) fn commit_seat(&mut self) {
        self.confirmed_count += 1;
    }

    /// Give one seat back (floor 0).
    pub(crate) fn free_seat(&mut self) {
        self.confirmed_count = self.confirmed_count.saturating_sub(1);
    }
}
