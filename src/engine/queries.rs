use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedClassState};

impl Engine {
    /// Seat occupancy snapshot for one class instance.
    pub async fn get_capacity(&self, class_id: Ulid) -> Result<CapacityInfo, EngineError> {
        let cs = self
            .get_class(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let guard = cs.read().await;
        Ok(CapacityInfo {
            class_id,
            capacity: guard.capacity,
            confirmed: guard.confirmed_count,
            waitlisted: guard.waitlist_len(),
        })
    }

    /// 1-based FIFO position. `Ok(None)` when the booking exists but is not
    /// waitlisted (confirmed, pending, or terminal).
    pub async fn get_waitlist_position(
        &self,
        booking_id: Ulid,
    ) -> Result<Option<u32>, EngineError> {
        let class_id = self
            .class_of_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let cs = self
            .get_class(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let guard = cs.read().await;
        Ok(guard.waitlist_position(booking_id))
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let class_id = self
            .class_of_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let cs = self
            .get_class(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let guard = cs.read().await;
        guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Full roster in `(created_at, id)` order, terminal rows included.
    /// An unknown class reads as an empty roster.
    pub async fn bookings_for_class(&self, class_id: Ulid) -> Vec<Booking> {
        let Some(cs) = self.get_class(&class_id) else {
            return Vec::new();
        };
        let guard = cs.read().await;
        guard.bookings.clone()
    }

    pub async fn list_classes(&self) -> Vec<ClassInfo> {
        // Collect the Arcs first so no DashMap shard lock is held across an await.
        let shards: Vec<SharedClassState> =
            self.classes.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shards.len());
        for cs in shards {
            let guard = cs.read().await;
            out.push(ClassInfo {
                id: guard.id,
                start_at: guard.start_at,
                capacity: guard.capacity,
                cancelled: guard.cancelled.is_some(),
            });
        }
        out
    }

    pub async fn package_info(&self, package_id: Ulid) -> Result<PackageInfo, EngineError> {
        let ps = self
            .get_package(&package_id)
            .ok_or(EngineError::NotFound(package_id))?;
        let guard = ps.read().await;
        Ok(PackageInfo {
            id: guard.id,
            owner: guard.owner,
            balance: guard.balance,
            expires_at: guard.expires_at,
            active: guard.active,
        })
    }
}
