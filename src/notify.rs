use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{CreditDelta, Event};
use crate::observability::{reason_label, status_label};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub: one channel per class instance, carrying committed events.
/// The embedding API layer fans these out to push/webhook consumers;
/// delivery guarantees are its problem, not the engine's.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a class instance. Creates the channel if needed.
    pub fn subscribe(&self, class_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(class_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event. No-op if nobody is listening.
    pub fn send(&self, class_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&class_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a class's channel once the class is terminal (cancelled or
    /// settled). Live receivers drain what was already sent, then see
    /// `Closed`.
    pub fn remove(&self, class_id: &Ulid) {
        self.channels.remove(class_id);
    }
}

/// Render the JSON body that subscribers forward to their consumers.
/// Ids go out as strings; credit movements as plain numbers or null.
pub fn payload(event: &Event) -> serde_json::Value {
    use serde_json::json;
    match event {
        Event::ClassRegistered { id, start_at, capacity } => json!({
            "event": event.kind(),
            "class_id": id.to_string(),
            "start_at": start_at,
            "capacity": capacity,
        }),
        Event::ClassCancelled { id, reason } => json!({
            "event": event.kind(),
            "class_id": id.to_string(),
            "reason": reason,
        }),
        Event::PackageRegistered { id, owner, .. } => json!({
            "event": event.kind(),
            "package_id": id.to_string(),
            "owner": owner.to_string(),
        }),
        Event::PackageDeactivated { id } => json!({
            "event": event.kind(),
            "package_id": id.to_string(),
        }),
        Event::BookingCreated { booking, debit } => json!({
            "event": event.kind(),
            "booking_id": booking.id.to_string(),
            "class_id": booking.class_id.to_string(),
            "user_id": booking.user_id.to_string(),
            "status": status_label(booking.status),
            "credits_used": booking.credits_used,
            "debited": delta_amount(debit),
        }),
        Event::BookingPromoted { id, class_id, credits_used, debit, .. } => json!({
            "event": event.kind(),
            "booking_id": id.to_string(),
            "class_id": class_id.to_string(),
            "status": "confirmed",
            "credits_used": credits_used,
            "debited": delta_amount(debit),
        }),
        Event::BookingWaitlisted { id, class_id, .. } => json!({
            "event": event.kind(),
            "booking_id": id.to_string(),
            "class_id": class_id.to_string(),
            "status": "waitlisted",
        }),
        Event::PaymentConfirmed { id, class_id, .. } => json!({
            "event": event.kind(),
            "booking_id": id.to_string(),
            "class_id": class_id.to_string(),
            "status": "confirmed",
        }),
        Event::BookingCancelled { id, class_id, reason, refund, .. } => json!({
            "event": event.kind(),
            "booking_id": id.to_string(),
            "class_id": class_id.to_string(),
            "status": "cancelled",
            "reason": reason_label(*reason),
            "refunded": delta_amount(refund),
        }),
        Event::BookingCompleted { id, class_id, .. } => json!({
            "event": event.kind(),
            "booking_id": id.to_string(),
            "class_id": class_id.to_string(),
            "status": "completed",
        }),
    }
}

fn delta_amount(delta: &Option<CreditDelta>) -> Option<u32> {
    delta.as_ref().map(|d| d.amount)
}
