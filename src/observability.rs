use std::net::SocketAddr;

use crate::model::{BookingStatus, CancelReason};

// ── Booking flow counters ────────────────────────────────────────

/// Counter: bookings created. Labels: status.
pub const BOOKINGS_TOTAL: &str = "rollcall_bookings_total";

/// Counter: bookings cancelled. Labels: reason.
pub const CANCELLATIONS_TOTAL: &str = "rollcall_cancellations_total";

/// Counter: waitlist entries promoted into a freed seat.
pub const PROMOTIONS_TOTAL: &str = "rollcall_promotions_total";

/// Counter: waitlist heads skipped because their package could not cover
/// the debit at promotion time.
pub const PROMOTION_SKIPS_TOTAL: &str = "rollcall_promotion_skips_total";

/// Counter: pending_payment bookings confirmed as paid.
pub const PAYMENTS_CONFIRMED_TOTAL: &str = "rollcall_payments_confirmed_total";

/// Counter: bookings settled as completed after class start.
pub const COMPLETIONS_TOTAL: &str = "rollcall_completions_total";

/// Counter: credits taken from metered packages.
pub const CREDITS_DEBITED_TOTAL: &str = "rollcall_credits_debited_total";

/// Counter: credits returned to metered packages.
pub const CREDITS_REFUNDED_TOTAL: &str = "rollcall_credits_refunded_total";

// ── Engine gauges and journal timings ────────────────────────────

/// Gauge: engines currently loaded, one per studio.
pub const STUDIOS_ACTIVE: &str = "rollcall_studios_active";

/// Histogram: seconds spent in one journal fsync batch.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rollcall_wal_flush_duration_seconds";

/// Histogram: events committed per journal fsync.
pub const WAL_FLUSH_BATCH_SIZE: &str = "rollcall_wal_flush_batch_size";

/// Serve Prometheus metrics on `port`; disabled when `None`.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()
        .expect("Prometheus exporter failed to start");
    tracing::info!("serving Prometheus metrics on 0.0.0.0:{port}/metrics");
}

/// Short label for a booking status, shared by metric tags and
/// notification payloads.
pub fn status_label(status: BookingStatus) -> &'static str {
    match status {
        BookingStatus::PendingPayment => "pending_payment",
        BookingStatus::Confirmed => "confirmed",
        BookingStatus::Waitlisted => "waitlisted",
        BookingStatus::Cancelled => "cancelled",
        BookingStatus::Completed => "completed",
    }
}

/// Short label for a cancellation reason, shared by metric tags and
/// notification payloads.
pub fn reason_label(reason: CancelReason) -> &'static str {
    match reason {
        CancelReason::UserRequested => "user_requested",
        CancelReason::ClassCancelled => "class_cancelled",
        CancelReason::PackagePromotionFailed => "package_promotion_failed",
        CancelReason::PaymentTimeout => "payment_timeout",
        CancelReason::ClassStarted => "class_started",
    }
}
