//! rollcall: an event-sourced allocation engine for class-based studios.
//!
//! Every state change is a [`model::Event`] appended to a write-ahead log
//! before it is applied in memory, so a crash never loses a committed
//! booking and restart is a pure replay. Seats, credits and the waitlist
//! of one class are guarded by that class's own lock; bookings against
//! different classes never contend.
//!
//! # Modules
//!
//! - [`model`]: domain types and the event enum
//! - [`engine`]: per-studio state machine (mutations + queries)
//! - [`wal`]: length-prefixed, CRC-checked journal with group commit
//! - [`notify`]: per-class broadcast of committed events
//! - [`studio`]: lazy per-studio engine registry
//! - [`sweeper`]: background settlement, payment expiry, WAL compaction
//! - [`observability`]: metric names and the Prometheus exporter
//! - [`limits`]: hard caps on counts, names and amounts

pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod studio;
pub mod sweeper;
pub mod wal;

pub use engine::{Engine, EngineError, PolicyConfig};
pub use model::{
    Booking, BookingReceipt, BookingStatus, CancelReason, CancelReceipt, CapacityInfo, ClassInfo,
    CreditDelta, Event, Ms, PackageBalance, PackageInfo, PaymentMethod,
};
pub use notify::NotifyHub;
pub use studio::StudioManager;
