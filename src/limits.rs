//! Hard bounds. Violations surface as `EngineError::LimitExceeded`.

use crate::model::Ms;

/// Max class instances per studio engine.
pub const MAX_CLASSES_PER_STUDIO: usize = 100_000;

/// Max credit packages per studio engine.
pub const MAX_PACKAGES_PER_STUDIO: usize = 1_000_000;

/// Max booking rows (any status) on a single class instance.
pub const MAX_BOOKINGS_PER_CLASS: usize = 10_000;

/// Max seats on a single class instance.
pub const MAX_CAPACITY: u32 = 10_000;

/// Max length of a class cancellation reason.
pub const MAX_REASON_LEN: usize = 256;

/// Max credits moved by a single debit/refund.
pub const MAX_DEBIT_AMOUNT: u32 = 1_000;

pub const MAX_STUDIOS: usize = 1_000;
pub const MAX_STUDIO_NAME_LEN: usize = 256;

/// Timestamps must be within [1970-01-01, 2100-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
