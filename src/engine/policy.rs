use crate::model::Ms;

use super::EngineError;

/// Per-engine policy knobs. Studios override these at engine creation.
#[derive(Debug, Clone, Copy)]
pub struct PolicyConfig {
    /// Cancellation cut-off before class start (default: 2 hours).
    pub cancellation_window_ms: Ms,
    /// How long a pending_payment booking may hold its seat unpaid.
    pub pending_payment_ttl_ms: Ms,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cancellation_window_ms: 2 * 3_600_000,
            pending_payment_ttl_ms: 30 * 60_000,
        }
    }
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Cancellation is disallowed once `now > class_start - window`.
/// The deadline instant itself still allows cancellation.
pub fn cancellation_allowed(class_start: Ms, now: Ms, window_ms: Ms) -> bool {
    now <= class_start - window_ms
}

/// A pending_payment booking is stale once its TTL has fully elapsed.
pub fn pending_expired(created_at: Ms, now: Ms, ttl_ms: Ms) -> bool {
    now >= created_at + ttl_ms
}

pub(crate) fn validate_time(ts: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&ts) {
        return Err(EngineError::LimitExceeded("timestamp outside supported range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    #[test]
    fn allowed_well_before_window() {
        // Class at t=10h, 2h window: cancelling at 7h is fine.
        assert!(cancellation_allowed(10 * H, 7 * H, 2 * H));
    }

    #[test]
    fn deadline_instant_still_allowed() {
        assert!(cancellation_allowed(10 * H, 8 * H, 2 * H));
    }

    #[test]
    fn closed_inside_window() {
        assert!(!cancellation_allowed(10 * H, 8 * H + 1, 2 * H));
        assert!(!cancellation_allowed(10 * H, 9 * H, 2 * H));
    }

    #[test]
    fn window_is_configurable() {
        // 1h before start: closed under 2h window, open under 30min window.
        assert!(!cancellation_allowed(10 * H, 9 * H, 2 * H));
        assert!(cancellation_allowed(10 * H, 9 * H, H / 2));
    }

    #[test]
    fn pending_ttl_boundary() {
        assert!(!pending_expired(1_000, 1_999, 1_000));
        assert!(pending_expired(1_000, 2_000, 1_000));
        assert!(pending_expired(1_000, 5_000, 1_000));
    }

    #[test]
    fn time_range_validation() {
        assert!(validate_time(0).is_ok());
        assert!(validate_time(-1).is_err());
        assert!(validate_time(crate::limits::MAX_VALID_TIMESTAMP_MS).is_err());
    }
}
