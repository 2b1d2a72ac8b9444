//! Exponential backoff schedule used between fetch attempts.
//!
//! The schedule is a pure mapping from attempt number to wait time:
//! attempt 0 runs immediately, attempt `n` waits `2^(n-1) * scale`, and
//! from `max_retries` onwards every attempt waits `max_delay`. Retries never
//! stop on their own; the ceiling is simply held.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Largest exponent we ever shift by. Anything past this is far beyond any
/// sensible ceiling and would overflow a u64 of milliseconds.
const MAX_EXPONENT: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSchedule {
    pub scale: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl BackoffSchedule {
    /// Location lookups: 50ms scale, 30 minute ceiling, reached at attempt 17.
    pub const LOCATION: BackoffSchedule = BackoffSchedule {
        scale: Duration::from_millis(50),
        max_delay: Duration::from_secs(30 * 60),
        max_retries: 17,
    };

    /// Account data lookups: 1s scale, 5 minute ceiling, reached at attempt 10.
    pub const ACCOUNT: BackoffSchedule = BackoffSchedule {
        scale: Duration::from_secs(1),
        max_delay: Duration::from_secs(5 * 60),
        max_retries: 10,
    };

    /// Build a schedule with an explicit retry count, rejecting degenerate values.
    pub fn try_new(
        scale: Duration,
        max_delay: Duration,
        max_retries: u32,
    ) -> Result<Self, SettingsError> {
        if scale.is_zero() {
            return Err(SettingsError::InvalidSchedule(
                "scale must be non-zero".to_string(),
            ));
        }
        if max_delay < scale {
            return Err(SettingsError::InvalidSchedule(format!(
                "max delay {:?} is shorter than scale {:?}",
                max_delay, scale
            )));
        }
        if max_retries == 0 {
            return Err(SettingsError::InvalidSchedule(
                "max retries must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            scale,
            max_delay,
            max_retries,
        })
    }

    /// Build a schedule whose `max_retries` is the smallest n such that
    /// `2^(n-1) * scale >= max_delay`.
    pub fn from_scale_and_cap(scale: Duration, max_delay: Duration) -> Result<Self, SettingsError> {
        let scale_ms = scale.as_millis().max(1);
        let cap_ms = max_delay.as_millis();

        let mut retries = 1;
        while retries <= MAX_EXPONENT && (scale_ms << (retries - 1)) < cap_ms {
            retries += 1;
        }

        Self::try_new(scale, max_delay, retries)
    }

    /// Wait before attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        if attempt >= self.max_retries {
            return self.max_delay;
        }

        let exponent = (attempt - 1).min(MAX_EXPONENT);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.scale
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::LOCATION
    }
}
