//! Tuning surface of the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest canvas side; positions pack each coordinate into 16 bits.
pub const MAX_DIMENSION: usize = u16::MAX as usize;
/// Largest palette expressible by one base-36 digit per cell.
pub const MAX_PALETTE_SIZE: u8 = 36;

/// Engine configuration. Every field has a default, so a partial TOML table
/// is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Canvas width in cells.
    pub width: usize,
    /// Canvas height in cells.
    pub height: usize,
    /// Number of valid colors on the live canvas.
    pub palette_size: u8,

    /// Per-credential paint interval.
    pub cooldown_ms: u64,
    /// Ceiling for one board connect attempt.
    pub board_open_timeout_ms: u64,
    /// Delay before retrying a failed board connect.
    pub board_retry_ms: u64,
    /// How long a reservation outlives its paint request.
    pub reservation_release_ms: u64,

    /// Fixed retry delay after a transport failure.
    pub network_retry_ms: u64,
    /// Cap on the cooldown multiplier for server errors and rate limiting.
    pub max_error_escalation: u32,
    /// Cooldowning streak after which a credential is marked busy.
    pub busy_threshold: u32,
    /// Cooldowning streak after which a credential is given up as invalid.
    pub busy_give_up: u32,
    /// First busy backoff; doubles with each consecutive cooldowning.
    /// Defaults to the cooldown.
    pub busy_backoff_base_ms: Option<u64>,
    /// Longest busy backoff.
    pub busy_backoff_cap_ms: u64,

    /// Minimum spacing of idle credential validations.
    pub validate_interval_ms: u64,
    /// Longest spacing after failed validations.
    pub validate_backoff_cap_ms: u64,

    /// Interval of full task/credential listings.
    pub reconcile_interval_ms: u64,

    /// Outbound request limits.
    pub throttle: ThrottleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 600,
            palette_size: 32,
            cooldown_ms: 30_000,
            board_open_timeout_ms: 30_000,
            board_retry_ms: 1_000,
            reservation_release_ms: 100,
            network_retry_ms: 1_000,
            max_error_escalation: 10,
            busy_threshold: 3,
            busy_give_up: 10,
            busy_backoff_base_ms: None,
            busy_backoff_cap_ms: 8 * 60_000,
            validate_interval_ms: 5 * 60_000,
            validate_backoff_cap_ms: 60 * 60_000,
            reconcile_interval_ms: 60_000,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Rejects canvas dimensions and palettes the engine cannot address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("width", self.width as u64, 1, MAX_DIMENSION as u64)?;
        check_range("height", self.height as u64, 1, MAX_DIMENSION as u64)?;
        check_range(
            "palette_size",
            u64::from(self.palette_size),
            1,
            u64::from(MAX_PALETTE_SIZE),
        )
    }

    /// `cooldown_ms` as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// `board_open_timeout_ms` as a [`Duration`].
    pub fn board_open_timeout(&self) -> Duration {
        Duration::from_millis(self.board_open_timeout_ms)
    }

    /// `board_retry_ms` as a [`Duration`].
    pub fn board_retry(&self) -> Duration {
        Duration::from_millis(self.board_retry_ms)
    }

    /// `reservation_release_ms` as a [`Duration`].
    pub fn reservation_release(&self) -> Duration {
        Duration::from_millis(self.reservation_release_ms)
    }

    /// `network_retry_ms` as a [`Duration`].
    pub fn network_retry(&self) -> Duration {
        Duration::from_millis(self.network_retry_ms)
    }

    /// First busy backoff, falling back to the cooldown.
    pub fn busy_backoff_base(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_base_ms.unwrap_or(self.cooldown_ms))
    }

    /// `busy_backoff_cap_ms` as a [`Duration`].
    pub fn busy_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_cap_ms)
    }

    /// `validate_interval_ms` as a [`Duration`].
    pub fn validate_interval(&self) -> Duration {
        Duration::from_millis(self.validate_interval_ms)
    }

    /// `validate_backoff_cap_ms` as a [`Duration`].
    pub fn validate_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.validate_backoff_cap_ms)
    }

    /// `reconcile_interval_ms` as a [`Duration`].
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, value, min, max })
    }
}

/// Global outbound request budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Sustained requests per second on each egress route.
    pub requests_per_second: f64,
    /// Slots that may accumulate while idle.
    pub burst: usize,
    /// Number of egress routes sharing the budget.
    pub routes: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20.0,
            burst: 20,
            routes: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"cooldown_ms": 1000, "throttle": {"routes": 2}}"#).unwrap();
        assert_eq!(cfg.cooldown(), Duration::from_secs(1));
        assert_eq!(cfg.busy_backoff_base(), Duration::from_secs(1));
        assert_eq!(cfg.throttle.routes, 2);
        assert_eq!(cfg.throttle.burst, 20);
        assert_eq!(cfg.width, 1000);
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn dimensions_must_fit_packed_positions() {
        let mut cfg = EngineConfig {
            width: MAX_DIMENSION,
            height: 1,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.validate(), Ok(()));

        cfg.width = MAX_DIMENSION + 1;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                field: "width",
                value: 65_536,
                min: 1,
                max: 65_535,
            })
        );

        cfg.width = 10;
        cfg.height = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "height", value: 0, .. })
        ));
    }

    #[test]
    fn palette_must_be_base36() {
        let mut cfg = EngineConfig {
            palette_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "palette_size", .. })
        ));
        cfg.palette_size = 37;
        assert!(cfg.validate().is_err());
        cfg.palette_size = 36;
        assert!(cfg.validate().is_ok());
    }
}
