//! Event loop configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};

/// Event loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Size of the buffer used for a single read from a stream
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Upper bound on connections accepted from one listening socket per
    /// readiness notification, so a busy listener cannot starve other handles
    #[serde(default = "default_max_accepts_per_tick")]
    pub max_accepts_per_tick: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            max_accepts_per_tick: default_max_accepts_per_tick(),
        }
    }
}

impl Validatable for EventLoopConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.read_buffer_size, "read_buffer_size", self.domain_name())?;
        validate_positive(
            self.max_accepts_per_tick,
            "max_accepts_per_tick",
            self.domain_name(),
        )?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "event_loop"
    }
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_max_accepts_per_tick() -> usize {
    128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_loop_config_defaults() {
        let config = EventLoopConfig::default();
        assert_eq!(config.read_buffer_size, 65536);
        assert_eq!(config.max_accepts_per_tick, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_event_loop_config_validation() {
        let mut config = EventLoopConfig::default();
        config.read_buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = EventLoopConfig::default();
        config.max_accepts_per_tick = 0;
        assert!(config.validate().is_err());
    }
}
