use serde::{Deserialize, Serialize};

use crate::core::errors::{DroverError, Result};

fn default_channel_capacity() -> usize {
    64
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_max_parallel() -> usize {
    8
}

/// Tuning knobs for a single task runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Buffered capacity of each status/stdout/stderr channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Chunk size used when pumping subprocess output
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl TaskOptions {
    /// Validates option values
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(DroverError::configuration_field(
                "channel_capacity must be greater than 0",
                "channel_capacity",
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(DroverError::configuration_field(
                "read_buffer_size must be greater than 0",
                "read_buffer_size",
            ));
        }
        Ok(())
    }
}

/// Configuration for dependency-graph execution behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of node bodies executing at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

impl SchedulerConfig {
    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(DroverError::configuration_field(
                "max_parallel must be greater than 0",
                "max_parallel",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TaskOptions::default().validate().is_ok());
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let opts = TaskOptions {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let config = SchedulerConfig { max_parallel: 0 };
        assert!(config.validate().is_err());
    }
}
