//! Host backend configuration.

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`HostConfig::devices`].
pub const DEVICES_ENV: &str = "UNIRT_HOST_DEVICES";
/// Environment variable overriding [`HostConfig::max_streams_per_device`].
pub const STREAMS_ENV: &str = "UNIRT_HOST_STREAMS";
/// Environment variable overriding [`HostConfig::memory_per_device`].
pub const MEMORY_ENV: &str = "UNIRT_HOST_MEMORY";

/// Errors reading a [`HostConfig`] from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable did not hold a valid number.
    #[error("{var}={value:?} is not a valid count")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// The configuration describes no usable device.
    #[error("host backend needs at least one device")]
    NoDevices,
}

/// Configuration of a [`HostDriver`](crate::HostDriver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Number of simulated devices.
    pub devices: usize,
    /// Live streams allowed per device.
    pub max_streams_per_device: usize,
    /// Bytes of device memory per device.
    pub memory_per_device: usize,
    /// Prefix of device names.
    pub name_prefix: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            max_streams_per_device: 64,
            memory_per_device: 256 * 1024 * 1024,
            name_prefix: "unirt host device".to_string(),
        }
    }
}

impl HostConfig {
    /// Creates a configuration with `devices` devices.
    #[must_use]
    pub fn with_devices(devices: usize) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }

    /// Default configuration overridden by `UNIRT_HOST_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let parse = |var: &'static str| -> Result<Option<usize>, ConfigError> {
            lookup(var)
                .map(|value| {
                    value
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| ConfigError::InvalidNumber { var, value })
                })
                .transpose()
        };

        if let Some(devices) = parse(DEVICES_ENV)? {
            config.devices = devices;
        }
        if let Some(streams) = parse(STREAMS_ENV)? {
            config.max_streams_per_device = streams;
        }
        if let Some(memory) = parse(MEMORY_ENV)? {
            config.memory_per_device = memory;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices == 0 {
            return Err(ConfigError::NoDevices);
        }
        Ok(())
    }
}
