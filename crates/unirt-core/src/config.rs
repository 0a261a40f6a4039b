//! Queue configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a command queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of native compute streams (forced to 1 for in-order queues).
    pub num_compute_streams: usize,
    /// Whether to use a dedicated transfer stream for buffer copies.
    /// Ignored for in-order queues.
    pub use_transfer_stream: bool,
    /// Whether commands execute in submission order.
    pub in_order: bool,
    /// Whether events carry profiling timestamps.
    pub enable_profiling: bool,
    /// Whether wait-list entries that already completed skip the
    /// device-side wait.
    pub skip_completed_waits: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_compute_streams: 1,
            use_transfer_stream: false,
            in_order: true,
            enable_profiling: false,
            skip_completed_waits: true,
        }
    }
}

impl QueueConfig {
    /// Creates an out-of-order configuration (4 compute streams + transfer).
    #[must_use]
    pub fn out_of_order() -> Self {
        Self {
            num_compute_streams: 4,
            use_transfer_stream: true,
            in_order: false,
            enable_profiling: false,
            skip_completed_waits: true,
        }
    }

    /// Creates an in-order configuration with profiling enabled.
    #[must_use]
    pub fn profiling() -> Self {
        Self {
            enable_profiling: true,
            ..Self::default()
        }
    }

    /// Number of compute streams the queue actually creates.
    #[must_use]
    pub fn effective_compute_streams(&self) -> usize {
        if self.in_order {
            1
        } else {
            self.num_compute_streams
        }
    }

    /// Whether the queue creates a transfer stream.
    #[must_use]
    pub fn effective_transfer_stream(&self) -> bool {
        self.use_transfer_stream && !self.in_order
    }
}

/// Builder for QueueConfig.
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an out-of-order configuration builder.
    #[must_use]
    pub fn out_of_order() -> Self {
        Self {
            config: QueueConfig::out_of_order(),
        }
    }

    /// Sets the number of compute streams.
    #[must_use]
    pub fn with_compute_streams(mut self, count: usize) -> Self {
        self.config.num_compute_streams = count;
        self
    }

    /// Enables or disables the transfer stream.
    #[must_use]
    pub fn with_transfer_stream(mut self, enabled: bool) -> Self {
        self.config.use_transfer_stream = enabled;
        self
    }

    /// Sets in-order execution.
    #[must_use]
    pub fn with_in_order(mut self, in_order: bool) -> Self {
        self.config.in_order = in_order;
        self
    }

    /// Enables or disables event profiling.
    #[must_use]
    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.config.enable_profiling = enabled;
        self
    }

    /// Enables or disables skipping waits on completed events.
    #[must_use]
    pub fn with_skip_completed_waits(mut self, enabled: bool) -> Self {
        self.config.skip_completed_waits = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> QueueConfig {
        self.config
    }
}
