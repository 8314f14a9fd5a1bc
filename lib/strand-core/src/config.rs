use std::num::NonZeroUsize;

use serde::Deserialize;

const fn default_auto_yield_threshold() -> usize {
    1024
}

const fn default_trace_buffer_capacity() -> usize {
    16
}

/// Runtime configuration.
///
/// All fields have defaults, so an empty configuration source yields a usable runtime.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfiguration {
    /// Number of worker threads for a dedicated runtime.
    ///
    /// A value of zero uses the available parallelism of the host.
    ///
    /// Defaults to 0.
    worker_threads: usize,

    /// Number of run-loop iterations after which a fiber yields back to the scheduler.
    ///
    /// Defaults to 1024.
    auto_yield_threshold: usize,

    /// Execution tracing.
    tracing: TracingConfiguration,
}

impl RuntimeConfiguration {
    /// Sets the number of worker threads.
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Sets the number of run-loop iterations between forced yields.
    pub fn with_auto_yield_threshold(mut self, threshold: usize) -> Self {
        self.auto_yield_threshold = threshold;
        self
    }

    /// Enables or disables execution tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing.enabled = enabled;
        self
    }

    /// Sets the capacity of each fiber's trace buffer.
    pub fn with_trace_buffer_capacity(mut self, capacity: usize) -> Self {
        self.tracing.buffer_capacity = capacity;
        self
    }

    /// Returns the resolved number of worker threads.
    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
        } else {
            self.worker_threads
        }
    }

    /// Returns the number of run-loop iterations between forced yields.
    ///
    /// Always at least one.
    pub fn auto_yield_threshold(&self) -> usize {
        self.auto_yield_threshold.max(1)
    }

    /// Returns `true` if execution tracing is enabled.
    pub fn tracing_enabled(&self) -> bool {
        self.tracing.enabled
    }

    /// Returns the capacity of each fiber's trace buffer.
    pub fn trace_buffer_capacity(&self) -> usize {
        self.tracing.buffer_capacity
    }
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            auto_yield_threshold: default_auto_yield_threshold(),
            tracing: TracingConfiguration::default(),
        }
    }
}

/// Execution tracing configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TracingConfiguration {
    /// Whether fibers record recently evaluated steps.
    ///
    /// Defaults to `false`.
    enabled: bool,

    /// Maximum number of frames retained per fiber.
    ///
    /// Defaults to 16.
    buffer_capacity: usize,
}

impl Default for TracingConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_capacity: default_trace_buffer_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_uses_defaults() {
        let config: RuntimeConfiguration = serde_json::from_str("{}").unwrap();
        assert!(config.worker_threads() >= 1);
        assert_eq!(config.auto_yield_threshold(), 1024);
        assert!(!config.tracing_enabled());
        assert_eq!(config.trace_buffer_capacity(), 16);
    }

    #[test]
    fn nested_tracing_section() {
        let config: RuntimeConfiguration =
            serde_json::from_str(r#"{ "worker_threads": 3, "tracing": { "enabled": true } }"#).unwrap();
        assert_eq!(config.worker_threads(), 3);
        assert!(config.tracing_enabled());
        assert_eq!(config.trace_buffer_capacity(), 16);
    }

    #[test]
    fn zero_yield_threshold_is_clamped() {
        let config = RuntimeConfiguration::default().with_auto_yield_threshold(0);
        assert_eq!(config.auto_yield_threshold(), 1);
    }
}
