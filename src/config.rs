use crate::error::{Error, Result};
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker thread target; `None` means one per hardware thread.
    pub num_threads: Option<usize>,
    /// Control-thread tick. The scheduler re-evaluates pool size and
    /// deferred cancellations at this interval (it also wakes early on
    /// scheduling events).
    pub tick: Duration,
    /// Hysteresis threshold for shrinking the pool: the trend counter
    /// must fall below `-trend_threshold` before idle workers retire.
    pub trend_threshold: i32,
    /// Emit [`crate::telemetry`] events from the control thread.
    pub trace_events: bool,

    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: None,
            tick: Duration::from_millis(50),
            trend_threshold: 50,
            trace_events: true,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "weft-worker".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.num_threads {
            if n == 0 {
                return Err(Error::config("num_threads must be > 0"));
            }
            if n > 1024 {
                return Err(Error::config("num_threads too large (max 1024)"));
            }
        }

        if self.tick.is_zero() {
            return Err(Error::config("tick must be > 0"));
        }

        if self.trend_threshold <= 0 {
            return Err(Error::config("trend_threshold must be > 0"));
        }

        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = Some(n);
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.config.tick = tick;
        self
    }

    pub fn trend_threshold(mut self, threshold: i32) -> Self {
        self.config.trend_threshold = threshold;
        self
    }

    pub fn trace_events(mut self, enable: bool) -> Self {
        self.config.trace_events = enable;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let result = Config::builder().num_threads(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_tick_rejected() {
        let result = Config::builder().tick(Duration::ZERO).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .num_threads(3)
            .tick(Duration::from_millis(10))
            .thread_name_prefix("test-pool")
            .build()
            .unwrap();

        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.tick, Duration::from_millis(10));
        assert_eq!(config.thread_name_prefix, "test-pool");
    }
}
