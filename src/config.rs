use crate::backpressure::RefillController;
use crate::error::{Result, StreamError};
use serde::Deserialize;

/// Where a run is driven from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    /// Link and start the chain on the calling thread
    #[default]
    Inline,
    /// Link and start the chain on a dedicated worker thread
    Spawned,
}

/// Engine-wide settings shared by every run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity used by `buffer` stages that do not name one
    pub default_buffer_capacity: usize,
    /// Elements a terminal stage keeps requested ahead of consumption
    pub terminal_prefetch: u64,
    /// Refill policy for buffers and terminal prefetch
    pub refill: RefillController,
    pub execution: Execution,
    /// Name prefix of worker threads when `execution` is `Spawned`
    pub thread_name: String,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            default_buffer_capacity: 16,
            terminal_prefetch: 256,
            refill: RefillController::new(),
            execution: Execution::Inline,
            thread_name: "stream-run".to_string(),
        }
    }

    pub fn with_default_buffer_capacity(mut self, capacity: usize) -> Self {
        self.default_buffer_capacity = capacity;
        self
    }

    pub fn with_terminal_prefetch(mut self, prefetch: u64) -> Self {
        self.terminal_prefetch = prefetch;
        self
    }

    pub fn with_refill(mut self, refill: RefillController) -> Self {
        self.refill = refill;
        self
    }

    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Parse a configuration from JSON, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_buffer_capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "default_buffer_capacity must be greater than zero".into(),
            ));
        }
        if self.terminal_prefetch == 0 {
            return Err(StreamError::InvalidConfig(
                "terminal_prefetch must be greater than zero".into(),
            ));
        }
        self.refill.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
