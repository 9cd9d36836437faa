//! Typed module and export settings.
//!
//! The host parses its textual configuration itself; by the time values reach
//! this crate they are already typed. Validation here enforces the recognized
//! ranges and rejects inconsistent combinations at export-creation time.

use serde::{Deserialize, Serialize};

use crate::types::{BackendError, BackendResult};

/// Upper bound for the inline inode payload, in bytes (2 MiB).
pub const MAX_INODE_SIZE: u32 = 0x20_0000;

/// Upper bound for the async worker thread count.
pub const MAX_ASYNC_THREADS: u32 = 100;

/// Module-wide settings, committed once at configuration time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Size of data stored inline in each inode, bytes. 0..=2 MiB.
    pub inode_size: u32,
    /// Poll interval for the background update thread, seconds.
    pub up_interval: u32,
    /// Number of async worker threads. 0 disables the pool entirely.
    pub async_threads: u32,
    /// Whether directory enumeration cursors are derived from entry names
    /// instead of ordinal positions. Affects only cursor encoding.
    pub whence_is_name: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            inode_size: 0,
            up_interval: 0,
            async_threads: 0,
            whence_is_name: false,
        }
    }
}

impl ModuleConfig {
    /// Validates all settings against their recognized ranges.
    pub fn validate(&self) -> BackendResult<()> {
        if self.inode_size > MAX_INODE_SIZE {
            return Err(BackendError::ConfigInvalid {
                field: "inode_size",
                reason: format!("{} exceeds maximum {}", self.inode_size, MAX_INODE_SIZE),
            });
        }
        if self.async_threads > MAX_ASYNC_THREADS {
            return Err(BackendError::ConfigInvalid {
                field: "async_threads",
                reason: format!(
                    "{} exceeds maximum {}",
                    self.async_threads, MAX_ASYNC_THREADS
                ),
            });
        }
        Ok(())
    }
}

/// How simulated latency is applied to deferred operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DelayMode {
    /// Run the operation inline on the calling thread.
    #[default]
    Inline,
    /// Coin flip between inline execution and a randomized deferral.
    RandomOrInline,
    /// Defer with a random delay up to the configured base.
    Random,
    /// Defer with exactly the configured base delay.
    Fixed,
}

impl DelayMode {
    /// Human-readable name, matching the config surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayMode::Inline => "inline",
            DelayMode::RandomOrInline => "random_or_inline",
            DelayMode::Random => "random",
            DelayMode::Fixed => "fixed",
        }
    }
}

/// Per-export simulated latency policy for deferred work.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DelayPolicy {
    /// Dispatch mode.
    pub mode: DelayMode,
    /// Base delay before a deferred operation runs, milliseconds.
    pub delay_ms: u32,
    /// Extra stall applied after the operation completes, milliseconds.
    pub stall_ms: u32,
}

/// Per-export settings supplied at mount time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Path naming this export's namespace root.
    pub path: String,
    /// Simulated latency policy for this export.
    pub delay: DelayPolicy,
}

impl ExportConfig {
    /// Creates a config for the given export path with no delay injection.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            delay: DelayPolicy::default(),
        }
    }

    /// Validates the export settings.
    pub fn validate(&self) -> BackendResult<()> {
        if self.path.is_empty() {
            return Err(BackendError::ConfigInvalid {
                field: "path",
                reason: "export path must not be empty".into(),
            });
        }
        if self.delay.mode != DelayMode::Inline && self.delay.delay_ms == 0 {
            return Err(BackendError::ConfigInvalid {
                field: "delay",
                reason: format!(
                    "mode '{}' requires a non-zero base delay",
                    self.delay.mode.as_str()
                ),
            });
        }
        Ok(())
    }
}
