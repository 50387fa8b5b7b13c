//! Runtime configuration (jitrt.toml)
//!
//! Every field has a default, so an empty file or `RuntimeConfig::default()`
//! yields a working runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default code heap capacity in bytes (48 MB).
pub const DEFAULT_CODE_CACHE_CAPACITY: usize = 48 * 1024 * 1024;

/// Default number of (exception klass, pc) pairs cached per compiled unit.
pub const DEFAULT_EXCEPTION_CACHE_CAPACITY: usize = 16;

/// Default maximum number of methods with counters.
pub const DEFAULT_MAX_METHOD_COUNTERS: usize = 1 << 20;

/// Decompiles of one method after which it is no longer compiled.
pub const DEFAULT_RECOMPILATION_CUTOFF: u32 = 400;

/// Alignment of units in the code heap.
pub const CODE_ENTRY_ALIGNMENT: usize = 32;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Configuration for a `JitRuntime`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Code heap capacity in bytes
    pub code_cache_capacity: usize,
    /// Per-unit exception cache size
    pub exception_cache_capacity: usize,
    /// Upper bound on the method counters registry
    pub max_method_counters: usize,
    /// Decompile count after which a method is marked not compilable
    pub per_method_recompilation_cutoff: u32,
    /// Register units that embed movable objects as GC roots
    pub scavenge_roots_in_code: bool,
    /// Log every dependency of every install attempt
    pub log_dependencies: bool,
    /// Log each exception dispatched through compiled code
    pub trace_exceptions: bool,
    /// Log when a standard entry replaces an older unit
    pub trace_method_replacement: bool,
    /// Log each successful install
    pub trace_installs: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            code_cache_capacity: DEFAULT_CODE_CACHE_CAPACITY,
            exception_cache_capacity: DEFAULT_EXCEPTION_CACHE_CAPACITY,
            max_method_counters: DEFAULT_MAX_METHOD_COUNTERS,
            per_method_recompilation_cutoff: DEFAULT_RECOMPILATION_CUTOFF,
            scavenge_roots_in_code: true,
            log_dependencies: false,
            trace_exceptions: false,
            trace_method_replacement: false,
            trace_installs: false,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check field ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.code_cache_capacity < CODE_ENTRY_ALIGNMENT {
            return Err(ConfigError::ValidationError(format!(
                "code_cache_capacity must be at least {} bytes",
                CODE_ENTRY_ALIGNMENT
            )));
        }
        if self.max_method_counters == 0 {
            return Err(ConfigError::ValidationError(
                "max_method_counters must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
