//! Engine configuration
//!
//! Precedence is environment > file > defaults. Files are TOML:
//!
//! ```toml
//! chunk_size = 8192
//! handshake_timeout_ms = 1000
//! spawn_mode = "wrapper"
//!
//! [wrapper]
//! program = "/opt/piperun/bin/piperun-wrapper"
//! args = []
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Bytes requested from the OS per stream read.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Upper bound for the wrapper to connect back and report the child pid.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 1000;

/// File name of the wrapper executable shipped with piperun.
pub const WRAPPER_BINARY_NAME: &str = "piperun-wrapper";

/// How child processes are launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    /// Spawn the command directly and use native pipes and signals.
    Direct,
    /// Spawn through the wrapper executable and its control socket.
    Wrapper,
}

impl SpawnMode {
    /// `Wrapper` on Windows, `Direct` everywhere else.
    #[must_use]
    pub const fn platform_default() -> Self {
        if cfg!(windows) { Self::Wrapper } else { Self::Direct }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Wrapper => "wrapper",
        }
    }
}

impl Default for SpawnMode {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl std::str::FromStr for SpawnMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "wrapper" => Ok(Self::Wrapper),
            other => Err(ConfigError::InvalidValue {
                key: "spawn_mode".to_string(),
                reason: format!("expected 'direct' or 'wrapper', got '{other}'"),
            }),
        }
    }
}

/// Which executable acts as the wrapper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WrapperConfig {
    /// Explicit wrapper path; discovered when unset.
    pub program: Option<PathBuf>,
    /// Extra arguments placed before anything the engine passes.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub handshake_timeout_ms: u64,
    pub spawn_mode: SpawnMode,
    pub wrapper: WrapperConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            spawn_mode: SpawnMode::platform_default(),
            wrapper: WrapperConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Apply `PIPERUN_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PIPERUN_CHUNK_SIZE") {
            self.chunk_size = parse_number("PIPERUN_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = lookup("PIPERUN_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = parse_number("PIPERUN_HANDSHAKE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("PIPERUN_SPAWN_MODE") {
            self.spawn_mode = value.parse()?;
        }
        if let Some(value) = lookup("PIPERUN_WRAPPER") {
            if !value.trim().is_empty() {
                self.wrapper.program = Some(PathBuf::from(value));
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "chunk_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "handshake_timeout_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Locate the wrapper executable.
    ///
    /// Order: configured program, `PIPERUN_WRAPPER`, `piperun-wrapper` next to the
    /// current executable, then `PATH`.
    pub fn resolve_wrapper_program(&self) -> Result<PathBuf, ConfigError> {
        self.resolve_wrapper_program_with(|key| std::env::var(key).ok())
    }

    /// [`EngineConfig::resolve_wrapper_program`] with environment lookups going
    /// through `lookup`.
    pub fn resolve_wrapper_program_with<F>(&self, lookup: F) -> Result<PathBuf, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(program) = &self.wrapper.program {
            return Ok(program.clone());
        }
        if let Some(program) = lookup("PIPERUN_WRAPPER").filter(|value| !value.trim().is_empty()) {
            return Ok(PathBuf::from(program));
        }

        let file_name = format!("{WRAPPER_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX);
        if let Some(sibling) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
            .filter(|candidate| candidate.is_file())
        {
            return Ok(sibling);
        }

        which::which(WRAPPER_BINARY_NAME).map_err(|e| ConfigError::WrapperNotFound {
            reason: format!("{WRAPPER_BINARY_NAME} is not next to the current executable or on PATH: {e}"),
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("'{value}' is not a valid number"),
    })
}
