//! Sandbox configuration with builder pattern.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::{Map, Value};

/// Globals that stay reachable from guest code unless the host narrows the list.
pub const DEFAULT_ALLOWED_GLOBALS: &[&str] = &[
    "Math",
    "JSON",
    "Date",
    "Array",
    "Object",
    "String",
    "Number",
    "Boolean",
    "Promise",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "encodeURIComponent",
    "decodeURIComponent",
    "RegExp",
];

/// Configuration for a [`SecureSandbox`](crate::SecureSandbox).
///
/// Immutable once a sandbox has been constructed from it.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum wall-clock time of a single evaluation.
    pub timeout: Duration,
    /// Memory ceiling of the guest runtime, in megabytes.
    pub memory_limit_mb: usize,
    /// Whether guest `console.*` calls reach the host log.
    pub enable_console: bool,
    /// Names of standard globals the guest may see.
    pub allowed_globals: BTreeSet<String>,
    /// Extra read-only data copied into the guest global object.
    pub inject_vars: Map<String, Value>,
    /// Guest stack ceiling in bytes.
    pub max_stack_size: usize,
    /// Largest program, in bytes, accepted for evaluation.
    pub max_code_size: usize,
    /// How many console lines a sandbox keeps for inspection.
    pub max_console_entries: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            memory_limit_mb: 32,
            enable_console: true,
            allowed_globals: DEFAULT_ALLOWED_GLOBALS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            inject_vars: Map::new(),
            max_stack_size: 256 * 1024,
            max_code_size: 1024 * 1024, // 1MB
            max_console_entries: 1000,
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// The memory ceiling converted to bytes.
    pub fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    /// Check whether `name` is on the allow-list.
    pub fn allows(&self, name: &str) -> bool {
        self.allowed_globals.contains(name)
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    timeout: Option<Duration>,
    memory_limit_mb: Option<usize>,
    enable_console: Option<bool>,
    allowed_globals: Option<BTreeSet<String>>,
    inject_vars: Map<String, Value>,
    max_stack_size: Option<usize>,
    max_code_size: Option<usize>,
    max_console_entries: Option<usize>,
}

impl SandboxConfigBuilder {
    /// Set the maximum execution timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the memory ceiling in megabytes.
    pub fn memory_limit_mb(mut self, mb: usize) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    /// Enable or disable forwarding of guest console output.
    pub fn enable_console(mut self, enabled: bool) -> Self {
        self.enable_console = Some(enabled);
        self
    }

    /// Replace the allow-list of standard globals.
    pub fn allowed_globals<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_globals = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Copy `value` into the guest global object under `name`.
    pub fn inject_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inject_vars.insert(name.into(), value);
        self
    }

    /// Set the guest stack ceiling in bytes.
    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    /// Set the largest accepted program size in bytes.
    pub fn max_code_size(mut self, bytes: usize) -> Self {
        self.max_code_size = Some(bytes);
        self
    }

    /// Set how many console lines are retained.
    pub fn max_console_entries(mut self, entries: usize) -> Self {
        self.max_console_entries = Some(entries);
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        let default = SandboxConfig::default();
        SandboxConfig {
            timeout: self.timeout.unwrap_or(default.timeout),
            memory_limit_mb: self.memory_limit_mb.unwrap_or(default.memory_limit_mb),
            enable_console: self.enable_console.unwrap_or(default.enable_console),
            allowed_globals: self.allowed_globals.unwrap_or(default.allowed_globals),
            inject_vars: self.inject_vars,
            max_stack_size: self.max_stack_size.unwrap_or(default.max_stack_size),
            max_code_size: self.max_code_size.unwrap_or(default.max_code_size),
            max_console_entries: self
                .max_console_entries
                .unwrap_or(default.max_console_entries),
        }
    }
}
