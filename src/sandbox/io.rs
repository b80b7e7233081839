//! Guest console output: forwarded to `tracing` and kept in a bounded buffer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Log target used for every line the guest prints.
pub const GUEST_LOG_TARGET: &str = "event_sandbox::guest";

/// Console method the guest called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    /// All methods, in the order they are installed on `console`.
    pub const ALL: [ConsoleLevel; 5] = [
        ConsoleLevel::Log,
        ConsoleLevel::Info,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
        ConsoleLevel::Debug,
    ];

    /// The `console` method name.
    pub fn method(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// One line of guest console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
}

/// Shared, bounded record of guest console output.
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone, Debug)]
pub struct ConsoleCapture {
    entries: Arc<Mutex<VecDeque<ConsoleEntry>>>,
    capacity: usize,
    enabled: bool,
}

impl ConsoleCapture {
    /// Create a capture that keeps at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
            enabled: true,
        }
    }

    /// A capture that swallows everything.
    pub fn silent() -> Self {
        Self {
            enabled: false,
            ..Self::new(0)
        }
    }

    /// Whether output is forwarded at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Render `args` the way a console prints them, log the line and keep it.
    pub fn emit(&self, level: ConsoleLevel, args: &[Option<Value>]) {
        if !self.enabled {
            return;
        }
        let message = render_args(args);

        match level {
            ConsoleLevel::Log | ConsoleLevel::Info => {
                tracing::info!(target: GUEST_LOG_TARGET, method = %level, "{}", message)
            }
            ConsoleLevel::Warn => tracing::warn!(target: GUEST_LOG_TARGET, "{}", message),
            ConsoleLevel::Error => tracing::error!(target: GUEST_LOG_TARGET, "{}", message),
            ConsoleLevel::Debug => tracing::debug!(target: GUEST_LOG_TARGET, "{}", message),
        }

        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(ConsoleEntry { level, message });
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn entries(&self) -> Vec<ConsoleEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Retained messages only, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.message.clone()).collect()
    }

    /// Drop all retained lines.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of retained lines.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ConsoleEntry>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ConsoleCapture {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Strings print raw, `undefined` prints as such, everything else as JSON.
fn render_args(args: &[Option<Value>]) -> String {
    args.iter()
        .map(|arg| match arg {
            None => "undefined".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
