//! Static pre-screening of handler code.
//!
//! Pattern matching is advisory. It surfaces editor-time warnings and log
//! events; containment is provided by the isolated guest context, and code
//! that passes here is still executed only inside it.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use rquickjs::{Context, Module, Runtime};
use serde::Serialize;

use crate::error::{classify_guest_exception, SandboxError};
use crate::sandbox::executor::LOCAL_BINDINGS;
use crate::sandbox::limits::{ArmedClock, ExecutionClock};
use crate::sandbox::marshal;

/// Memory ceiling of the scratch runtime used for parse-only checks.
const SYNTAX_CHECK_MEMORY: usize = 16 * 1024 * 1024;
/// Wall-clock bound on the scratch runtime used for parse-only checks.
const SYNTAX_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// What a detector looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Eval,
    FunctionConstructor,
    HostApiAccess,
    Network,
    DangerousGlobal,
    SyntaxError,
}

/// How serious a match is. Only `High` makes code invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

/// One match of one detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DangerousPattern {
    pub kind: PatternKind,
    /// The matched source text.
    pub matched_text: String,
    /// Byte offset of the match in the code.
    pub position: usize,
    pub severity: Severity,
    pub description: String,
}

/// Outcome of [`CodeValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ValidationResult {
    /// `false` iff at least one `High` pattern matched.
    pub valid: bool,
    pub dangerous_patterns: Vec<DangerousPattern>,
    /// Fix suggestions, without duplicates, in first-seen order.
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    fn from_patterns(dangerous_patterns: Vec<DangerousPattern>) -> Self {
        let mut suggestions: Vec<String> = Vec::new();
        for pattern in &dangerous_patterns {
            if let Some(suggestion) = suggestion_for(pattern.kind) {
                if !suggestions.iter().any(|s| s == suggestion) {
                    suggestions.push(suggestion.to_string());
                }
            }
        }
        let valid = !dangerous_patterns
            .iter()
            .any(|p| p.severity == Severity::High);

        Self {
            valid,
            dangerous_patterns,
            suggestions,
        }
    }

    /// Matches of the given kind.
    pub fn patterns_of(&self, kind: PatternKind) -> impl Iterator<Item = &DangerousPattern> {
        self.dangerous_patterns.iter().filter(move |p| p.kind == kind)
    }

    /// Highest severity among the matches.
    pub fn max_severity(&self) -> Option<Severity> {
        self.dangerous_patterns.iter().map(|p| p.severity).max()
    }

    /// Summarize the matches as a [`SandboxError::Validation`], for hosts
    /// that want to reject invalid code themselves.
    pub fn to_error(&self) -> Option<SandboxError> {
        if self.valid {
            return None;
        }
        let summary = self
            .dangerous_patterns
            .iter()
            .filter(|p| p.severity == Severity::High)
            .map(|p| format!("{} at {}", p.matched_text, p.position))
            .collect::<Vec<_>>()
            .join(", ");
        Some(SandboxError::Validation(summary))
    }
}

/// Outcome of [`CodeValidator::check_syntax`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyntaxCheck {
    pub valid: bool,
    /// First parse failure, e.g. `SyntaxError: unexpected token in expression: '}'`.
    pub error: Option<String>,
}

struct Detector {
    kind: PatternKind,
    regex: Regex,
    severity: Severity,
    description: &'static str,
}

const DETECTOR_SOURCES: &[(PatternKind, &str, Severity, &str)] = &[
    (
        PatternKind::Eval,
        r"\beval\s*\(",
        Severity::High,
        "eval() can run arbitrary code",
    ),
    (
        PatternKind::FunctionConstructor,
        r"\bnew\s+Function\s*\(",
        Severity::High,
        "the Function constructor can run arbitrary code",
    ),
    (
        PatternKind::HostApiAccess,
        r"\b(document|window|location|navigator|localStorage|sessionStorage|indexedDB|fetch|XMLHttpRequest|WebSocket)\b",
        Severity::Medium,
        "host page APIs may leak information or act on the user's behalf",
    ),
    (
        PatternKind::Network,
        r"\b(fetch|XMLHttpRequest|WebSocket|navigator\.sendBeacon)\s*\(",
        Severity::High,
        "network requests may send data to an untrusted server",
    ),
    (
        PatternKind::DangerousGlobal,
        r"\b(top|parent|self|frames|opener|__proto__|constructor|prototype)\b",
        Severity::Medium,
        "special globals and prototype internals are common sandbox escape routes",
    ),
];

static DETECTORS: LazyLock<Vec<Detector>> = LazyLock::new(|| {
    DETECTOR_SOURCES
        .iter()
        .filter_map(|&(kind, source, severity, description)| {
            match Regex::new(&format!("(?i){source}")) {
                Ok(regex) => Some(Detector {
                    kind,
                    regex,
                    severity,
                    description,
                }),
                Err(err) => {
                    tracing::error!(?kind, "failed to compile detector: {}", err);
                    None
                }
            }
        })
        .collect()
});

fn suggestion_for(kind: PatternKind) -> Option<&'static str> {
    match kind {
        PatternKind::Eval => Some("Avoid eval(); use JSON.parse() or another explicit parser"),
        PatternKind::FunctionConstructor => {
            Some("Avoid new Function(); define the function with an arrow function instead")
        }
        PatternKind::HostApiAccess => {
            Some("Avoid touching host page APIs; use dispatch() and getState() to work with application state")
        }
        _ => None,
    }
}

/// Pattern and parse checks over handler code.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeValidator;

impl CodeValidator {
    /// Run every detector over `code` and collect all matches, ordered by
    /// detector and then by position.
    pub fn validate(code: &str) -> ValidationResult {
        let patterns = DETECTORS
            .iter()
            .flat_map(|detector| {
                detector.regex.find_iter(code).map(|m| DangerousPattern {
                    kind: detector.kind,
                    matched_text: m.as_str().to_string(),
                    position: m.start(),
                    severity: detector.severity,
                    description: detector.description.to_string(),
                })
            })
            .collect();
        ValidationResult::from_patterns(patterns)
    }

    /// Parse `code` as a function body without running it.
    ///
    /// The body is wrapped the way the sandbox wraps it and compiled as a
    /// module in a scratch runtime. The module is declared but never
    /// evaluated, so code that closes the wrapper early is still only parsed.
    pub fn check_syntax(code: &str) -> SyntaxCheck {
        match parse_only(code) {
            Ok(()) => SyntaxCheck {
                valid: true,
                error: None,
            },
            Err(err) => SyntaxCheck {
                valid: false,
                error: Some(err.to_string()),
            },
        }
    }

    /// [`validate`](Self::validate) plus [`check_syntax`](Self::check_syntax);
    /// a parse failure is recorded as a `SyntaxError` pattern of high severity.
    pub fn analyze(code: &str) -> ValidationResult {
        let mut result = Self::validate(code);
        if let SyntaxCheck {
            valid: false,
            error: Some(error),
        } = Self::check_syntax(code)
        {
            result.dangerous_patterns.push(DangerousPattern {
                kind: PatternKind::SyntaxError,
                matched_text: error,
                position: 0,
                severity: Severity::High,
                description: "the code does not parse".to_string(),
            });
            result.valid = false;
        }
        result
    }
}

fn parse_only(code: &str) -> Result<(), SandboxError> {
    let runtime = Runtime::new()
        .map_err(|e| SandboxError::Initialization(format!("failed to create runtime: {e}")))?;
    runtime.set_memory_limit(SYNTAX_CHECK_MEMORY);
    let clock = ExecutionClock::new(SYNTAX_CHECK_TIMEOUT);
    let poll = clock.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || poll.should_interrupt())));
    let context = Context::full(&runtime)
        .map_err(|e| SandboxError::Initialization(format!("failed to create context: {e}")))?;

    let source = format!(
        "(function ({}) {{\n{code}\n}});\n",
        LOCAL_BINDINGS.join(", ")
    );
    let _armed = ArmedClock::start(&clock);
    context.with(|ctx| match Module::declare(ctx.clone(), "handler", source) {
        Ok(_) => Ok(()),
        Err(rquickjs::Error::Exception) => {
            let thrown = ctx.catch();
            let (name, message) = match thrown.as_object() {
                Some(object) => (
                    object.get::<_, Option<String>>("name").ok().flatten(),
                    object.get::<_, Option<String>>("message").ok().flatten(),
                ),
                None => (None, None),
            };
            let message = message.unwrap_or_else(|| marshal::render(&thrown));
            Err(classify_guest_exception(
                name.as_deref(),
                &message,
                None,
                SYNTAX_CHECK_MEMORY,
            ))
        }
        Err(other) => Err(SandboxError::System(other.to_string())),
    })
}
