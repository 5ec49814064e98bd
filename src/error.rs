//! Error taxonomy for flow parsing and execution.
//!
//! [`ParseError`] and [`EnvironmentError`] are fatal and abort a run
//! before any request is sent. Everything wrapped by [`StepError`] is
//! local to one step: it fails that step and is reported in its
//! [`StepResult`](crate::model::StepResult), but never escapes the
//! scheduler.

use thiserror::Error;

/// Why a scenario source was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("missing request line `METHOD <url>`")]
    MissingRequestLine,
    #[error("unsupported HTTP method '{0}'")]
    InvalidMethod(String),
    #[error("request URL is empty")]
    EmptyUrl,
    #[error("malformed header line '{0}'")]
    InvalidHeader(String),
    #[error("malformed capture line '{0}'")]
    InvalidCapture(String),
    #[error("capture name '{0}' is not a valid identifier")]
    InvalidCaptureName(String),
    #[error("malformed assertion '{0}'")]
    InvalidAssertion(String),
    #[error("unknown or malformed option '{0}'")]
    InvalidOption(String),
    #[error("unterminated request block")]
    UnterminatedBlock,
    #[error("scenario contains no steps")]
    NoSteps,
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),
    #[error("edge references unknown step '{0}'")]
    UnknownStep(String),
    #[error("dependency cycle detected involving steps: {}", .0.join(", "))]
    CycleDetected(Vec<String>),
    #[error("{0}")]
    Malformed(String),
}

/// A malformed scenario, naming the offending step when known.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}{kind}", location_prefix(.step, .line))]
pub struct ParseError {
    /// Step id or title the error belongs to.
    pub step: Option<String>,
    /// 1-based source line, for Markdown scripts.
    pub line: Option<usize>,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind) -> Self {
        Self {
            step: None,
            line: None,
            kind,
        }
    }

    pub fn in_step(step: impl Into<String>, kind: ParseErrorKind) -> Self {
        Self {
            step: Some(step.into()),
            line: None,
            kind,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

fn location_prefix(step: &Option<String>, line: &Option<usize>) -> String {
    match (step, line) {
        (Some(step), Some(line)) => format!("step '{step}' (line {line}): "),
        (Some(step), None) => format!("step '{step}': "),
        (None, Some(line)) => format!("line {line}: "),
        (None, None) => String::new(),
    }
}

/// Unknown or misconfigured environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("environment '{name}' is not defined (known: {})", .known.join(", "))]
    Unknown { name: String, known: Vec<String> },
    #[error("no active environment selected; set active_env or pass --env")]
    NoneSelected,
    #[error("environment '{name}' has invalid base_url '{base_url}': {reason}")]
    InvalidBaseUrl {
        name: String,
        base_url: String,
        reason: String,
    },
}

/// A `{{name}}` placeholder with no value in scope, environment or
/// builtins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unresolved variable '{name}'")]
pub struct UnresolvedVariableError {
    pub name: String,
}

/// A capture or assertion path that does not resolve against the
/// response body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("path '{path}' cannot be resolved: {reason}")]
pub struct CaptureError {
    pub path: String,
    pub reason: String,
}

impl CaptureError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Connection failure, timeout or unusable URL. Treated as "no
/// response" by the assertion evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("network error: {cause}")]
pub struct NetworkError {
    pub cause: String,
    pub timed_out: bool,
}

impl NetworkError {
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            timed_out: false,
        }
    }

    pub fn timeout(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            timed_out: true,
        }
    }
}

/// History store failure. Logged as a warning by the scheduler.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("history database error ({context}): {source}")]
    Database {
        context: &'static str,
        #[source]
        source: tokio_rusqlite::Error,
    },
    #[error("history log io error ({context}): {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("history record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("history record {0} not found")]
    NotFound(i64),
    #[error("history record is corrupt: {0}")]
    Corrupt(String),
}

/// Step-local failure recorded into the step result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error(transparent)]
    Unresolved(#[from] UnresolvedVariableError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Hard failures that propagate to the caller of a run.
#[derive(Debug, Error)]
pub enum KestError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("run task failed: {0}")]
    Task(String),
}

pub type Result<T, E = KestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_names_step_and_line() {
        let err = ParseError::in_step(
            "Step 2: login",
            ParseErrorKind::InvalidMethod("FETCH".to_string()),
        )
        .at_line(14);
        assert_eq!(
            err.to_string(),
            "step 'Step 2: login' (line 14): unsupported HTTP method 'FETCH'"
        );
    }

    #[test]
    fn cycle_lists_members() {
        let err = ParseError::new(ParseErrorKind::CycleDetected(vec![
            "a".to_string(),
            "b".to_string(),
        ]));
        assert_eq!(
            err.to_string(),
            "dependency cycle detected involving steps: a, b"
        );
    }

    #[test]
    fn unknown_environment_lists_known_names() {
        let err = EnvironmentError::Unknown {
            name: "prod".to_string(),
            known: vec!["dev".to_string(), "staging".to_string()],
        };
        assert!(err.to_string().contains("dev, staging"));
    }
}
