//! Error taxonomy for the compile, cache, and scheduling pipelines.

use crate::types::Span;
use thiserror::Error;

/// Malformed structural markers in template source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}:{span}: {message}")]
pub struct ParseError {
    pub path: String,
    pub span: Span,
    pub message: String,
}

impl ParseError {
    pub fn new(path: impl Into<String>, span: Span, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            span,
            message: message.into(),
        }
    }
}

/// A dependency cycle found while resolving inheritance or recording edges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle: {}", chain.join(" -> "))]
pub struct CycleError {
    /// Templates on the cycle, first element repeated at the end.
    pub chain: Vec<String>,
}

impl CycleError {
    pub fn involves(&self, path: &str) -> bool {
        self.chain.iter().any(|p| p == path)
    }
}

/// Pass or code generation failure. Aborts one template's pipeline only.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("{path}:{span}: unknown filter '{name}'")]
    UnknownFilter {
        path: String,
        name: String,
        span: Span,
    },

    #[error("{path}:{span}: unknown macro '{name}'")]
    UnknownMacro {
        path: String,
        name: String,
        span: Span,
    },

    #[error("{path}: referenced template not found: {target}")]
    MissingTemplate { path: String, target: String },

    #[error("{path}: pass '{pass}' failed: {message}")]
    PassFailed {
        path: String,
        pass: &'static str,
        message: String,
    },

    #[error("{path}: invalid bytecode: {message}")]
    InvalidProgram { path: String, message: String },
}

impl CompileError {
    /// Template the failure is attributed to.
    pub fn path(&self) -> Option<&str> {
        match self {
            CompileError::Parse(e) => Some(&e.path),
            CompileError::Cycle(e) => e.chain.first().map(String::as_str),
            CompileError::UnknownFilter { path, .. }
            | CompileError::UnknownMacro { path, .. }
            | CompileError::MissingTemplate { path, .. }
            | CompileError::PassFailed { path, .. }
            | CompileError::InvalidProgram { path, .. } => Some(path),
        }
    }
}

/// Bytecode execution failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("pc {pc} out of bounds (program len {len})")]
    PcOutOfBounds { pc: usize, len: usize },

    #[error("stack underflow at pc {pc}")]
    StackUnderflow { pc: usize },

    #[error("malformed program at pc {pc}: {message}")]
    Malformed { pc: usize, message: String },

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("included template not available: {0}")]
    MissingTemplate(String),

    #[error("macro '{name}' not found in {template}")]
    UnknownMacro { template: String, name: String },

    #[error("include depth exceeded ({depth})")]
    IncludeDepthExceeded { depth: usize },
}

/// Failure on a persisted cache tier. Logged and treated as a miss.
#[derive(Debug, Error)]
pub enum CacheIoError {
    #[error("blob read failed for {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("blob write failed for {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("blob delete failed for {name}: {source}")]
    Delete {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("blob {name} is corrupt: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One job's failure inside a scheduling batch. Never fails the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("job for {path} failed: {message}")]
    JobFailed { path: String, message: String },

    #[error("job for {path} was superseded")]
    Superseded { path: String },
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Umbrella error for engine-level operations.
#[derive(Debug, Error)]
pub enum StencilError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("render failed for {path}: {source}")]
    Render {
        path: String,
        #[source]
        source: RenderError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error("template not registered: {0}")]
    UnknownTemplate(String),

    #[error("template source unavailable: {0}")]
    Source(#[source] anyhow::Error),

    #[error("state persistence failed: {0}")]
    State(#[source] anyhow::Error),
}

impl From<ParseError> for StencilError {
    fn from(err: ParseError) -> Self {
        StencilError::Compile(CompileError::Parse(err))
    }
}

impl From<CycleError> for StencilError {
    fn from(err: CycleError) -> Self {
        StencilError::Compile(CompileError::Cycle(err))
    }
}

impl StencilError {
    /// Whether retrying after a source change can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StencilError::Compile(_)
                | StencilError::Render { .. }
                | StencilError::UnknownTemplate(_)
                | StencilError::Source(_)
                | StencilError::Scheduling(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_names_path_and_span() {
        let err = ParseError::new("pages/home.tpl", Span::new(10, 14), "unterminated 'if' block");
        let text = err.to_string();
        assert!(text.contains("pages/home.tpl"));
        assert!(text.contains("10..14"));
    }

    #[test]
    fn cycle_error_renders_chain() {
        let err = CycleError {
            chain: vec!["a.tpl".into(), "b.tpl".into(), "a.tpl".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a.tpl -> b.tpl -> a.tpl");
        assert!(err.involves("b.tpl"));
        assert!(!err.involves("c.tpl"));
    }

    #[test]
    fn compile_error_reports_path() {
        let err = CompileError::UnknownFilter {
            path: "x.tpl".into(),
            name: "shout".into(),
            span: Span::new(0, 3),
        };
        assert_eq!(err.path(), Some("x.tpl"));
        assert!(StencilError::from(err).is_recoverable());
    }

    #[test]
    fn config_errors_are_not_recoverable() {
        let err = StencilError::Config(ConfigError::Invalid {
            field: "cache.max_memory_bytes",
            message: "must be > 0".into(),
        });
        assert!(!err.is_recoverable());
    }
}
