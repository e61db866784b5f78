//! Top-level error taxonomy and exit-code mapping.

use crate::config::ConfigError;
use crate::copy::CopyError;
use crate::engine::EngineError;
use crate::names::NameError;
use crate::session::SessionError;
use crate::stats::StatsError;
use crate::terminal::TerminalError;
use thiserror::Error;

/// Errors surfaced by commands.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine socket could not be reached. The message already carries
    /// the `connecting to engine` prefix.
    #[error("{0}")]
    EngineUnavailable(#[source] EngineError),

    #[error("{op}: {source}")]
    Engine {
        op: String,
        #[source]
        source: EngineError,
    },

    #[error("container {0} is not running")]
    ContainerNotRunning(String),

    #[error("terminal is already in use by another interactive session")]
    TerminalBusy,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("bad tar stream: {0}")]
    BadTarStream(String),

    #[error(transparent)]
    Name(NameError),

    #[error(transparent)]
    Terminal(TerminalError),

    #[error(transparent)]
    Copy(CopyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Stats(StatsError),

    /// Some items of a bulk operation failed; each failure was already printed.
    #[error("{failed} of {total} operations failed")]
    Partial { failed: usize, total: usize },

    /// The container or exec process exited with a non-zero status.
    #[error("exit status {0}")]
    Exit(i32),

    #[error("interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an engine error with the operation that failed.
    pub fn engine(op: impl Into<String>, source: EngineError) -> Self {
        if source.is_unavailable() {
            Self::EngineUnavailable(source)
        } else {
            Self::Engine {
                op: op.into(),
                source,
            }
        }
    }

    /// Whether the underlying engine error is a missing container.
    #[must_use]
    pub const fn is_container_not_found(&self) -> bool {
        matches!(
            self,
            Self::Engine {
                source: EngineError::NotFound(_),
                ..
            }
        )
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Exit(code) => *code,
            Self::Interrupted => 130,
            _ => 1,
        }
    }

    /// Whether the error should be reported on stderr.
    ///
    /// A container's own exit status and a user interrupt are not errors
    /// of the tool.
    #[must_use]
    pub const fn is_reportable(&self) -> bool {
        !matches!(self, Self::Exit(_) | Self::Interrupted)
    }
}

impl From<NameError> for Error {
    fn from(e: NameError) -> Self {
        match e {
            NameError::Engine { op, source } => Self::engine(op, source),
            other => Self::Name(other),
        }
    }
}

impl From<TerminalError> for Error {
    fn from(e: TerminalError) -> Self {
        match e {
            TerminalError::Busy => Self::TerminalBusy,
            other => Self::Terminal(other),
        }
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Engine { op, source } => Self::engine(op, source),
            SessionError::ContainerNotRunning(name) => Self::ContainerNotRunning(name),
            SessionError::Terminal(t) => t.into(),
            SessionError::Interrupted => Self::Interrupted,
            SessionError::Io(io) => Self::Io(io),
        }
    }
}

impl From<CopyError> for Error {
    fn from(e: CopyError) -> Self {
        match e {
            CopyError::Engine { op, source } => Self::engine(op, source),
            CopyError::BadTarStream(msg) => Self::BadTarStream(msg),
            CopyError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            CopyError::Interrupted => Self::Interrupted,
            other => Self::Copy(other),
        }
    }
}

impl From<StatsError> for Error {
    fn from(e: StatsError) -> Self {
        match e {
            StatsError::Engine { op, source } => Self::engine(op, source),
            StatsError::Io(io) => Self::Io(io),
            other => Self::Stats(other),
        }
    }
}

/// Convenience alias for command results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Exit(42).exit_code(), 42);
        assert_eq!(Error::Interrupted.exit_code(), 130);
        assert_eq!(Error::TerminalBusy.exit_code(), 1);
        assert_eq!(Error::Partial { failed: 1, total: 3 }.exit_code(), 1);
    }

    #[test]
    fn test_engine_errors_carry_operation() {
        let err = Error::engine(
            "starting container abc",
            EngineError::NotFound("abc".into()),
        );
        assert_eq!(err.to_string(), "starting container abc: no such container: abc");
        assert!(err.is_container_not_found());
    }

    #[test]
    fn test_unavailable_engine_keeps_connecting_prefix() {
        let source = EngineError::Unavailable {
            path: PathBuf::from("/var/run/docker.sock"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let err = Error::engine("listing containers", source);
        assert!(matches!(err, Error::EngineUnavailable(_)));
        assert!(err.to_string().starts_with("connecting to engine at /var/run/docker.sock"));
    }

    #[test]
    fn test_busy_terminal_maps_to_terminal_busy() {
        let err: Error = SessionError::Terminal(TerminalError::Busy).into();
        assert!(matches!(err, Error::TerminalBusy));
    }

    #[test]
    fn test_exit_and_interrupt_are_silent() {
        assert!(!Error::Exit(1).is_reportable());
        assert!(!Error::Interrupted.is_reportable());
        assert!(Error::InvalidArgument("x".into()).is_reportable());
    }
}
