use thiserror::Error;

/// The error taxonomy of spec.md §7.
///
/// Most call sites never match on this directly: they propagate an
/// `anyhow::Error` with `?` and let the top-level worker decide whether to
/// log-and-count or abort. Call sites that need to tell a "keep going"
/// error apart from a "the whole invocation is dead" error downcast to
/// this enum (`anyhow::Error::downcast_ref::<RsbError>()`).
#[derive(Debug, Error)]
pub enum RsbError {
    /// A malformed config entry; fatal to the whole invocation.
    #[error("configuration error at {path}:{line}: {message}")]
    Configuration {
        path: String,
        line: u32,
        message: String,
    },

    /// Filesystem or network syscall failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Catalogue lock contention. Always retried, never surfaced as failure
    /// on its own, but kept distinguishable so the retry loop can recognize
    /// it across an `anyhow::Error` boundary.
    #[error("database busy")]
    DatabaseBusy,

    /// Any other database failure; fatal to the enclosing transaction.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// A child process terminated abnormally, classified per spec.md §4.2.
    #[error("{0}")]
    SubprocessFailed(#[from] SubprocessFailure),

    /// A store is not currently mounted, or its `device-id` is unrecognised.
    /// Warning-only.
    #[error("store {store} unavailable: {reason}")]
    UnavailableStore { store: String, reason: String },

    /// A store's `device-id` file, ownership, or permissions are wrong.
    /// Warning-only.
    #[error("store {store} misconfigured: {reason}")]
    BadStore { store: String, reason: String },

    /// The same device-id is claimed by two stores. Aborts the whole
    /// invocation.
    #[error("device id '{device_id}' claimed by both store '{first}' and store '{second}'")]
    FatalStore {
        device_id: String,
        first: String,
        second: String,
    },

    /// A malformed date, interval, or regular expression; fatal to the
    /// owning operation.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A malformed command invocation; fatal before work begins.
    #[error("command error: {0}")]
    Command(String),
}

/// Classification of an abnormal subprocess exit (spec.md §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubprocessFailure {
    ExitedNonzero { command: String, code: i32 },
    Signalled {
        command: String,
        signal: i32,
        core_dumped: bool,
    },
    Sigpipe { command: String },
    Stopped { command: String, signal: i32 },
}

impl std::error::Error for SubprocessFailure {}

impl std::fmt::Display for SubprocessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubprocessFailure::ExitedNonzero { command, code } => {
                write!(f, "{}: exited with status {}", command, code)
            }
            SubprocessFailure::Signalled { command, signal, core_dumped } => {
                write!(f, "{}: killed by signal {}", command, signal)?;
                if *core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            }
            SubprocessFailure::Sigpipe { command } => write!(f, "{}: killed by SIGPIPE", command),
            SubprocessFailure::Stopped { command, signal } => {
                write!(f, "{}: stopped by signal {}", command, signal)
            }
        }
    }
}
