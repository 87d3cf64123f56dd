use thiserror::Error;

/// Engine-level failure taxonomy.
///
/// Turn-level failures (`Subprocess`) never advance the continuation token,
/// and registry rejections (`SessionNotFound` / `DuplicateSession` / `Busy`)
/// have no side effects on the thread map. Environment provisioning failures
/// are not errors at all: they travel as `EnvStartReport` values, since a
/// failed container start leaves host execution working and the caller
/// chooses whether to retry with the fallback.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad invocation arguments or a session used before its repository was
    /// bound. Fatal to a single turn, not to the session.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The claude subprocess crashed, exited non-zero, or closed its stream
    /// before emitting a terminal result. The session stays resumable from
    /// the last successful turn.
    #[error("claude subprocess failed: {0}")]
    Subprocess(String),

    /// No active session for this thread; the user must start one first.
    #[error("no active session for thread {0}")]
    SessionNotFound(String),

    /// A session already exists for this thread; the existing one is kept.
    #[error("a session already exists for thread {0}")]
    DuplicateSession(String),

    /// Malformed repository specification or missing token.
    #[error("credential error: {0}")]
    Credential(String),

    /// A turn is already in flight for this thread.
    #[error("a message is already being processed for thread {0}")]
    Busy(String),

    /// The session was already bound to a repository and has routed messages.
    #[error("session for thread {0} is already bound to a repository")]
    AlreadyBound(String),

    /// Persistence failure (SQLite).
    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
