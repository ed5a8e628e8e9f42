use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Cooperative cancellation, observed at a yield point. Unwinds the
    /// current worker; never fatal to the process.
    #[error("cancelled at yield point")]
    Cancelled,

    /// A programming invariant was violated (ownership double-hold,
    /// impossible dispatch kind). Always fatal.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Everything except a cooperative cancellation escalates to process
    /// termination once it reaches the supervisor.
    pub fn is_fatal(&self) -> bool {
        !self.is_cancelled()
    }
}
