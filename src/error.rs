use camino::Utf8PathBuf;

use crate::pipeline::Phase;

/// Error types for the geoipenv library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration directive or section is malformed. Only raised while
    /// loading configuration, never while serving a request.
    #[error("{origin}:{line}: {reason}")]
    Config {
        origin: String,
        line: usize,
        reason: String,
    },

    /// The database file could not be read.
    #[error("cannot read database {path}")]
    DatabaseRead {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The database file was read but is not a valid MaxMind DB.
    #[error("invalid database {path}")]
    DatabaseInvalid {
        path: Utf8PathBuf,
        #[source]
        source: maxminddb::MaxMindDbError,
    },

    /// The client address is not a valid IPv4 or IPv6 address.
    #[error("invalid client address: {addr:?}")]
    AddressParse { addr: String },

    /// A record was found but could not be decoded.
    #[error("lookup failed for {ip}")]
    Lookup {
        ip: String,
        #[source]
        source: maxminddb::MaxMindDbError,
    },

    /// Hook ordering constraints within a phase form a cycle.
    #[error("hook ordering cycle in {phase:?} phase between: {hooks}")]
    HookCycle { phase: Phase, hooks: String },

    /// Hooks were registered after the last [`crate::Pipeline::build`], or it
    /// was never called.
    #[error("pipeline must be built after registering hooks")]
    PipelineNotBuilt,

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(origin: &str, line: usize, reason: impl Into<String>) -> Self {
        Error::Config {
            origin: origin.to_string(),
            line,
            reason: reason.into(),
        }
    }

    /// True for both ways a database can fail to open.
    pub fn is_database_unavailable(&self) -> bool {
        matches!(
            self,
            Error::DatabaseRead { .. } | Error::DatabaseInvalid { .. }
        )
    }
}

/// Convenience type alias for Results using the library error.
pub type Result<T> = std::result::Result<T, Error>;
