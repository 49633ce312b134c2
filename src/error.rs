//! Error handler for ldap-groups.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Opaque cause reported by a directory implementation.
pub type Cause = Box<dyn std::error::Error + Send + Sync>;

/// Enum representing failures while resolving groups.
#[derive(Debug, Error)]
pub enum Error {
    #[error("directory rejected admin credentials: {reason}")]
    Auth { principal: String, reason: String },

    #[error("directory unreachable after {attempts} attempt(s)")]
    Connection {
        attempts: u32,
        #[source]
        source: Cause,
    },

    #[error("search under `{base}` failed")]
    Search {
        base: String,
        #[source]
        source: Cause,
    },

    #[error("group value `{0}` has no usable name component")]
    MalformedAttributeValue(String),

    #[error(transparent)]
    Config(#[from] crate::config::Error),
}

impl Error {
    /// Whether the error comes from a rejected admin credential.
    ///
    /// Such an error blocks every resolution until configuration changes.
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Whether the directory could not be reached at all.
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Short label used for metrics and log fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Connection { .. } => "connection",
            Self::Search { .. } => "search",
            Self::MalformedAttributeValue(_) => "malformed",
            Self::Config(_) => "config",
        }
    }
}
