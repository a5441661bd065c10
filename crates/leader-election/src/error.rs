//! Election error types

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;

/// Errors reported by a coordination service session.
///
/// These mirror the failure modes of the capability set the election consumes
/// (`create_node`, `exists`, `get_children`, `delete`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Transient communication failure. Safe to retry with backoff.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The session that owned our entries is gone.
    #[error("Session expired")]
    SessionExpired,

    /// The session was closed by its owner.
    #[error("Session closed")]
    Closed,

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Parent node does not exist: {0}")]
    NoParent(String),

    #[error("Node is not owned by this session: {0}")]
    NotOwner(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),
}

impl ServiceError {
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        Self::Connection(msg.into())
    }

    /// Returns true for errors a caller may retry in place.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Returns true when the session backing the call can no longer be used.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::Closed)
    }
}

/// Election-level error types
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("Registration failed at {path}: {source}")]
    Registration {
        path: String,
        #[source]
        source: ServiceError,
    },

    #[error("Resolution failed at {path}: {source}")]
    Resolution {
        path: String,
        #[source]
        source: ServiceError,
    },

    /// Our own candidate entry is missing from the candidate set.
    #[error("Candidate {0} is not registered")]
    SelfNotRegistered(String),

    #[error("Watch delivery failed for {target}: {source}")]
    WatchDelivery {
        target: String,
        #[source]
        source: ServiceError,
    },

    #[error("Shutdown failed at {path}: {source}")]
    Shutdown {
        path: String,
        #[source]
        source: ServiceError,
    },

    /// The session ended underneath the election
    #[error("Session {session} lost: {source}")]
    SessionLost {
        session: String,
        #[source]
        source: ServiceError,
    },

    #[error("Invalid candidate name: {0}")]
    InvalidCandidate(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Election terminated: {0}")]
    Terminated(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl ElectionError {
    pub fn registration<T: Into<String>>(path: T, source: ServiceError) -> Self {
        Self::Registration {
            path: path.into(),
            source,
        }
    }

    pub fn resolution<T: Into<String>>(path: T, source: ServiceError) -> Self {
        Self::Resolution {
            path: path.into(),
            source,
        }
    }

    pub fn self_not_registered<T: Into<String>>(candidate: T) -> Self {
        Self::SelfNotRegistered(candidate.into())
    }

    pub fn watch_delivery<T: Into<String>>(target: T, source: ServiceError) -> Self {
        Self::WatchDelivery {
            target: target.into(),
            source,
        }
    }

    pub fn shutdown<T: Into<String>>(path: T, source: ServiceError) -> Self {
        Self::Shutdown {
            path: path.into(),
            source,
        }
    }

    pub fn session_lost<T: Into<String>>(session: T, source: ServiceError) -> Self {
        Self::SessionLost {
            session: session.into(),
            source,
        }
    }

    pub fn invalid_candidate<T: Into<String>>(name: T) -> Self {
        Self::InvalidCandidate(name.into())
    }

    pub fn invalid_path<T: Into<String>>(path: T) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn terminated<T: Into<String>>(msg: T) -> Self {
        Self::Terminated(msg.into())
    }

    /// The underlying service error, if this error came from a service call.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Registration { source, .. }
            | Self::Resolution { source, .. }
            | Self::WatchDelivery { source, .. }
            | Self::Shutdown { source, .. }
            | Self::SessionLost { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Returns true when the candidate identity is lost and the election
    /// must start over with a fresh registration.
    pub fn invalidates_identity(&self) -> bool {
        match self {
            Self::SelfNotRegistered(_) => true,
            other => other
                .service_error()
                .map(ServiceError::is_session_loss)
                .unwrap_or(false),
        }
    }

    /// Returns true when a new session is needed before registering again.
    pub fn requires_new_session(&self) -> bool {
        self.service_error()
            .map(ServiceError::is_session_loss)
            .unwrap_or(false)
    }
}
