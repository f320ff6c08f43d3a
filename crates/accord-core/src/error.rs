//! Error taxonomy shared by connectors, the registry and the provisioning engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccordError {
    /// Resource absent, locally or in the external system
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    /// Duplicate create in the external system
    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Unauthenticated: {message}")]
    Unauthenticated { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Network failure, timeout or server-side fault. The only retryable kind.
    #[error("Transient error: {message}")]
    Transient { message: String },

    /// Validation failure, unknown operation or malformed payload
    #[error("Permanent error: {message}")]
    Permanent { message: String },

    /// Connector not registered or disabled
    #[error("Unavailable: {message}")]
    Unavailable { message: String },

    #[error("Unknown connector type: {connector_type}")]
    UnknownType { connector_type: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Encryption error: {message}")]
    Encryption { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AccordError {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Shorthand for a `Permanent` validation failure
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: format!("invalid input: {}", message.into()),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn unknown_type(connector_type: impl Into<String>) -> Self {
        Self::UnknownType {
            connector_type: connector_type.into(),
        }
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn encryption_error(message: impl Into<String>) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a failed call may be attempted again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Stable snake_case name of the error kind, used in task error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Forbidden { .. } => "forbidden",
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
            Self::Unavailable { .. } => "unavailable",
            Self::UnknownType { .. } => "unknown_type",
            Self::Database { .. } => "database",
            Self::Encryption { .. } => "encryption",
            Self::Config { .. } => "config",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for AccordError {
    fn from(e: serde_json::Error) -> Self {
        Self::permanent(format!("serialization failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, AccordError>;

/// Run a network-bound future under a deadline, mapping expiry to `Transient`
pub async fn with_deadline<T, F>(deadline: std::time::Duration, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(AccordError::transient(format!(
            "{} timed out after {}ms",
            what,
            deadline.as_millis()
        ))),
    }
}
