//! Error types for Gramcast

use thiserror::Error;

use crate::types::ActionType;

pub type Result<T> = std::result::Result<T, GramcastError>;

#[derive(Error, Debug)]
pub enum GramcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Rate limit reached for {action}; next slot at {next_available}")]
    RateLimited {
        action: ActionType,
        next_available: i64,
    },
}

impl GramcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            GramcastError::InvalidInput(_)
            | GramcastError::NotFound(_)
            | GramcastError::Unauthorized(_)
            | GramcastError::InvalidState(_) => 3,
            GramcastError::RateLimited { .. } => 4,
            GramcastError::Config(_) | GramcastError::Database(_) => 2,
            GramcastError::Publish(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    #[error("Failed to encode job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Failure reported by the publishing collaborator for a single attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Media rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Publisher timed out after {0}s")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = GramcastError::InvalidInput("Scheduled time must be in the future".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_ownership_and_state() {
        assert_eq!(GramcastError::Unauthorized("acct".to_string()).exit_code(), 3);
        assert_eq!(GramcastError::NotFound("item".to_string()).exit_code(), 3);
        assert_eq!(GramcastError::InvalidState("done".to_string()).exit_code(), 3);
    }

    #[test]
    fn test_exit_code_rate_limited() {
        let error = GramcastError::RateLimited {
            action: ActionType::Post,
            next_available: 1_000,
        };
        assert_eq!(error.exit_code(), 4);
    }

    #[test]
    fn test_exit_code_infrastructure() {
        let config_error = GramcastError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(config_error.exit_code(), 2);

        let db_error = GramcastError::Database(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        )));
        assert_eq!(db_error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_publish_failure() {
        let error = GramcastError::Publish(PublishError::Network("connection reset".to_string()));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting() {
        let error = GramcastError::Publish(PublishError::Upstream("HTTP 502".to_string()));
        assert_eq!(format!("{}", error), "Publish error: Upstream error: HTTP 502");

        let error = GramcastError::RateLimited {
            action: ActionType::Story,
            next_available: 42,
        };
        assert_eq!(
            format!("{}", error),
            "Rate limit reached for story; next slot at 42"
        );

        let error = ConfigError::InvalidValue {
            field: "queue.max_retries".to_string(),
            reason: "must be at least 1".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Invalid value for queue.max_retries: must be at least 1"
        );
    }

    #[test]
    fn test_error_conversion_from_publish_error() {
        let publish_error = PublishError::Timeout(30);
        let error: GramcastError = publish_error.into();

        match error {
            GramcastError::Publish(PublishError::Timeout(30)) => {}
            other => panic!("Expected GramcastError::Publish, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_error_clone() {
        let original = PublishError::Network("Connection failed".to_string());
        let cloned = original.clone();
        assert_eq!(original, cloned);
    }
}
