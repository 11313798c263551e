//! SqlExc Error Types

use thiserror::Error;

/// Result type alias for SqlExc operations
pub type Result<T> = std::result::Result<T, Error>;

/// SqlExc error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] serde_json::Error),

    // Protocol errors
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Access denied for user '{0}'")]
    AuthFailed(String),

    // SQL errors
    #[error("Unknown database '{0}'")]
    UnknownDatabase(String),

    #[error("Table '{0}' doesn't exist")]
    TableNotFound(String),

    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("SQL syntax error: {0}")]
    Syntax(String),

    #[error("Data source '{0}' is read only")]
    ReadOnly(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Table '{0}' is migrating between backends")]
    Migrating(String),

    #[error("KV backend error: {0}")]
    Kv(#[from] rusqlite::Error),

    #[error("Row encoding error: {0}")]
    RowCodec(#[from] bincode::Error),

    // Planner / executor errors
    #[error("Plan error: {0}")]
    Plan(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Query exceeded deadline")]
    Timeout,

    // Remote data source errors
    #[error("HTTP data source error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote table error: {0}")]
    Remote(String),

    // Plugin errors
    #[error("Plugin error: {0}")]
    Plugin(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// MySQL error code reported in ERR packets
    pub fn mysql_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => 1835,
            Error::AuthFailed(_) => 1045,
            Error::UnknownDatabase(_) => 1049,
            Error::TableNotFound(_) => 1146,
            Error::UnknownColumn(_) => 1054,
            Error::Syntax(_) => 1064,
            Error::ReadOnly(_) => 1290,
            Error::Unsupported(_) => 1148,
            Error::Serialization(_) => 1213,
            Error::Cancelled | Error::Timeout => 1317,
            _ => 1105,
        }
    }

    /// Five-character SQL state paired with the error code
    pub fn sql_state(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "HY000",
            Error::AuthFailed(_) => "28000",
            Error::UnknownDatabase(_) => "42000",
            Error::TableNotFound(_) => "42S02",
            Error::UnknownColumn(_) => "42S22",
            Error::Syntax(_) => "42000",
            Error::ReadOnly(_) => "HY000",
            Error::Unsupported(_) => "42000",
            Error::Serialization(_) => "40001",
            Error::Cancelled | Error::Timeout => "70100",
            _ => "HY000",
        }
    }

    /// Whether the session must be torn down after reporting this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::AuthFailed(_) | Error::Io(_) | Error::ShuttingDown
        )
    }

    /// Check if this error is retryable against a remote backend
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect() || e.is_timeout(),
            Error::Remote(_) => true,
            _ => false,
        }
    }
}

impl From<sqlparser::parser::ParserError> for Error {
    fn from(e: sqlparser::parser::ParserError) -> Self {
        Error::Syntax(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(Error::AuthFailed("root".into()).mysql_code(), 1045);
        assert_eq!(Error::AuthFailed("root".into()).sql_state(), "28000");
        assert_eq!(Error::TableNotFound("t".into()).mysql_code(), 1146);
        assert_eq!(Error::TableNotFound("t".into()).sql_state(), "42S02");
        assert_eq!(Error::Serialization("conflict".into()).mysql_code(), 1213);
        assert_eq!(Error::Cancelled.mysql_code(), 1317);
        assert_eq!(Error::Cancelled.sql_state(), "70100");
        assert_eq!(Error::Internal("boom".into()).mysql_code(), 1105);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Protocol("bad packet".into()).is_fatal());
        assert!(Error::AuthFailed("root".into()).is_fatal());
        assert!(!Error::Syntax("near".into()).is_fatal());
        assert!(!Error::TableNotFound("t".into()).is_fatal());
    }
}
