use thiserror::Error;

/// Unified error type for the sipguard library.
#[derive(Debug, Error)]
pub enum SipGuardError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Environment variable not set: {0}")]
    ConfigEnvVar(String),

    #[error("Invalid config: {0}")]
    ConfigInvalid(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database schema is at version {found}, expected {expected}; run `sipguard migrate`")]
    SchemaOutdated { found: i64, expected: i64 },

    #[error("Server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, SipGuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SipGuardError = io_err.into();
        assert!(matches!(err, SipGuardError::Io(_)));
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn server_error_displays_message() {
        let err = SipGuardError::Server("address in use".to_string());
        assert_eq!(err.to_string(), "Server error: address in use");
    }

    #[test]
    fn config_parse_error_converts() {
        let bad_toml = "[invalid";
        let toml_err = toml::from_str::<toml::Value>(bad_toml).unwrap_err();
        let err: SipGuardError = toml_err.into();
        assert!(matches!(err, SipGuardError::ConfigParse(_)));
    }

    #[test]
    fn schema_outdated_mentions_migrate() {
        let err = SipGuardError::SchemaOutdated {
            found: 0,
            expected: 1,
        };
        assert!(err.to_string().contains("sipguard migrate"));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SipGuardError>();
    }
}
