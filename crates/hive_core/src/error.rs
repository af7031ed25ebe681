//! Core error types for hive.

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors. Fatal at startup only.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// Config file could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config document could not be parsed
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::validation("node.id", "must not be empty");
        assert_eq!(
            err.to_string(),
            "Validation failed for node.id: must not be empty"
        );
    }

    #[test]
    fn test_parse_error_from_json() {
        let err: ConfigError = serde_json::from_str::<u64>("not json").unwrap_err().into();
        assert!(err.to_string().starts_with("Failed to parse config"));
    }
}
