use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] steadycall_core::ValidationError),

    #[error(transparent)]
    Config(#[from] steadycall_core::CoreError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Command(_) => 2,
            Self::Config(_) => 7,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steadycall_core::{CoreError, ValidationError};

    #[test]
    fn exit_codes_distinguish_usage_from_configuration_errors() {
        assert_eq!(CliError::from(ValidationError::EmptyResourceId).exit_code(), 2);
        assert_eq!(
            CliError::from(CoreError::Validation(ValidationError::EmptyStrategyList)).exit_code(),
            7
        );
        assert_eq!(CliError::from(std::io::Error::other("broken pipe")).exit_code(), 10);
    }
}
