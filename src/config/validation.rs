use rustls::pki_types::ServerName;

use crate::config::models::{ProxyConfig, parse_duration};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid duration '{value}' for {field}: {reason}")]
    InvalidDuration {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Proxy configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire configuration, reporting every problem at once
    pub fn validate(config: &ProxyConfig) -> ValidationResult<()> {
        let errors = Self::collect_errors(config);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            })
        }
    }

    /// Every individual problem with `config`, in field order
    pub fn collect_errors(config: &ProxyConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("etcd_ca", &config.etcd_ca),
            ("etcd_cert", &config.etcd_cert),
            ("etcd_key", &config.etcd_key),
        ] {
            if value.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        for (field, port) in [("port", config.port), ("upstream_port", config.upstream_port)] {
            if port == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Port must be between 1 and 65535".to_string(),
                });
            }
        }

        if config.upstream_host.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "upstream_host".to_string(),
            });
        }

        if let Err(e) = Self::validate_server_name(&config.upstream_server_name) {
            errors.push(e);
        }

        if !config.metrics_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "metrics_path".to_string(),
                message: "Metrics path must start with '/'".to_string(),
            });
        }

        for (field, value) in [
            ("reload.debounce", &config.reload.debounce),
            ("transport.idle_timeout", &config.transport.idle_timeout),
            ("transport.handshake_timeout", &config.transport.handshake_timeout),
        ] {
            if let Err(e) = Self::validate_duration(field, value) {
                errors.push(e);
            }
        }

        if config.logging.level.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "logging.level".to_string(),
            });
        }

        errors
    }

    fn validate_server_name(name: &str) -> ValidationResult<()> {
        ServerName::try_from(name)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidField {
                field: "upstream_server_name".to_string(),
                message: format!("'{name}' is not a valid DNS name or IP address: {e}"),
            })
    }

    fn validate_duration(field: &str, value: &str) -> ValidationResult<()> {
        let invalid = |reason: String| ValidationError::InvalidDuration {
            field: field.to_string(),
            value: value.to_string(),
            reason,
        };

        match parse_duration(value) {
            Ok(duration) if duration.is_zero() => Err(invalid("must be greater than zero".into())),
            Ok(_) => Ok(()),
            Err(e) => Err(invalid(e.to_string())),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: &[ValidationError]) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
