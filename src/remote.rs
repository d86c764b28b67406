//! Remote-control parameter surface of the pipeline stages.
//!
//! Each controllable stage exposes a flat list of named parameters with
//! get/set semantics. The transport carrying these calls (telnet, message
//! queue) lives outside this crate; stages only implement the trait.

/// Error returned by parameter get/set operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParameterError {
    #[error("Parameter '{0}' is read-only")]
    ReadOnly(String),

    #[error("Parameter '{0}' does not exist")]
    Unknown(String),

    #[error("Invalid value for '{parameter}': {message}")]
    InvalidValue { parameter: String, message: String },
}

impl ParameterError {
    pub fn invalid(parameter: &str, message: impl ToString) -> Self {
        ParameterError::InvalidValue {
            parameter: parameter.to_string(),
            message: message.to_string(),
        }
    }
}

/// Description of one remote-controllable parameter.
#[derive(Debug, Clone, Copy)]
pub struct ParameterInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// A pipeline stage with remotely adjustable parameters.
pub trait RemoteControllable: Send + Sync {
    /// Short name this stage is addressed by.
    fn rc_name(&self) -> &'static str;

    /// The parameters this stage exports.
    fn parameters(&self) -> &'static [ParameterInfo];

    /// Set a parameter from its text representation.
    fn set_parameter(&self, parameter: &str, value: &str) -> Result<(), ParameterError>;

    /// Get a parameter as text.
    fn get_parameter(&self, parameter: &str) -> Result<String, ParameterError>;
}

/// Parse a boolean remote-control value (`0`/`1`/`false`/`true`).
pub(crate) fn parse_bool(parameter: &str, value: &str) -> Result<bool, ParameterError> {
    match value.trim() {
        "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        other => Err(ParameterError::invalid(
            parameter,
            format!("expected 0/1/false/true, got '{}'", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("muting", "1").unwrap(), true);
        assert_eq!(parse_bool("muting", "false").unwrap(), false);
        assert!(parse_bool("muting", "maybe").is_err());
    }

    #[test]
    fn test_error_display() {
        let err = ParameterError::ReadOnly("underruns".to_string());
        assert_eq!(err.to_string(), "Parameter 'underruns' is read-only");
    }
}
