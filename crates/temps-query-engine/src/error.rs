use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable reason a query failed validation
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationErrorCode {
    UnknownDataSource,
    UnknownField,
    TypeMismatch,
    UnsupportedOperator,
    UngroupedField,
    FilterTooComplex,
    LimitOutOfRange,
}

impl fmt::Display for ValidationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationErrorCode::UnknownDataSource => write!(f, "UNKNOWN_DATA_SOURCE"),
            ValidationErrorCode::UnknownField => write!(f, "UNKNOWN_FIELD"),
            ValidationErrorCode::TypeMismatch => write!(f, "TYPE_MISMATCH"),
            ValidationErrorCode::UnsupportedOperator => write!(f, "UNSUPPORTED_OPERATOR"),
            ValidationErrorCode::UngroupedField => write!(f, "UNGROUPED_FIELD"),
            ValidationErrorCode::FilterTooComplex => write!(f, "FILTER_TOO_COMPLEX"),
            ValidationErrorCode::LimitOutOfRange => write!(f, "LIMIT_OUT_OF_RANGE"),
        }
    }
}

/// A single problem found in a query. Always recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: ValidationErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ValidationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            field: None,
            message: message.into(),
        }
    }

    pub fn for_field(
        code: ValidationErrorCode,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

/// Outcome of validating a query; `valid` holds exactly when `errors` is empty
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    valid: bool,
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn ok() -> Self {
        Self::from_errors(Vec::new())
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn has_code(&self, code: ValidationErrorCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    pub fn into_errors(self) -> Vec<ValidationError> {
        self.errors
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionErrorKind {
    Timeout,
    DataSourceUnavailable,
    PermissionDenied,
}

/// Failure while running an optimized query
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Execution window elapsed; the underlying fetch was cancelled
    #[error("Query timeout after {0}ms")]
    Timeout(u64),

    /// Data source could not be reached or failed the read
    #[error("Data source unavailable: {0}")]
    DataSourceUnavailable(String),

    /// Data source refused the read
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl ExecutionError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        ExecutionError::DataSourceUnavailable(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        ExecutionError::PermissionDenied(msg.into())
    }

    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            ExecutionError::Timeout(_) => ExecutionErrorKind::Timeout,
            ExecutionError::DataSourceUnavailable(_) => ExecutionErrorKind::DataSourceUnavailable,
            ExecutionError::PermissionDenied(_) => ExecutionErrorKind::PermissionDenied,
        }
    }

    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::PermissionDenied(_))
    }
}

/// Result store failure. Never fatal to a query.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(error: redis::RedisError) -> Self {
        CacheError::Unavailable(error.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        CacheError::Serialization(error.to_string())
    }
}

/// Schema registry lookup failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Data source not found: {0}")]
    NotFound(String),

    #[error("Invalid data source descriptor: {0}")]
    InvalidDescriptor(String),
}

impl RegistryError {
    pub fn not_found(id: impl Into<String>) -> Self {
        RegistryError::NotFound(id.into())
    }
}

/// Error surfaced by the engine facade
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Query was rejected; every problem is listed
    #[error("Invalid query: {}", summarize(.0))]
    Validation(Vec<ValidationError>),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn validation_errors(&self) -> Option<&[ValidationError]> {
        match self {
            EngineError::Validation(errors) => Some(errors),
            EngineError::Execution(_) => None,
        }
    }

    pub fn execution_error(&self) -> Option<&ExecutionError> {
        match self {
            EngineError::Execution(e) => Some(e),
            EngineError::Validation(_) => None,
        }
    }
}

impl From<ValidationResult> for EngineError {
    fn from(result: ValidationResult) -> Self {
        EngineError::Validation(result.into_errors())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_result_validity_tracks_errors() {
        assert!(ValidationResult::ok().is_valid());

        let result = ValidationResult::from_errors(vec![ValidationError::for_field(
            ValidationErrorCode::UnknownField,
            "regoin",
            "Unknown field 'regoin'",
        )]);
        assert!(!result.is_valid());
        assert!(result.has_code(ValidationErrorCode::UnknownField));
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let json = serde_json::to_value(ValidationErrorCode::UngroupedField).unwrap();
        assert_eq!(json, serde_json::json!("UNGROUPED_FIELD"));
        assert_eq!(
            ValidationErrorCode::FilterTooComplex.to_string(),
            "FILTER_TOO_COMPLEX"
        );
    }

    #[test]
    fn test_retryability() {
        assert!(ExecutionError::Timeout(10).is_retryable());
        assert!(ExecutionError::unavailable("down").is_retryable());
        assert!(!ExecutionError::permission_denied("nope").is_retryable());
    }
}
