use thiserror::Error;

use crate::datatype::EntityId;
use crate::validator::{TransactionValidationError, ValidationError};

#[derive(Error, Debug)]
pub enum FacetError {
    #[error("Undefined attribute {key} for {model}")]
    UndefinedAttribute { model: String, key: String },
    #[error("Duplicate attribute {key} for {model}")]
    DuplicateAttribute { model: String, key: String },
    #[error("Undefined finder {name} for {model}")]
    UndefinedFinder { model: String, name: String },
    #[error("Undefined model: {0}")]
    UndefinedModel(String),
    #[error("Unknown type: {0}")]
    UnknownType(String),
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("Undefined variable ?{0} (not used in any clause or input)")]
    UndefinedVariable(String),
    #[error("Unbound variables: {}", .0.join(", "))]
    UnboundVariable(Vec<String>),
    #[error("Unresolved type for ?{0}")]
    UnresolvedType(String),
    #[error("Conflicting types for ?{var}: {first} and {second}")]
    ConflictingType {
        var: String,
        first: String,
        second: String,
    },
    #[error("Entity {0} not found")]
    NotFound(EntityId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    TransactionValidation(#[from] TransactionValidationError),
    #[error("Transaction rejected: {0}")]
    TransactionRejected(String),
    #[error("Parse error: {message}")]
    Parse { message: String },
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, FacetError>;

impl FacetError {
    /// True for both locally detected and store detected validation failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FacetError::Validation(_) | FacetError::TransactionValidation(_)
        )
    }
    /// Messages attributed to `key`, regardless of where the validation failed.
    pub fn errors_on(&self, key: &str) -> Vec<String> {
        match self {
            FacetError::Validation(e) => e.errors_on(key),
            FacetError::TransactionValidation(e) => e
                .errors()
                .into_iter()
                .filter(|v| v.attrs.iter().any(|a| a == key))
                .map(|v| v.message)
                .collect(),
            _ => Vec::new(),
        }
    }
    pub fn has_errors_on(&self, key: &str) -> bool {
        match self {
            FacetError::Validation(e) => e.has_errors_on(key),
            FacetError::TransactionValidation(e) => e.has_errors_on(key),
            _ => false,
        }
    }
}

// Helper conversions
impl From<rusqlite::Error> for FacetError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
impl From<serde_json::Error> for FacetError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
impl From<::config::ConfigError> for FacetError {
    fn from(e: ::config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
impl From<pest::error::Error<crate::datalog::Rule>> for FacetError {
    fn from(e: pest::error::Error<crate::datalog::Rule>) -> Self {
        Self::Parse {
            message: e.to_string(),
        }
    }
}
