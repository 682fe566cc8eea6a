use thiserror::Error;

/// Errors raised while building a rule
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Unsupported field name: {0}")]
    UnknownField(String),

    #[error("Unknown level: {0}")]
    UnknownLevel(String),

    #[error("Invalid inequality operator: {0}")]
    InvalidOperator(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;
