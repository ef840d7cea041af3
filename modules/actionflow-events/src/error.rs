use thiserror::Error;

/// A value that cannot be treated as an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidActionError {
    #[error("action must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("action is missing a string `type` field")]
    MissingType,

    #[error("action `type` must not be empty")]
    EmptyType,
}

/// Pattern construction errors. Raised at registration time, never while matching.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid type expression: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("type set must contain at least one type")]
    EmptyTypeSet,

    #[error("type pattern must not be empty")]
    EmptyType,
}
