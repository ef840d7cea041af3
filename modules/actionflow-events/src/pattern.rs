//! Pattern matching over action types.
//!
//! Matching is pure and total. Anything that could fail (a bad regular
//! expression, an empty type set) fails when the pattern is built or
//! validated, which happens when a handler is registered.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::PatternError;
use crate::types::Action;

type PredicateFn = dyn Fn(&Action) -> bool + Send + Sync;

/// Which actions a handler or stream is interested in.
#[derive(Clone)]
pub enum Pattern {
    /// Every action.
    Any,
    /// `type` equals the string.
    Type(String),
    /// `type` is one of the strings.
    Types(Vec<String>),
    /// Regular expression tested (unanchored) against `type`.
    Expr(Regex),
    /// Arbitrary test over the whole action.
    Predicate(Arc<PredicateFn>),
}

impl Pattern {
    pub fn any() -> Self {
        Self::Any
    }

    pub fn regex(expr: &str) -> Result<Self, PatternError> {
        Ok(Self::Expr(Regex::new(expr)?))
    }

    pub fn predicate(f: impl Fn(&Action) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, action: &Action) -> bool {
        let action_type = action.action_type();
        match self {
            Self::Any => true,
            Self::Type(t) => t == action_type,
            Self::Types(types) => types.iter().any(|t| t == action_type),
            Self::Expr(re) => re.is_match(action_type),
            Self::Predicate(f) => f(action),
        }
    }

    /// Reject patterns that could never sensibly match.
    pub fn validate(&self) -> Result<(), PatternError> {
        match self {
            Self::Type(t) if t.is_empty() => Err(PatternError::EmptyType),
            Self::Types(types) if types.is_empty() => Err(PatternError::EmptyTypeSet),
            Self::Types(types) if types.iter().any(String::is_empty) => {
                Err(PatternError::EmptyType)
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Type(t) => write!(f, "{t}"),
            Self::Types(types) => write!(f, "[{}]", types.join(", ")),
            Self::Expr(re) => write!(f, "/{}/", re.as_str()),
            Self::Predicate(_) => write!(f, "<predicate>"),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({self})")
    }
}

impl From<&str> for Pattern {
    fn from(t: &str) -> Self {
        Self::Type(t.to_string())
    }
}

impl From<String> for Pattern {
    fn from(t: String) -> Self {
        Self::Type(t)
    }
}

impl From<&String> for Pattern {
    fn from(t: &String) -> Self {
        Self::Type(t.clone())
    }
}

impl From<Vec<String>> for Pattern {
    fn from(types: Vec<String>) -> Self {
        Self::Types(types)
    }
}

impl From<Vec<&str>> for Pattern {
    fn from(types: Vec<&str>) -> Self {
        Self::Types(types.into_iter().map(String::from).collect())
    }
}

impl From<&[&str]> for Pattern {
    fn from(types: &[&str]) -> Self {
        Self::Types(types.iter().map(|t| t.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Pattern {
    fn from(types: [&str; N]) -> Self {
        Self::Types(types.iter().map(|t| t.to_string()).collect())
    }
}

impl From<Regex> for Pattern {
    fn from(re: Regex) -> Self {
        Self::Expr(re)
    }
}
