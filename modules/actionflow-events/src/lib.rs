//! Action and pattern types for the dispatch agent.
//!
//! An [`Action`] is the only unit of communication: a `type` discriminator
//! plus an open-ended JSON object of fields. A [`Pattern`] decides whether a
//! handler is interested in an action. Zero knowledge of handlers, buses or
//! runtimes.

pub mod error;
pub mod pattern;
pub mod types;

pub use error::{InvalidActionError, PatternError};
pub use pattern::Pattern;
pub use types::Action;
