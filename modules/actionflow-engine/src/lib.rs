//! Action dispatch agent.
//!
//! Accepts typed actions, runs matching filter-handlers synchronously in
//! registration order, then starts matching on-handlers under their
//! concurrency policy. On-handlers may return a plain value, a deferred
//! value, or a stream whose items are fed back into `process`.
//!
//! Consumers register handlers on an explicitly constructed [`Agent`] (or an
//! [`AgentScope`] that disposes everything it registered on close) and drive
//! it with [`Agent::process`].

pub mod agent;
pub mod bus;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod handler;
pub mod outcome;
pub mod recorder;
pub mod registry;
pub mod scope;

pub use actionflow_events::{Action, InvalidActionError, Pattern, PatternError};
pub use agent::Agent;
pub use bus::{ActionStream, Subscription};
pub use concurrency::{Concurrency, HandlerOptions};
pub use config::{load_config, AgentConfig, ConfigError};
pub use error::AgentError;
pub use events::AgentEvent;
pub use execution::{ExecutionHandle, ExecutionId, ExecutionOutcome};
pub use handler::{Handle, HandlerContext, HandlerId, HandlerKind, HandlerOutput};
pub use outcome::{HandlerOutcome, Outcome, ProcessResult};
pub use recorder::{ActionRecorder, RecordedAction};
pub use scope::{AgentScope, ScopeId};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock without propagating poison. No callback runs while an agent lock is
/// held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
