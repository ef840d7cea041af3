use actionflow_events::{InvalidActionError, PatternError};
use thiserror::Error;

use crate::execution::ExecutionId;
use crate::handler::HandlerId;
use crate::scope::ScopeId;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid action: {0}")]
    InvalidAction(#[from] InvalidActionError),

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] PatternError),

    /// A filter or on-handler body returned an error synchronously.
    #[error("{handler} failed on `{action_type}`: {source:#}")]
    Handler {
        handler: HandlerId,
        action_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// A deferred value or action stream failed after `process` returned.
    #[error("{execution} of {handler} faulted: {source:#}")]
    ExecutionFault {
        handler: HandlerId,
        execution: ExecutionId,
        #[source]
        source: anyhow::Error,
    },

    #[error("dispatch depth {depth} exceeds limit {max} while processing `{action_type}`")]
    DepthExceeded {
        depth: usize,
        max: usize,
        action_type: String,
    },

    #[error("{handler} has async work but no tokio runtime is running")]
    NoRuntime { handler: HandlerId },

    #[error("{0} is closed")]
    ScopeClosed(ScopeId),
}

impl AgentError {
    /// The handler this error is attributed to, if any.
    pub fn handler(&self) -> Option<HandlerId> {
        match self {
            Self::Handler { handler, .. }
            | Self::ExecutionFault { handler, .. }
            | Self::NoRuntime { handler } => Some(*handler),
            _ => None,
        }
    }
}
