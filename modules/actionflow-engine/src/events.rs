//! Lifecycle notifications, for consumers that want to observe handler and
//! execution churn (devtools, logging, tests).

use serde::Serialize;

use crate::execution::ExecutionId;
use crate::handler::{HandlerId, HandlerKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    HandlerRegistered {
        handler: HandlerId,
        kind: HandlerKind,
        pattern: String,
    },
    HandlerUnregistered {
        handler: HandlerId,
        kind: HandlerKind,
        pattern: String,
    },
    ExecutionStarted {
        handler: HandlerId,
        execution: ExecutionId,
        trigger: String,
    },
    ExecutionQueued {
        handler: HandlerId,
        execution: ExecutionId,
        trigger: String,
    },
    ExecutionCompleted {
        handler: HandlerId,
        execution: ExecutionId,
        emitted: usize,
    },
    ExecutionCancelled {
        handler: HandlerId,
        execution: ExecutionId,
        emitted: usize,
    },
    ExecutionFaulted {
        handler: HandlerId,
        execution: ExecutionId,
        error: String,
    },
}

impl AgentEvent {
    pub fn handler(&self) -> HandlerId {
        match self {
            Self::HandlerRegistered { handler, .. }
            | Self::HandlerUnregistered { handler, .. }
            | Self::ExecutionStarted { handler, .. }
            | Self::ExecutionQueued { handler, .. }
            | Self::ExecutionCompleted { handler, .. }
            | Self::ExecutionCancelled { handler, .. }
            | Self::ExecutionFaulted { handler, .. } => *handler,
        }
    }

    /// Short name in the `agent/...` style, e.g. `agent/on/unsub`.
    pub fn name(&self) -> String {
        match self {
            Self::HandlerRegistered { kind, .. } => format!("agent/{kind}"),
            Self::HandlerUnregistered { kind, .. } => format!("agent/{kind}/unsub"),
            Self::ExecutionStarted { .. } => "agent/execution/start".to_string(),
            Self::ExecutionQueued { .. } => "agent/execution/queue".to_string(),
            Self::ExecutionCompleted { .. } => "agent/execution/complete".to_string(),
            Self::ExecutionCancelled { .. } => "agent/execution/cancel".to_string(),
            Self::ExecutionFaulted { .. } => "agent/execution/error".to_string(),
        }
    }
}
