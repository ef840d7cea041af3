use actionflow_events::Action;
use serde_json::Value;

use crate::execution::ExecutionHandle;
use crate::handler::HandlerId;

/// What `process` did with one action.
#[derive(Debug)]
pub struct ProcessResult {
    pub(crate) action: Action,
    pub(crate) seq: u64,
    pub(crate) filters_run: usize,
    pub(crate) outcomes: Vec<HandlerOutcome>,
}

/// One on-handler's response to the action.
#[derive(Debug)]
pub struct HandlerOutcome {
    pub handler_id: HandlerId,
    pub outcome: Outcome,
}

#[derive(Debug)]
pub enum Outcome {
    /// Plain value returned synchronously.
    Value(Value),
    /// Async work launched.
    Started(ExecutionHandle),
    /// Async work waiting behind a live execution (serial policy).
    Queued(ExecutionHandle),
    /// The policy dropped the trigger, or the handler was unregistered
    /// mid-dispatch.
    Skipped,
}

impl Outcome {
    pub fn execution(&self) -> Option<&ExecutionHandle> {
        match self {
            Self::Started(handle) | Self::Queued(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

impl ProcessResult {
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Position of the action in the agent's bus sequence.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn filters_run(&self) -> usize {
        self.filters_run
    }

    pub fn outcomes(&self) -> &[HandlerOutcome] {
        &self.outcomes
    }

    /// True when no filter or on-handler matched.
    pub fn is_unhandled(&self) -> bool {
        self.filters_run == 0 && self.outcomes.is_empty()
    }

    /// Plain values, in on-handler registration order.
    pub fn values(&self) -> Vec<&Value> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                Outcome::Value(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn executions(&self) -> impl Iterator<Item = &ExecutionHandle> {
        self.outcomes.iter().filter_map(|o| o.outcome.execution())
    }

    pub fn into_executions(self) -> Vec<ExecutionHandle> {
        self.outcomes
            .into_iter()
            .filter_map(|o| match o.outcome {
                Outcome::Started(handle) | Outcome::Queued(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// The single execution this action launched. Convenience for the common
    /// one-handler case.
    pub fn into_execution(self) -> Option<ExecutionHandle> {
        self.into_executions().into_iter().next()
    }
}
