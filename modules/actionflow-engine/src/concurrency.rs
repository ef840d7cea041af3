//! Concurrency policies and the per-handler controller that enforces them.
//!
//! Every on-handler owns a lane. A lane tracks the executions currently live
//! for that handler and, under [`Concurrency::Serial`], the executions
//! waiting their turn. Lanes are opened at registration and disposed at
//! unregistration; nothing is ever launched into a disposed lane.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::execution::{ExecutionId, PreparedExecution};
use crate::handler::HandlerId;
use crate::lock;

/// How overlapping executions of one on-handler interact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    /// Every trigger starts an independent execution.
    #[default]
    Parallel,
    /// A trigger cancels the live execution, then starts its own.
    Cutoff,
    /// Triggers queue behind the live execution, first in first out.
    Serial,
    /// Triggers are dropped while an execution is live.
    Ignore,
    /// A trigger cancels the live execution and starts nothing, or starts
    /// one when none is live.
    Toggle,
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parallel => "parallel",
            Self::Cutoff => "cutoff",
            Self::Serial => "serial",
            Self::Ignore => "ignore",
            Self::Toggle => "toggle",
        };
        f.write_str(name)
    }
}

impl FromStr for Concurrency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parallel" => Ok(Self::Parallel),
            "cutoff" => Ok(Self::Cutoff),
            "serial" | "queued" => Ok(Self::Serial),
            "ignore" | "mute" => Ok(Self::Ignore),
            "toggle" => Ok(Self::Toggle),
            other => Err(format!(
                "unknown concurrency policy `{other}` (expected parallel, cutoff, serial, ignore or toggle)"
            )),
        }
    }
}

/// Options for an on-handler registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// `None` falls back to the agent's configured default.
    pub concurrency: Option<Concurrency>,
    /// Wrap every produced value as `{ type: retag, payload: value }` before
    /// it is processed.
    pub retag: Option<String>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallel() -> Self {
        Self::new().with_concurrency(Concurrency::Parallel)
    }

    pub fn cutoff() -> Self {
        Self::new().with_concurrency(Concurrency::Cutoff)
    }

    pub fn serial() -> Self {
        Self::new().with_concurrency(Concurrency::Serial)
    }

    pub fn ignore() -> Self {
        Self::new().with_concurrency(Concurrency::Ignore)
    }

    pub fn toggle() -> Self {
        Self::new().with_concurrency(Concurrency::Toggle)
    }

    pub fn with_concurrency(mut self, policy: Concurrency) -> Self {
        self.concurrency = Some(policy);
        self
    }

    pub fn with_retag(mut self, action_type: impl Into<String>) -> Self {
        self.retag = Some(action_type.into());
        self
    }
}

/// Decision taken before a handler callback is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Proceed,
    Skip,
}

/// Decision taken once the callback produced async work.
pub(crate) enum Launch {
    Start(PreparedExecution),
    Queued,
    Rejected(PreparedExecution),
}

#[derive(Default)]
struct Lane {
    running: Vec<(ExecutionId, CancellationToken)>,
    queued: VecDeque<PreparedExecution>,
}

impl Lane {
    fn cancel_running(&mut self) -> usize {
        let cancelled = self.running.len();
        for (_, token) in self.running.drain(..) {
            token.cancel();
        }
        cancelled
    }
}

#[derive(Default)]
pub(crate) struct ConcurrencyController {
    next_execution: AtomicU64,
    lanes: Mutex<HashMap<HandlerId, Lane>>,
}

impl ConcurrencyController {
    pub fn next_execution_id(&self) -> ExecutionId {
        ExecutionId::new(self.next_execution.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn open_lane(&self, handler: HandlerId) {
        lock(&self.lanes).entry(handler).or_default();
    }

    /// Pre-invocation check. Cancels superseded executions synchronously, so a
    /// cutoff handler's previous run is dead before the new callback runs.
    pub fn admit(&self, handler: HandlerId, policy: Concurrency) -> Admission {
        let mut lanes = lock(&self.lanes);
        let Some(lane) = lanes.get_mut(&handler) else {
            return Admission::Skip;
        };

        match policy {
            Concurrency::Parallel | Concurrency::Serial => Admission::Proceed,
            Concurrency::Cutoff => {
                let cancelled = lane.cancel_running();
                if cancelled > 0 {
                    debug!(%handler, cancelled, "Cutoff cancelled live execution");
                }
                Admission::Proceed
            }
            Concurrency::Ignore => {
                if lane.running.is_empty() {
                    Admission::Proceed
                } else {
                    Admission::Skip
                }
            }
            Concurrency::Toggle => {
                if lane.cancel_running() > 0 {
                    debug!(%handler, "Toggle cancelled live execution");
                    Admission::Skip
                } else {
                    Admission::Proceed
                }
            }
        }
    }

    /// Place freshly produced work. Re-checks the lane because the callback
    /// may have dispatched (and started executions) re-entrantly.
    pub fn launch(
        &self,
        handler: HandlerId,
        policy: Concurrency,
        execution: PreparedExecution,
    ) -> Launch {
        let mut lanes = lock(&self.lanes);
        let Some(lane) = lanes.get_mut(&handler) else {
            return Launch::Rejected(execution);
        };

        match policy {
            Concurrency::Parallel => {}
            Concurrency::Cutoff => {
                lane.cancel_running();
            }
            Concurrency::Serial => {
                if !lane.running.is_empty() || !lane.queued.is_empty() {
                    lane.queued.push_back(execution);
                    return Launch::Queued;
                }
            }
            Concurrency::Ignore | Concurrency::Toggle => {
                if !lane.running.is_empty() {
                    return Launch::Rejected(execution);
                }
            }
        }

        lane.running.push((execution.id(), execution.token().clone()));
        Launch::Start(execution)
    }

    /// Remove a finished execution. Returns the next queued execution, already
    /// marked live, when the lane is serial.
    pub fn finish(&self, handler: HandlerId, execution: ExecutionId) -> Option<PreparedExecution> {
        let mut lanes = lock(&self.lanes);
        let lane = lanes.get_mut(&handler)?;
        lane.running.retain(|(id, _)| *id != execution);

        if !lane.running.is_empty() {
            return None;
        }
        let next = lane.queued.pop_front()?;
        lane.running.push((next.id(), next.token().clone()));
        Some(next)
    }

    /// Cancel everything tied to the handler and forget the lane. Returns the
    /// queued executions that never started.
    pub fn dispose(&self, handler: HandlerId) -> Vec<PreparedExecution> {
        let Some(mut lane) = lock(&self.lanes).remove(&handler) else {
            return Vec::new();
        };
        let cancelled = lane.cancel_running();
        let queued: Vec<_> = lane.queued.drain(..).collect();
        for execution in &queued {
            execution.token().cancel();
        }
        debug!(%handler, cancelled, queued = queued.len(), "Disposed handler lane");
        queued
    }

    pub fn live_count(&self, handler: HandlerId) -> usize {
        lock(&self.lanes)
            .get(&handler)
            .map_or(0, |lane| lane.running.len())
    }

    pub fn queued_count(&self, handler: HandlerId) -> usize {
        lock(&self.lanes)
            .get(&handler)
            .map_or(0, |lane| lane.queued.len())
    }
}
