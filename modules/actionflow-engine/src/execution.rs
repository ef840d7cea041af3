//! In-flight executions of on-handler output.
//!
//! An execution owns the deferred value or action stream a handler returned.
//! It runs on a tokio task, re-injects every produced action through
//! `Agent::process`, and stops at the first of: stream end, error, or
//! cancellation of its token. Dropping the stream releases whatever timers or
//! subscriptions it held.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use actionflow_events::Action;
use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{Agent, AgentInner};
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::handler::HandlerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ExecutionId(u64);

impl ExecutionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution-{}", self.0)
    }
}

/// How an execution ended, when it did not fault.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Stream ended or deferred value resolved. `value` is the resolved
    /// deferred value; streams have none.
    Completed { emitted: usize, value: Option<Value> },
    /// Cancelled by policy, unregistration, or its handle.
    Cancelled { emitted: usize },
}

impl ExecutionOutcome {
    pub fn emitted(&self) -> usize {
        match self {
            Self::Completed { emitted, .. } | Self::Cancelled { emitted } => *emitted,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

pub(crate) enum Work {
    Deferred(BoxFuture<'static, anyhow::Result<Value>>),
    Stream(BoxStream<'static, anyhow::Result<Value>>),
}

type Completion = Result<ExecutionOutcome, AgentError>;

/// Execution state before and while it runs. Owned by the controller's queue
/// or by the driving task.
pub(crate) struct PreparedExecution {
    id: ExecutionId,
    handler: HandlerId,
    trigger: String,
    retag: Option<String>,
    token: CancellationToken,
    produced: Arc<AtomicUsize>,
    work: Work,
    done: oneshot::Sender<Completion>,
}

impl PreparedExecution {
    pub fn new(
        id: ExecutionId,
        handler: HandlerId,
        trigger: String,
        retag: Option<String>,
        work: Work,
    ) -> (Self, ExecutionHandle) {
        let token = CancellationToken::new();
        let produced = Arc::new(AtomicUsize::new(0));
        let (done, completion) = oneshot::channel();

        let handle = ExecutionHandle {
            id,
            handler,
            token: token.clone(),
            produced: produced.clone(),
            completion,
        };
        let execution = Self {
            id,
            handler,
            trigger,
            retag,
            token,
            produced,
            work,
            done,
        };
        (execution, handle)
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// Resolve an execution that will never run.
    pub fn abandon(self, agent: &AgentInner) {
        let emitted = self.produced.load(Ordering::Acquire);
        agent.emit(AgentEvent::ExecutionCancelled {
            handler: self.handler,
            execution: self.id,
            emitted,
        });
        let _ = self.done.send(Ok(ExecutionOutcome::Cancelled { emitted }));
    }
}

/// Caller-side view of an execution returned from `process`.
///
/// Dropping the handle does not cancel the execution.
pub struct ExecutionHandle {
    id: ExecutionId,
    handler: HandlerId,
    token: CancellationToken,
    produced: Arc<AtomicUsize>,
    completion: oneshot::Receiver<Completion>,
}

impl ExecutionHandle {
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn handler_id(&self) -> HandlerId {
        self.handler
    }

    /// Stop the execution. No further actions are re-injected once this
    /// returns. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Actions re-injected so far.
    pub fn emitted(&self) -> usize {
        self.produced.load(Ordering::Acquire)
    }

    /// Wait for the execution to end. Faults surface as
    /// [`AgentError::ExecutionFault`].
    pub async fn completion(self) -> Result<ExecutionOutcome, AgentError> {
        let emitted = self.produced.clone();
        match self.completion.await {
            Ok(result) => result,
            // The driving task was torn down with its runtime.
            Err(_) => Ok(ExecutionOutcome::Cancelled {
                emitted: emitted.load(Ordering::Acquire),
            }),
        }
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("handler", &self.handler)
            .field("emitted", &self.emitted())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Spawn the driving task on the given runtime.
pub(crate) fn spawn(runtime: &tokio::runtime::Handle, agent: Agent, execution: PreparedExecution) {
    runtime.spawn(drive(agent, execution));
}

async fn drive(agent: Agent, execution: PreparedExecution) {
    let PreparedExecution {
        id,
        handler,
        trigger,
        retag,
        token,
        produced,
        work,
        done,
    } = execution;

    debug!(%handler, execution = %id, trigger = trigger.as_str(), "Execution running");

    let run = async {
        match work {
            Work::Deferred(future) => {
                run_deferred(&agent, future, retag.as_deref(), &token, &produced).await
            }
            Work::Stream(stream) => {
                run_stream(&agent, stream, retag.as_deref(), &token, &produced).await
            }
        }
    };
    // A panicking handler future must still release its lane below.
    let result = match AssertUnwindSafe(run).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("execution panicked: {}", panic_message(panic.as_ref()))),
    };

    if let Some(next) = agent.controller().finish(handler, id) {
        agent.emit(AgentEvent::ExecutionStarted {
            handler,
            execution: next.id(),
            trigger: next.trigger().to_string(),
        });
        spawn(&tokio::runtime::Handle::current(), agent.clone(), next);
    }

    let completion = match result {
        Ok(outcome) => {
            let event = match &outcome {
                ExecutionOutcome::Completed { emitted, .. } => {
                    debug!(%handler, execution = %id, emitted, "Execution completed");
                    AgentEvent::ExecutionCompleted {
                        handler,
                        execution: id,
                        emitted: *emitted,
                    }
                }
                ExecutionOutcome::Cancelled { emitted } => {
                    debug!(%handler, execution = %id, emitted, "Execution cancelled");
                    AgentEvent::ExecutionCancelled {
                        handler,
                        execution: id,
                        emitted: *emitted,
                    }
                }
            };
            agent.emit(event);
            Ok(outcome)
        }
        Err(source) => {
            let error = format!("{source:#}");
            warn!(%handler, execution = %id, error = error.as_str(), "Execution faulted");
            agent.emit(AgentEvent::ExecutionFaulted {
                handler,
                execution: id,
                error,
            });
            Err(AgentError::ExecutionFault {
                handler,
                execution: id,
                source,
            })
        }
    };

    let _ = done.send(completion);
}

async fn run_deferred(
    agent: &Agent,
    future: BoxFuture<'static, anyhow::Result<Value>>,
    retag: Option<&str>,
    token: &CancellationToken,
    produced: &AtomicUsize,
) -> anyhow::Result<ExecutionOutcome> {
    let value = tokio::select! {
        biased;
        _ = token.cancelled() => {
            return Ok(ExecutionOutcome::Cancelled { emitted: 0 });
        }
        value = future => value?,
    };

    if let Some(action_type) = retag {
        if token.is_cancelled() {
            return Ok(ExecutionOutcome::Cancelled { emitted: 0 });
        }
        reinject(agent, Action::new(action_type).with_payload(value.clone()), produced)?;
    }

    Ok(ExecutionOutcome::Completed {
        emitted: produced.load(Ordering::Acquire),
        value: Some(value),
    })
}

async fn run_stream(
    agent: &Agent,
    mut stream: BoxStream<'static, anyhow::Result<Value>>,
    retag: Option<&str>,
    token: &CancellationToken,
    produced: &AtomicUsize,
) -> anyhow::Result<ExecutionOutcome> {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            next = stream.next() => Some(next),
        };

        let item = match next {
            // Cancelled while waiting.
            None => break,
            Some(None) => {
                return Ok(ExecutionOutcome::Completed {
                    emitted: produced.load(Ordering::Acquire),
                    value: None,
                });
            }
            Some(Some(item)) => item?,
        };

        // The token may have been cancelled by the action this stream just
        // produced a value for, on another thread.
        if token.is_cancelled() {
            break;
        }

        let action = match retag {
            Some(action_type) => Action::new(action_type).with_payload(item),
            None => Action::try_from(item)?,
        };
        reinject(agent, action, produced)?;
    }

    Ok(ExecutionOutcome::Cancelled {
        emitted: produced.load(Ordering::Acquire),
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

fn reinject(agent: &Agent, action: Action, produced: &AtomicUsize) -> anyhow::Result<()> {
    produced.fetch_add(1, Ordering::AcqRel);
    agent.process(action)?;
    Ok(())
}
