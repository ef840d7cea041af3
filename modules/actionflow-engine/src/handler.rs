//! Handler-facing types: identity, invocation context, and what an
//! on-handler may return.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use actionflow_events::Action;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::agent::{Agent, AgentInner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Filter,
    On,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter => f.write_str("filter"),
            Self::On => f.write_str("on"),
        }
    }
}

/// What a handler sees when it is invoked.
pub struct HandlerContext {
    action: Action,
    agent: Agent,
    handler: HandlerId,
}

impl HandlerContext {
    pub(crate) fn new(action: Action, agent: Agent, handler: HandlerId) -> Self {
        Self {
            action,
            agent,
            handler,
        }
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// The dispatching agent, for `process`, `actions_of_type` and friends.
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn handler_id(&self) -> HandlerId {
        self.handler
    }

    pub fn into_action(self) -> Action {
        self.action
    }
}

/// Result of an on-handler invocation.
pub enum HandlerOutput {
    /// Returned to the `process` caller as-is.
    Value(Value),
    /// Resolved on the runtime; re-injected when the handler retags.
    Deferred(BoxFuture<'static, anyhow::Result<Value>>),
    /// Every item becomes an action fed back into `process`. Without a retag
    /// each item must itself be an action object.
    Stream(BoxStream<'static, anyhow::Result<Value>>),
}

impl HandlerOutput {
    pub fn none() -> Self {
        Self::Value(Value::Null)
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// An infallible stream of values.
    pub fn values<S>(stream: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Self::stream(stream.map(Ok))
    }

    /// An infallible stream of ready-made actions.
    pub fn actions<S>(stream: S) -> Self
    where
        S: Stream<Item = Action> + Send + 'static,
    {
        Self::stream(stream.map(|action| Ok(Value::from(action))))
    }
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

pub(crate) type FilterFn = Arc<dyn Fn(&HandlerContext) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type OnFn = Arc<dyn Fn(HandlerContext) -> anyhow::Result<HandlerOutput> + Send + Sync>;

/// Disposable registration returned by `on` and `filter`.
///
/// Dropping a handle leaves the handler registered; call
/// [`Handle::unregister`] (or close the owning scope) to dispose it.
#[derive(Clone)]
pub struct Handle {
    id: HandlerId,
    kind: HandlerKind,
    agent: Weak<AgentInner>,
}

impl Handle {
    pub(crate) fn new(id: HandlerId, kind: HandlerKind, agent: Weak<AgentInner>) -> Self {
        Self { id, kind, agent }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Stop matching and cancel in-flight executions. Returns `false` when the
    /// handler was already gone; calling it twice is harmless.
    pub fn unregister(&self) -> bool {
        self.agent
            .upgrade()
            .is_some_and(|agent| agent.unregister(self.id))
    }

    pub fn is_registered(&self) -> bool {
        self.agent
            .upgrade()
            .is_some_and(|agent| agent.is_registered(self.id))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
