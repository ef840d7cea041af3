//! Consumer-owned registration groups.
//!
//! A view layer opens a scope when it mounts, registers its handlers through
//! it, and closes it on unmount. Closing unregisters every handler (cancelling
//! their executions) and detaches every observer the scope attached. Streams
//! fed through the scope are cancelled too.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use actionflow_events::{Action, Pattern};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::Agent;
use crate::bus::{ActionStream, Subscription};
use crate::concurrency::HandlerOptions;
use crate::error::AgentError;
use crate::execution::ExecutionHandle;
use crate::handler::{Handle, HandlerContext, HandlerOutput};
use crate::lock;
use crate::outcome::ProcessResult;
use crate::registry::Callback;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// Registrations owned by one consumer. Closed explicitly or on drop.
pub struct AgentScope {
    id: ScopeId,
    agent: Agent,
    subscriptions: Mutex<Vec<Subscription>>,
    sources: Mutex<Vec<CancellationToken>>,
    closed: AtomicBool,
}

impl AgentScope {
    pub(crate) fn open(id: ScopeId, agent: Agent) -> Self {
        debug!(agent = %agent.id(), scope = %id, "Scope opened");
        Self {
            id,
            agent,
            subscriptions: Mutex::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn on<F>(
        &self,
        pattern: impl Into<Pattern>,
        handler: F,
        options: HandlerOptions,
    ) -> Result<Handle, AgentError>
    where
        F: Fn(HandlerContext) -> anyhow::Result<HandlerOutput> + Send + Sync + 'static,
    {
        self.register(pattern.into(), Callback::On(Arc::new(handler)), options)
    }

    pub fn filter<F>(&self, pattern: impl Into<Pattern>, handler: F) -> Result<Handle, AgentError>
    where
        F: Fn(&HandlerContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(
            pattern.into(),
            Callback::Filter(Arc::new(handler)),
            HandlerOptions::default(),
        )
    }

    /// Attach an observer that is detached when the scope closes.
    pub fn subscribe<F>(&self, observer: F) -> Result<(), AgentError>
    where
        F: Fn(&Action) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let subscription = self.agent.subscribe(observer);
        lock(&self.subscriptions).push(subscription);
        Ok(())
    }

    pub fn process(&self, action: Action) -> Result<ProcessResult, AgentError> {
        self.agent.process(action)
    }

    /// [`Agent::process_stream`], cancelled when the scope closes.
    pub fn process_stream<S>(
        &self,
        stream: S,
        options: HandlerOptions,
    ) -> Result<ExecutionHandle, AgentError>
    where
        S: Stream + Send + 'static,
        S::Item: Into<Value>,
    {
        self.ensure_open()?;
        let handle = self.agent.process_stream(stream, options)?;

        let mut sources = lock(&self.sources);
        sources.retain(|token| !token.is_cancelled());
        sources.push(handle.token().clone());
        drop(sources);

        if self.is_closed() {
            handle.cancel();
            return Err(AgentError::ScopeClosed(self.id));
        }
        Ok(handle)
    }

    pub fn actions_of_type(&self, pattern: impl Into<Pattern>) -> ActionStream {
        self.agent.actions_of_type(pattern)
    }

    /// Dispose everything the scope registered. Returns the number of
    /// handlers removed; `0` on every call after the first.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let removed = self.agent.unregister_scope(self.id);
        let subscriptions: Vec<_> = lock(&self.subscriptions).drain(..).collect();
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        let sources: Vec<_> = lock(&self.sources).drain(..).collect();
        for token in &sources {
            token.cancel();
        }

        debug!(
            agent = %self.agent.id(),
            scope = %self.id,
            handlers = removed,
            observers = subscriptions.len(),
            sources = sources.len(),
            "Scope closed"
        );
        removed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn register(
        &self,
        pattern: Pattern,
        callback: Callback,
        options: HandlerOptions,
    ) -> Result<Handle, AgentError> {
        self.ensure_open()?;
        let handle = self.agent.register(pattern, callback, options, Some(self.id))?;

        // Lost a race with close(): don't leave an orphan behind.
        if self.is_closed() {
            handle.unregister();
            return Err(AgentError::ScopeClosed(self.id));
        }
        Ok(handle)
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.is_closed() {
            return Err(AgentError::ScopeClosed(self.id));
        }
        Ok(())
    }
}

impl Drop for AgentScope {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for AgentScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentScope")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
