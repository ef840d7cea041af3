//! Dispatch loop and public surface of the agent.
//!
//! validate → publish → filters (sync, in order) → on-handlers (policy
//! decision, then callback) → launch async work. Produced actions come back
//! through `process` and follow the same path.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use actionflow_events::{Action, Pattern};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{ActionBus, ActionStream, Subscription};
use crate::concurrency::{Admission, ConcurrencyController, HandlerOptions, Launch};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::execution::{self, ExecutionHandle, PreparedExecution, Work};
use crate::handler::{Handle, HandlerContext, HandlerId, HandlerKind, HandlerOutput};
use crate::outcome::{HandlerOutcome, Outcome, ProcessResult};
use crate::registry::{Callback, Registration, Registry};
use crate::scope::{AgentScope, ScopeId};

/// Explicitly constructed dispatch agent. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

pub(crate) struct AgentInner {
    id: Uuid,
    config: AgentConfig,
    registry: Registry,
    bus: Arc<ActionBus>,
    controller: ConcurrencyController,
    events: broadcast::Sender<AgentEvent>,
    next_scope: AtomicU64,
}

impl AgentInner {
    pub(crate) fn emit(&self, event: AgentEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn unregister(&self, id: HandlerId) -> bool {
        match self.registry.unregister(id) {
            Some(registration) => {
                self.retire(&registration);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_registered(&self, id: HandlerId) -> bool {
        self.registry.contains(id)
    }

    fn retire(&self, registration: &Registration) {
        let kind = registration.kind();
        if kind == HandlerKind::On {
            for queued in self.controller.dispose(registration.id) {
                queued.abandon(self);
            }
        }

        info!(
            agent = %self.id,
            handler = %registration.id,
            %kind,
            pattern = %registration.pattern,
            "Handler unregistered"
        );
        self.emit(AgentEvent::HandlerUnregistered {
            handler: registration.id,
            kind,
            pattern: registration.pattern.to_string(),
        });
    }
}

thread_local! {
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Tracks nested `process` calls on the current thread.
struct DepthGuard;

impl DepthGuard {
    fn enter(max: usize, action_type: &str) -> Result<Self, AgentError> {
        DISPATCH_DEPTH.with(|depth| {
            let next = depth.get() + 1;
            if next > max {
                return Err(AgentError::DepthExceeded {
                    depth: next,
                    max,
                    action_type: action_type.to_string(),
                });
            }
            depth.set(next);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

impl Agent {
    pub fn new() -> Self {
        Self::with_config(AgentConfig::default())
    }

    pub fn with_config(config: AgentConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = AgentInner {
            id: Uuid::new_v4(),
            config,
            registry: Registry::default(),
            bus: Arc::new(ActionBus::default()),
            controller: ConcurrencyController::default(),
            events,
            next_scope: AtomicU64::new(0),
        };
        debug!(agent = %inner.id, "Agent created");
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register an on-handler. Its callback may return a value, a deferred
    /// value, or a stream of follow-up actions, governed by the options'
    /// concurrency policy.
    pub fn on<F>(
        &self,
        pattern: impl Into<Pattern>,
        handler: F,
        options: HandlerOptions,
    ) -> Result<Handle, AgentError>
    where
        F: Fn(HandlerContext) -> anyhow::Result<HandlerOutput> + Send + Sync + 'static,
    {
        self.register(pattern.into(), Callback::On(Arc::new(handler)), options, None)
    }

    /// Register a filter. Filters run synchronously, before any on-handler,
    /// in registration order.
    pub fn filter<F>(&self, pattern: impl Into<Pattern>, handler: F) -> Result<Handle, AgentError>
    where
        F: Fn(&HandlerContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(
            pattern.into(),
            Callback::Filter(Arc::new(handler)),
            HandlerOptions::default(),
            None,
        )
    }

    /// Dispose a handler. Idempotent.
    pub fn unregister(&self, handle: &Handle) -> bool {
        self.inner.unregister(handle.id())
    }

    /// Open a scope whose registrations are disposed together on close.
    pub fn scope(&self) -> AgentScope {
        let id = ScopeId::new(self.inner.next_scope.fetch_add(1, Ordering::Relaxed) + 1);
        AgentScope::open(id, self.clone())
    }

    pub(crate) fn register(
        &self,
        pattern: Pattern,
        callback: Callback,
        options: HandlerOptions,
        owner: Option<ScopeId>,
    ) -> Result<Handle, AgentError> {
        let controller = &self.inner.controller;
        let registration =
            self.inner
                .registry
                .register(pattern, callback, options, owner, |id, kind| {
                    if kind == HandlerKind::On {
                        controller.open_lane(id);
                    }
                })?;

        let kind = registration.kind();
        info!(
            agent = %self.inner.id,
            handler = %registration.id,
            %kind,
            pattern = %registration.pattern,
            "Handler registered"
        );
        self.emit(AgentEvent::HandlerRegistered {
            handler: registration.id,
            kind,
            pattern: registration.pattern.to_string(),
        });

        Ok(Handle::new(
            registration.id,
            kind,
            Arc::downgrade(&self.inner),
        ))
    }

    pub(crate) fn unregister_scope(&self, owner: ScopeId) -> usize {
        let removed = self.inner.registry.unregister_by_owner(owner);
        for registration in &removed {
            self.inner.retire(registration);
        }
        removed.len()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatch an action. Filters and handler-start decisions complete before
    /// this returns; async handler work continues on the tokio runtime.
    pub fn process(&self, action: Action) -> Result<ProcessResult, AgentError> {
        action.validate()?;
        let _depth = DepthGuard::enter(self.inner.config.max_dispatch_depth, action.action_type())?;

        let filters = self.inner.registry.matching(HandlerKind::Filter, &action);
        let handlers = self.inner.registry.matching(HandlerKind::On, &action);

        let seq = self.inner.bus.publish(&action);
        debug!(
            agent = %self.inner.id,
            seq,
            action_type = action.action_type(),
            filters = filters.len(),
            handlers = handlers.len(),
            "Processing action"
        );

        for registration in &filters {
            let Callback::Filter(callback) = &registration.callback else {
                continue;
            };
            let ctx = HandlerContext::new(action.clone(), self.clone(), registration.id);
            callback(&ctx).map_err(|source| {
                debug!(handler = %registration.id, error = %source, "Filter failed");
                AgentError::Handler {
                    handler: registration.id,
                    action_type: action.action_type().to_string(),
                    source,
                }
            })?;
        }

        let mut outcomes = Vec::with_capacity(handlers.len());
        for registration in &handlers {
            let outcome = self.start(registration, &action)?;
            outcomes.push(HandlerOutcome {
                handler_id: registration.id,
                outcome,
            });
        }

        Ok(ProcessResult {
            action,
            seq,
            filters_run: filters.len(),
            outcomes,
        })
    }

    /// Dispatch raw JSON. Fails with `InvalidAction` before anything runs
    /// when the value has no string `type`.
    pub fn process_value(&self, value: Value) -> Result<ProcessResult, AgentError> {
        let action = Action::try_from(value)?;
        self.process(action)
    }

    /// Feed every item of an external stream through `process`, on its own
    /// execution. Only `options.retag` applies; without it each item must be
    /// an action object. The execution is attributed to a fresh id that no
    /// registered handler shares.
    pub fn process_stream<S>(
        &self,
        stream: S,
        options: HandlerOptions,
    ) -> Result<ExecutionHandle, AgentError>
    where
        S: Stream + Send + 'static,
        S::Item: Into<Value>,
    {
        let source = self.inner.registry.reserve_id();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| AgentError::NoRuntime { handler: source })?;

        let work = Work::Stream(
            stream
                .map(|item| Ok::<Value, anyhow::Error>(item.into()))
                .boxed(),
        );
        let trigger = "stream".to_string();
        let (execution, handle) = PreparedExecution::new(
            self.inner.controller.next_execution_id(),
            source,
            trigger.clone(),
            options.retag,
            work,
        );

        debug!(agent = %self.inner.id, %source, execution = %handle.id(), "Processing external stream");
        self.emit(AgentEvent::ExecutionStarted {
            handler: source,
            execution: handle.id(),
            trigger,
        });
        execution::spawn(&runtime, self.clone(), execution);
        Ok(handle)
    }

    fn start(&self, registration: &Registration, action: &Action) -> Result<Outcome, AgentError> {
        let Callback::On(callback) = &registration.callback else {
            return Ok(Outcome::Skipped);
        };
        let handler = registration.id;

        // Unregistered by an earlier handler in this same dispatch.
        if !registration.is_active() {
            debug!(%handler, "Handler unregistered mid-dispatch, not started");
            return Ok(Outcome::Skipped);
        }

        let policy = registration
            .options
            .concurrency
            .unwrap_or(self.inner.config.default_concurrency);
        let controller = &self.inner.controller;

        if controller.admit(handler, policy) == Admission::Skip {
            debug!(%handler, %policy, action_type = action.action_type(), "Trigger skipped");
            return Ok(Outcome::Skipped);
        }

        let ctx = HandlerContext::new(action.clone(), self.clone(), handler);
        let output = callback(ctx).map_err(|source| {
            debug!(%handler, error = %source, "Handler failed");
            AgentError::Handler {
                handler,
                action_type: action.action_type().to_string(),
                source,
            }
        })?;

        let work = match output {
            HandlerOutput::Value(value) => return Ok(Outcome::Value(value)),
            HandlerOutput::Deferred(future) => Work::Deferred(future),
            HandlerOutput::Stream(stream) => Work::Stream(stream),
        };

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| AgentError::NoRuntime { handler })?;

        let trigger = action.action_type().to_string();
        let (execution, handle) = PreparedExecution::new(
            controller.next_execution_id(),
            handler,
            trigger.clone(),
            registration.options.retag.clone(),
            work,
        );

        match controller.launch(handler, policy, execution) {
            Launch::Start(execution) => {
                self.emit(AgentEvent::ExecutionStarted {
                    handler,
                    execution: handle.id(),
                    trigger,
                });
                execution::spawn(&runtime, self.clone(), execution);
                Ok(Outcome::Started(handle))
            }
            Launch::Queued => {
                debug!(%handler, execution = %handle.id(), "Execution queued");
                self.emit(AgentEvent::ExecutionQueued {
                    handler,
                    execution: handle.id(),
                    trigger,
                });
                Ok(Outcome::Queued(handle))
            }
            Launch::Rejected(execution) => {
                debug!(%handler, %policy, "Execution rejected at launch");
                execution.token().cancel();
                Ok(Outcome::Skipped)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Observe every action published from now on, regardless of pattern.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Action) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(Arc::new(observer))
    }

    /// A fresh stream of matching actions published after this call.
    pub fn actions_of_type(&self, pattern: impl Into<Pattern>) -> ActionStream {
        self.inner.bus.stream(pattern.into())
    }

    /// Resolves with the next matching action. The subscription starts now,
    /// not when the future is first polled, so it can be handed to
    /// `take_until` without missing an action dispatched in between.
    pub fn next_of_type(
        &self,
        pattern: impl Into<Pattern>,
    ) -> impl Future<Output = Option<Action>> + Send + 'static {
        let mut stream = self.actions_of_type(pattern);
        async move { stream.next().await }
    }

    /// Handler and execution lifecycle notifications.
    pub fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events.subscribe()
    }

    pub fn handler_count(&self, kind: HandlerKind) -> usize {
        self.inner.registry.len(kind)
    }

    pub fn live_executions(&self, handle: &Handle) -> usize {
        self.inner.controller.live_count(handle.id())
    }

    pub fn queued_executions(&self, handle: &Handle) -> usize {
        self.inner.controller.queued_count(handle.id())
    }

    /// Number of actions published so far.
    pub fn published(&self) -> u64 {
        self.inner.bus.published()
    }

    pub(crate) fn controller(&self) -> &ConcurrencyController {
        &self.inner.controller
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        self.inner.emit(event);
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("filters", &self.handler_count(HandlerKind::Filter))
            .field("handlers", &self.handler_count(HandlerKind::On))
            .field("published", &self.published())
            .finish()
    }
}
