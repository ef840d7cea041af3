//! Periodic counter driven by an action agent.
//!
//! `step` actions set the increment and (re)start a ticker; every `tick`
//! adds the increment to the count; `stop` ends the ticker. Everything the
//! counter registers lives in one scope and is disposed by [`Counter::unmount`].

pub mod reducer;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use actionflow_engine::{
    Action, Agent, AgentError, AgentScope, HandlerContext, HandlerOptions, HandlerOutput, Pattern,
    ProcessResult,
};
use futures::StreamExt;
use serde_json::Value;
use tracing::info;

pub use reducer::{CounterReducer, CounterState, Reducer};

#[derive(Debug, Clone, Copy)]
pub struct CounterOptions {
    pub period: Duration,
    pub initial: CounterState,
}

impl Default for CounterOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1000),
            initial: CounterState::default(),
        }
    }
}

/// A mounted counter. Unmounting (or dropping) tears down its handlers and
/// any running ticker.
#[derive(Debug)]
pub struct Counter {
    state: Arc<Mutex<CounterState>>,
    scope: AgentScope,
}

impl Counter {
    /// Register the counter's handlers and start ticking at the initial step.
    /// Must be called from within a tokio runtime.
    pub fn mount(agent: &Agent, options: CounterOptions) -> Result<Self, AgentError> {
        let state = Arc::new(Mutex::new(options.initial));
        let scope = agent.scope();

        // The reducer is one destination for step/tick.
        let reduced = state.clone();
        scope.filter(Pattern::regex("step|tick")?, move |ctx| {
            let mut state = reduced.lock().unwrap_or_else(PoisonError::into_inner);
            CounterReducer.reduce(&mut state, ctx.action())
        })?;

        scope.filter(Pattern::any(), |ctx| {
            info!(action = %ctx.action().to_value(), "Action");
            Ok(())
        })?;

        scope.on(
            "step",
            ticker(options.period),
            HandlerOptions::cutoff().with_retag("tick"),
        )?;

        let counter = Self { state, scope };
        counter.set_step(options.initial.step)?;
        Ok(counter)
    }

    pub fn state(&self) -> CounterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the increment. Restarts the ticker, cancelling the previous one.
    pub fn set_step(&self, step: i64) -> Result<ProcessResult, AgentError> {
        self.scope.process(Action::new("step").with("step", step))
    }

    pub fn stop(&self) -> Result<ProcessResult, AgentError> {
        self.scope.process(Action::new("stop"))
    }

    pub fn scope(&self) -> &AgentScope {
        &self.scope
    }

    /// Dispose every handler the counter registered. Returns the final state.
    pub fn unmount(self) -> CounterState {
        let removed = self.scope.close();
        let state = self.state();
        info!(removed, count = state.count, "Counter unmounted");
        state
    }
}

/// Emits the triggering step once per period until a `stop` action arrives.
fn ticker(period: Duration) -> impl Fn(HandlerContext) -> anyhow::Result<HandlerOutput> {
    let period = period.max(Duration::from_millis(1));
    move |ctx: HandlerContext| {
        let step = ctx.action().get("step").cloned().unwrap_or(Value::Null);
        let stop = ctx.agent().next_of_type("stop");

        let ticks = async_stream::stream! {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                yield step.clone();
            }
        };

        Ok(HandlerOutput::values(ticks.take_until(stop)))
    }
}
