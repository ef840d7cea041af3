//! Pure state folding for the counter.

use actionflow_engine::Action;
use anyhow::{bail, Result};
use serde::Serialize;

/// Pure state updates. No I/O, no side effects.
pub trait Reducer<S>: Send + Sync {
    fn reduce(&self, state: &mut S, action: &Action) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterState {
    pub count: i64,
    pub step: i64,
}

impl Default for CounterState {
    fn default() -> Self {
        Self { count: 0, step: 1 }
    }
}

/// `tick` adds the current step to the count; `step` replaces the step.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterReducer;

impl Reducer<CounterState> for CounterReducer {
    fn reduce(&self, state: &mut CounterState, action: &Action) -> Result<()> {
        match action.action_type() {
            "tick" => {
                state.count = state.count.saturating_add(state.step);
            }
            "step" => {
                let Some(step) = action.get("step").and_then(|v| v.as_i64()) else {
                    bail!("step action needs an integer `step` field");
                };
                state.step = step;
            }
            other => bail!("counter cannot reduce `{other}`"),
        }
        Ok(())
    }
}
