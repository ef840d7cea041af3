//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use actionflow_engine::{HandlerContext, HandlerOutput};
use futures::StreamExt;
use serde_json::Value;

pub const PERIOD: Duration = Duration::from_millis(1000);

/// Periodic emitter: yields the triggering action's `step` once per
/// [`PERIOD`] until a `stop` action is dispatched.
pub fn ticker(ctx: HandlerContext) -> anyhow::Result<HandlerOutput> {
    let step = ctx.action().get("step").cloned().unwrap_or(Value::Null);
    let stop = ctx.agent().next_of_type("stop");

    let ticks = async_stream::stream! {
        let mut interval = tokio::time::interval(PERIOD);
        // First tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            yield step.clone();
        }
    };

    Ok(HandlerOutput::values(ticks.take_until(stop)))
}

/// Deferred value resolving to the action's `step` after `delay`.
pub fn delayed_step(delay: Duration) -> impl Fn(HandlerContext) -> anyhow::Result<HandlerOutput> {
    move |ctx: HandlerContext| {
        let step = ctx.action().get("step").cloned().unwrap_or(Value::Null);
        Ok(HandlerOutput::deferred(async move {
            tokio::time::sleep(delay).await;
            Ok::<_, anyhow::Error>(step)
        }))
    }
}

/// Shared append-only log for ordering assertions.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Payloads of recorded actions of one type.
pub fn payloads(recorder: &actionflow_engine::ActionRecorder, action_type: &str) -> Vec<Value> {
    recorder
        .actions()
        .into_iter()
        .filter(|a| a.action_type() == action_type)
        .map(|a| a.payload().cloned().unwrap_or(Value::Null))
        .collect()
}

pub async fn advance(periods: f64) {
    tokio::time::sleep(PERIOD.mul_f64(periods)).await;
}

/// External source yielding 1, 2, 3, ... once per [`PERIOD`].
pub fn counting() -> impl futures::Stream<Item = Value> + Send + 'static {
    async_stream::stream! {
        let mut interval = tokio::time::interval(PERIOD);
        interval.tick().await;
        let mut n = 0;
        loop {
            interval.tick().await;
            n += 1;
            yield Value::from(n);
        }
    }
}
