//! Concurrency policies on virtual time. Every test runs with the clock
//! paused so interval emitters advance deterministically.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use actionflow_engine::{
    Action, ActionRecorder, Agent, AgentError, AgentEvent, Concurrency, ExecutionOutcome,
    HandlerContext, HandlerOptions, HandlerOutput, Outcome,
};
use common::{advance, delayed_step, payloads, ticker, PERIOD};
use futures::{stream, StreamExt};
use serde_json::{json, Value};

fn step(n: i64) -> Action {
    Action::new("step").with("step", n)
}

// ---------------------------------------------------------------------------
// Cutoff
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn step_tick_stop_scenario() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    agent
        .on("step", ticker, HandlerOptions::cutoff().with_retag("tick"))
        .unwrap();

    let handle = agent.process(step(1)).unwrap().into_execution().unwrap();
    advance(3.5).await;
    agent.process(Action::new("stop")).unwrap();
    advance(3.0).await;

    assert_eq!(recorder.types(), vec!["step", "tick", "tick", "tick", "stop"]);
    assert_eq!(payloads(&recorder, "tick"), vec![json!(1); 3]);

    // Ended by its own termination signal, not by the controller.
    let outcome = handle.completion().await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Completed { emitted: 3, .. }));
}

#[tokio::test(start_paused = true)]
async fn rapid_steps_keep_only_the_latest_emitter() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let invocations = Arc::new(AtomicUsize::new(0));

    let i = invocations.clone();
    let handler = agent
        .on(
            "step",
            move |ctx: HandlerContext| {
                i.fetch_add(1, Ordering::SeqCst);
                ticker(ctx)
            },
            HandlerOptions::cutoff().with_retag("tick"),
        )
        .unwrap();

    let first = agent.process(step(2)).unwrap().into_execution().unwrap();
    let second = agent.process(step(5)).unwrap().into_execution().unwrap();

    // The superseded execution is cancelled before the second callback ran.
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(agent.live_executions(&handler), 1);

    advance(3.5).await;

    assert_eq!(payloads(&recorder, "tick"), vec![json!(5); 3]);
    assert!(matches!(
        first.completion().await.unwrap(),
        ExecutionOutcome::Cancelled { emitted: 0 }
    ));
}

#[tokio::test(start_paused = true)]
async fn cutoff_bounds_the_previous_emitter() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    agent
        .on("step", ticker, HandlerOptions::cutoff().with_retag("tick"))
        .unwrap();

    let first = agent.process(step(1)).unwrap().into_execution().unwrap();
    advance(2.5).await;
    agent.process(step(7)).unwrap();
    advance(2.5).await;

    assert_eq!(
        payloads(&recorder, "tick"),
        vec![json!(1), json!(1), json!(7), json!(7)]
    );
    assert!(matches!(
        first.completion().await.unwrap(),
        ExecutionOutcome::Cancelled { emitted: 2 }
    ));
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn parallel_executions_are_independent() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let handler = agent
        .on("step", ticker, HandlerOptions::parallel().with_retag("tick"))
        .unwrap();

    let one = agent.process(step(1)).unwrap().into_execution().unwrap();
    let two = agent.process(step(2)).unwrap().into_execution().unwrap();
    assert_eq!(agent.live_executions(&handler), 2);

    advance(2.5).await;
    assert_eq!(recorder.count_of("tick"), 4);

    one.cancel();
    advance(2.0).await;

    let ticks = payloads(&recorder, "tick");
    assert_eq!(ticks.iter().filter(|v| **v == json!(1)).count(), 2);
    assert_eq!(ticks.iter().filter(|v| **v == json!(2)).count(), 4);
    assert!(!two.is_cancelled());
    assert_eq!(agent.live_executions(&handler), 1);
}

#[tokio::test(start_paused = true)]
async fn default_policy_comes_from_config() {
    let config = actionflow_engine::AgentConfig::default()
        .with_default_concurrency(Concurrency::Cutoff);
    let agent = Agent::with_config(config);
    let handler = agent
        .on("step", ticker, HandlerOptions::new().with_retag("tick"))
        .unwrap();

    let first = agent.process(step(1)).unwrap().into_execution().unwrap();
    agent.process(step(2)).unwrap();

    assert!(first.is_cancelled());
    advance(0.5).await;
    assert_eq!(agent.live_executions(&handler), 1);
}

// ---------------------------------------------------------------------------
// Serial
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn serial_runs_queued_executions_in_order() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let handler = agent
        .on(
            "step",
            delayed_step(PERIOD),
            HandlerOptions::serial().with_retag("done"),
        )
        .unwrap();

    let mut handles = Vec::new();
    for n in 1..=3 {
        let result = agent.process(step(n)).unwrap();
        match &result.outcomes()[0].outcome {
            Outcome::Started(_) => assert_eq!(n, 1),
            Outcome::Queued(_) => assert!(n > 1),
            other => panic!("unexpected outcome {other:?}"),
        }
        handles.extend(result.into_executions());
    }
    assert_eq!(agent.queued_executions(&handler), 2);

    advance(1.5).await;
    assert_eq!(payloads(&recorder, "done"), vec![json!(1)]);
    assert_eq!(agent.queued_executions(&handler), 1);

    advance(2.0).await;
    assert_eq!(payloads(&recorder, "done"), vec![json!(1), json!(2), json!(3)]);

    for (n, handle) in (1..=3).zip(handles) {
        let outcome = handle.completion().await.unwrap();
        assert!(
            matches!(&outcome, ExecutionOutcome::Completed { value: Some(v), .. } if *v == json!(n)),
            "{outcome:?}"
        );
    }
    assert_eq!(agent.live_executions(&handler), 0);
}

#[tokio::test(start_paused = true)]
async fn unregistering_abandons_queued_work() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let handler = agent
        .on(
            "step",
            delayed_step(PERIOD),
            HandlerOptions::serial().with_retag("done"),
        )
        .unwrap();

    let running = agent.process(step(1)).unwrap().into_execution().unwrap();
    let queued = agent.process(step(2)).unwrap().into_execution().unwrap();

    handler.unregister();

    assert!(queued.completion().await.unwrap().is_cancelled());
    assert!(running.completion().await.unwrap().is_cancelled());
    advance(3.0).await;
    assert_eq!(recorder.count_of("done"), 0);
}

// ---------------------------------------------------------------------------
// Ignore / toggle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ignore_drops_triggers_while_busy() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let invocations = Arc::new(AtomicUsize::new(0));

    let i = invocations.clone();
    let work = delayed_step(PERIOD);
    agent
        .on(
            "step",
            move |ctx: HandlerContext| {
                i.fetch_add(1, Ordering::SeqCst);
                work(ctx)
            },
            HandlerOptions::ignore().with_retag("done"),
        )
        .unwrap();

    assert!(agent.process(step(1)).unwrap().into_execution().is_some());
    let dropped = agent.process(step(2)).unwrap();
    assert!(dropped.outcomes()[0].outcome.is_skipped());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    advance(1.5).await;
    assert!(agent.process(step(3)).unwrap().into_execution().is_some());
    advance(1.5).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(payloads(&recorder, "done"), vec![json!(1), json!(3)]);
}

#[tokio::test(start_paused = true)]
async fn toggle_alternates_between_start_and_stop() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let handler = agent
        .on("step", ticker, HandlerOptions::toggle().with_retag("tick"))
        .unwrap();

    let on = agent.process(step(1)).unwrap().into_execution().unwrap();
    advance(1.5).await;

    let off = agent.process(step(1)).unwrap();
    assert!(off.outcomes()[0].outcome.is_skipped());
    assert!(matches!(
        on.completion().await.unwrap(),
        ExecutionOutcome::Cancelled { emitted: 1 }
    ));

    advance(2.0).await;
    assert_eq!(recorder.count_of("tick"), 1);
    assert_eq!(agent.live_executions(&handler), 0);

    assert!(agent.process(step(3)).unwrap().into_execution().is_some());
    advance(1.5).await;
    assert_eq!(payloads(&recorder, "tick"), vec![json!(1), json!(3)]);
}

// ---------------------------------------------------------------------------
// Teardown and faults
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unregister_mid_flight_stops_emissions() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let handler = agent
        .on("step", ticker, HandlerOptions::cutoff().with_retag("tick"))
        .unwrap();

    let execution = agent.process(step(1)).unwrap().into_execution().unwrap();
    advance(1.5).await;
    assert!(handler.unregister());

    assert!(execution.is_cancelled());
    assert!(matches!(
        execution.completion().await.unwrap(),
        ExecutionOutcome::Cancelled { emitted: 1 }
    ));

    advance(5.0).await;
    assert_eq!(recorder.count_of("tick"), 1);
    assert_eq!(agent.live_executions(&handler), 0);
}

#[tokio::test(start_paused = true)]
async fn stream_error_faults_the_execution() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let handler = agent
        .on(
            "load",
            |_| {
                Ok(HandlerOutput::stream(stream::iter(vec![
                    Ok(json!(1)),
                    Err(anyhow::anyhow!("upstream closed")),
                    Ok(json!(2)),
                ])))
            },
            HandlerOptions::new().with_retag("row"),
        )
        .unwrap();

    let execution = agent.process(Action::new("load")).unwrap().into_execution().unwrap();
    let err = execution.completion().await.unwrap_err();

    match &err {
        AgentError::ExecutionFault { handler: id, .. } => assert_eq!(*id, handler.id()),
        other => panic!("expected fault, got {other:?}"),
    }
    assert!(err.to_string().contains("upstream closed"), "{err}");
    assert_eq!(payloads(&recorder, "row"), vec![json!(1)]);
    assert_eq!(agent.live_executions(&handler), 0);
}

#[tokio::test(start_paused = true)]
async fn untagged_non_action_items_fault() {
    let agent = Agent::new();
    agent
        .on(
            "load",
            |_| Ok(HandlerOutput::values(stream::iter(vec![json!(7)]))),
            HandlerOptions::new(),
        )
        .unwrap();

    let execution = agent.process(Action::new("load")).unwrap().into_execution().unwrap();
    let err = execution.completion().await.unwrap_err();
    assert!(matches!(err, AgentError::ExecutionFault { .. }), "{err}");
}

#[tokio::test(start_paused = true)]
async fn failing_downstream_filter_faults_the_emitter() {
    let agent = Agent::new();
    agent
        .filter("tick", |_| anyhow::bail!("reducer overflow"))
        .unwrap();
    agent
        .on("step", ticker, HandlerOptions::cutoff().with_retag("tick"))
        .unwrap();

    let execution = agent.process(step(1)).unwrap().into_execution().unwrap();
    let err = execution.completion().await.unwrap_err();

    assert!(err.to_string().contains("reducer overflow"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn panicking_stream_faults_and_releases_the_lane() {
    let agent = Agent::new();
    let mut events = agent.events();
    let handler = agent
        .on(
            "load",
            |_| {
                let rows = stream::iter(vec![json!(1)])
                    .map(|_: Value| -> Value { panic!("row decoder blew up") });
                Ok(HandlerOutput::values(rows))
            },
            HandlerOptions::ignore().with_retag("row"),
        )
        .unwrap();

    let execution = agent.process(Action::new("load")).unwrap().into_execution().unwrap();
    let err = execution.completion().await.unwrap_err();

    assert!(matches!(err, AgentError::ExecutionFault { .. }), "{err}");
    assert!(err.to_string().contains("row decoder blew up"), "{err}");
    assert_eq!(agent.live_executions(&handler), 0);

    let mut faulted = false;
    while let Ok(event) = events.try_recv() {
        faulted |= matches!(event, AgentEvent::ExecutionFaulted { .. });
    }
    assert!(faulted);

    // The ignore lane is free again.
    assert!(agent.process(Action::new("load")).unwrap().into_execution().is_some());
}

#[tokio::test(start_paused = true)]
async fn serial_queue_moves_on_after_a_panic() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    agent
        .on(
            "step",
            |ctx: HandlerContext| {
                let step = ctx.action().get("step").cloned().unwrap_or(Value::Null);
                Ok(HandlerOutput::deferred(async move {
                    tokio::time::sleep(PERIOD).await;
                    if step == json!(1) {
                        panic!("first step exploded");
                    }
                    Ok::<_, anyhow::Error>(step)
                }))
            },
            HandlerOptions::serial().with_retag("done"),
        )
        .unwrap();

    let first = agent.process(step(1)).unwrap().into_execution().unwrap();
    let second = agent.process(step(2)).unwrap().into_execution().unwrap();

    assert!(first.completion().await.is_err());
    assert!(!second.completion().await.unwrap().is_cancelled());
    assert_eq!(payloads(&recorder, "done"), vec![json!(2)]);
}
