//! End-to-end counter behaviour on virtual time.

use std::time::Duration;

use actionflow_counter::{Counter, CounterOptions, CounterState};
use actionflow_engine::{ActionRecorder, Agent, HandlerKind};

const PERIOD: Duration = Duration::from_millis(1000);

async fn advance(periods: f64) {
    tokio::time::sleep(PERIOD.mul_f64(periods)).await;
}

fn mount(agent: &Agent, step: i64) -> Counter {
    Counter::mount(
        agent,
        CounterOptions {
            period: PERIOD,
            initial: CounterState { count: 0, step },
        },
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Ticking
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn counts_by_step_until_stopped() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let counter = mount(&agent, 1);

    advance(3.5).await;
    assert_eq!(counter.state(), CounterState { count: 3, step: 1 });

    counter.stop().unwrap();
    advance(3.0).await;

    assert_eq!(counter.state().count, 3);
    assert_eq!(recorder.types(), vec!["step", "tick", "tick", "tick", "stop"]);
}

#[tokio::test(start_paused = true)]
async fn changing_step_restarts_the_ticker() {
    let agent = Agent::new();
    let counter = mount(&agent, 1);

    advance(3.5).await;
    counter.set_step(5).unwrap();
    advance(2.5).await;

    // Ticks at 4.5s and 5.5s from the restarted ticker only.
    assert_eq!(counter.state(), CounterState { count: 13, step: 5 });
}

#[tokio::test(start_paused = true)]
async fn rapid_step_changes_leave_one_ticker() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let counter = mount(&agent, 2);
    counter.set_step(5).unwrap();

    advance(3.5).await;

    assert_eq!(recorder.count_of("tick"), 3);
    assert_eq!(counter.state().count, 15);
}

#[tokio::test(start_paused = true)]
async fn negative_steps_count_down() {
    let agent = Agent::new();
    let counter = mount(&agent, -2);

    advance(2.5).await;
    assert_eq!(counter.state().count, -4);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unmount_disposes_handlers_and_ticker() {
    let agent = Agent::new();
    let recorder = ActionRecorder::attach(&agent);
    let counter = mount(&agent, 1);

    advance(1.5).await;
    let state = counter.unmount();
    assert_eq!(state.count, 1);

    advance(5.0).await;
    assert_eq!(recorder.count_of("tick"), 1);
    assert_eq!(agent.handler_count(HandlerKind::Filter), 0);
    assert_eq!(agent.handler_count(HandlerKind::On), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_step_is_rejected_by_the_reducer() {
    let agent = Agent::new();
    let counter = mount(&agent, 1);

    let err = counter
        .scope()
        .process(actionflow_engine::Action::new("step").with("step", "fast"))
        .unwrap_err();
    assert!(err.to_string().contains("integer"), "{err}");

    // The running ticker is untouched.
    advance(2.5).await;
    assert_eq!(counter.state().count, 2);
}
