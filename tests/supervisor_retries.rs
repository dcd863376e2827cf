//! Supervisor behaviour: retry policy, per-key serialization, global limit.
//!
//! All tests run under a paused Tokio clock, so backoff delays and attempt
//! durations elapse instantly and deterministically.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use ldapwatchd::exec::{spawn_supervisor, AttemptOutcome, ExecOutcome, ExecStatus};
use ldapwatchd::state::StateStore;
use tokio::sync::watch;

use ldapwatchd_test_utils::builders::{trigger_for, WatchRuleBuilder};
use ldapwatchd_test_utils::fake_runner::ScriptedRunner;
use ldapwatchd_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn harness(
    runner: &ScriptedRunner,
    limit: usize,
) -> (
    Arc<StateStore>,
    tokio::sync::mpsc::Sender<ldapwatchd::debounce::Trigger>,
    tokio::task::JoinHandle<()>,
    watch::Sender<bool>,
) {
    let store = Arc::new(StateStore::open_in_memory().expect("store"));
    let (force_tx, force_rx) = watch::channel(false);
    let (trigger_tx, handle) =
        spawn_supervisor(Arc::new(runner.clone()), Arc::clone(&store), limit, force_rx);
    (store, trigger_tx, handle, force_tx)
}

#[tokio::test(start_paused = true)]
async fn deterministic_failure_is_retried_then_abandoned() -> TestResult {
    init_tracing();

    let runner = ScriptedRunner::new();
    for _ in 0..3 {
        runner.push_outcome("groups", AttemptOutcome::Failed(1));
    }

    let rule = WatchRuleBuilder::new("groups").retries(2, 1).build();
    let (store, trigger_tx, handle, _force) = harness(&runner, 4);

    trigger_tx.send(trigger_for(&rule, "cn=staff")).await?;
    drop(trigger_tx);
    with_timeout(handle).await?;

    // 1 initial + 2 retries, then the trigger is given up on.
    assert_eq!(runner.attempts_for("groups"), vec![1, 2, 3]);

    let history = store.executions("groups")?;
    let statuses: Vec<ExecStatus> = history.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            ExecStatus::Pending,
            ExecStatus::Running,
            ExecStatus::Retrying,
            ExecStatus::Running,
            ExecStatus::Retrying,
            ExecStatus::Running,
            ExecStatus::Abandoned,
        ]
    );

    let last = history.last().expect("records");
    assert_eq!(last.attempt, 3);
    assert_eq!(last.outcome, Some(ExecOutcome::Failed));
    assert_eq!(last.exit_code, Some(1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn success_on_second_attempt_stops_retrying() -> TestResult {
    init_tracing();

    let runner = ScriptedRunner::new();
    runner.push_outcome("groups", AttemptOutcome::Failed(2));

    let rule = WatchRuleBuilder::new("groups").retries(5, 1).build();
    let (store, trigger_tx, handle, _force) = harness(&runner, 4);

    trigger_tx.send(trigger_for(&rule, "cn=staff")).await?;
    drop(trigger_tx);
    with_timeout(handle).await?;

    assert_eq!(runner.attempts_for("groups"), vec![1, 2]);

    let last = store.last_execution("groups")?.expect("record");
    assert_eq!(last.status, ExecStatus::Succeeded);
    assert_eq!(last.attempt, 2);
    assert_eq!(last.exit_code, Some(0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_as_a_failure_for_retry_purposes() -> TestResult {
    init_tracing();

    let runner = ScriptedRunner::new();
    runner.push_outcome("groups", AttemptOutcome::TimedOut);

    let rule = WatchRuleBuilder::new("groups").retries(1, 1).build();
    let (store, trigger_tx, handle, _force) = harness(&runner, 4);

    trigger_tx.send(trigger_for(&rule, "cn=staff")).await?;
    drop(trigger_tx);
    with_timeout(handle).await?;

    let history = store.executions("groups")?;
    let timed_out = history
        .iter()
        .find(|r| r.outcome == Some(ExecOutcome::TimedOut))
        .expect("timed-out record");
    assert_eq!(timed_out.status, ExecStatus::Retrying);
    assert_eq!(timed_out.exit_code, None);

    let last = store.last_execution("groups")?.expect("record");
    assert_eq!(last.status, ExecStatus::Succeeded);
    assert_eq!(last.attempt, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn triggers_for_one_key_are_serialized_fifo() -> TestResult {
    init_tracing();

    let runner = ScriptedRunner::new();
    runner.set_attempt_duration(Duration::from_millis(100));

    // Two rules sharing a concurrency key: they must never overlap.
    let first = WatchRuleBuilder::new("first").concurrency_key("shared").build();
    let second = WatchRuleBuilder::new("second").concurrency_key("shared").build();

    let (_store, trigger_tx, handle, _force) = harness(&runner, 8);

    trigger_tx.send(trigger_for(&first, "cn=a")).await?;
    trigger_tx.send(trigger_for(&second, "cn=b")).await?;
    drop(trigger_tx);
    with_timeout(handle).await?;

    assert!(!runner.overlap_detected());
    assert_eq!(runner.max_active(), 1);

    let order: Vec<String> = runner.attempts().into_iter().map(|(r, _)| r).collect();
    assert_eq!(order, vec!["first", "second"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn global_limit_bounds_concurrent_executions() -> TestResult {
    init_tracing();

    let runner = ScriptedRunner::new();
    runner.set_attempt_duration(Duration::from_millis(100));

    let (_store, trigger_tx, handle, _force) = harness(&runner, 2);

    for name in ["a", "b", "c", "d", "e"] {
        let rule = WatchRuleBuilder::new(name).build();
        trigger_tx.send(trigger_for(&rule, "cn=x")).await?;
    }
    drop(trigger_tx);
    with_timeout(handle).await?;

    assert_eq!(runner.attempts().len(), 5);
    assert!(runner.max_active() <= 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn independent_keys_do_run_concurrently() -> TestResult {
    init_tracing();

    let runner = ScriptedRunner::new();
    runner.set_attempt_duration(Duration::from_millis(100));

    let (_store, trigger_tx, handle, _force) = harness(&runner, 4);

    for name in ["a", "b", "c"] {
        let rule = WatchRuleBuilder::new(name).build();
        trigger_tx.send(trigger_for(&rule, "cn=x")).await?;
    }
    drop(trigger_tx);
    with_timeout(handle).await?;

    assert!(runner.max_active() > 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn force_stop_abandons_inflight_executions() -> TestResult {
    init_tracing();

    let runner = ScriptedRunner::new();
    runner.set_attempt_duration(Duration::from_secs(3600));

    let rule = WatchRuleBuilder::new("groups").build();
    let (store, trigger_tx, handle, force) = harness(&runner, 4);

    trigger_tx.send(trigger_for(&rule, "cn=staff")).await?;
    drop(trigger_tx);

    // Let the attempt start, then pull the plug.
    tokio::task::yield_now().await;
    force.send(true)?;
    with_timeout(handle).await?;

    let last = store.last_execution("groups")?.expect("record");
    assert_eq!(last.status, ExecStatus::Abandoned);
    Ok(())
}
