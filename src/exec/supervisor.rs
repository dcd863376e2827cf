// src/exec/supervisor.rs

//! Execution supervisor loop.
//!
//! Consumes triggers from the debounce queue, admits them through the pure
//! [`Admission`] state, and spawns one worker task per admitted trigger.
//! The worker owns the whole retry sequence for its trigger: run an attempt,
//! classify, back off, re-run, up to the rule's attempt budget. Every state
//! transition is appended to the execution log.
//!
//! The loop exits once the trigger channel is closed and nothing is running
//! or queued; a force-stop signal makes in-flight workers kill their child
//! process and record the execution as abandoned.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::debounce::Trigger;
use crate::state::StateStore;

use super::admission::Admission;
use super::backend::{AttemptOutcome, RunnerBackend};
use super::{ExecOutcome, ExecStatus, ExecutionRecord};

/// Worker completion notice back to the supervisor loop.
struct WorkerDone {
    key: String,
}

/// Spawn the supervisor loop.
///
/// The returned sender is the trigger intake; dropping it starts the drain.
/// The join handle resolves once every admitted execution reached a terminal
/// state (or was force-stopped).
pub fn spawn_supervisor(
    backend: Arc<dyn RunnerBackend>,
    store: Arc<StateStore>,
    limit: usize,
    force_stop: watch::Receiver<bool>,
) -> (mpsc::Sender<Trigger>, JoinHandle<()>) {
    let (trigger_tx, trigger_rx) = mpsc::channel::<Trigger>(32);

    let handle = tokio::spawn(supervisor_loop(
        backend,
        store,
        limit,
        trigger_rx,
        force_stop,
    ));

    (trigger_tx, handle)
}

async fn supervisor_loop(
    backend: Arc<dyn RunnerBackend>,
    store: Arc<StateStore>,
    limit: usize,
    mut trigger_rx: mpsc::Receiver<Trigger>,
    force_stop: watch::Receiver<bool>,
) {
    info!(limit, "execution supervisor started");

    let mut admission = Admission::new(limit);
    let (done_tx, mut done_rx) = mpsc::channel::<WorkerDone>(32);
    let mut accepting = true;

    loop {
        if !accepting && admission.is_idle() {
            break;
        }

        tokio::select! {
            maybe_trigger = trigger_rx.recv(), if accepting => {
                match maybe_trigger {
                    Some(trigger) => {
                        debug!(
                            rule = %trigger.rule.name,
                            key = %trigger.key,
                            events = trigger.events.len(),
                            "trigger received"
                        );
                        record_pending(&store, &trigger);
                        for startable in admission.submit(trigger) {
                            dispatch(&backend, &store, startable, &done_tx, &force_stop);
                        }
                    }
                    None => {
                        debug!(
                            running = admission.running_count(),
                            queued = admission.queued_count(),
                            "trigger intake closed; draining"
                        );
                        accepting = false;
                    }
                }
            }

            Some(done) = done_rx.recv() => {
                for startable in admission.complete(&done.key) {
                    dispatch(&backend, &store, startable, &done_tx, &force_stop);
                }
            }
        }
    }

    info!("execution supervisor finished");
}

fn record_pending(store: &StateStore, trigger: &Trigger) {
    match store.last_execution(&trigger.rule.name) {
        Ok(Some(last)) => debug!(
            rule = %trigger.rule.name,
            last_status = last.status.as_str(),
            "previous execution on record"
        ),
        Ok(None) => {}
        Err(e) => warn!(rule = %trigger.rule.name, error = %e, "failed to read last execution"),
    }

    append(
        store,
        ExecutionRecord {
            rule: trigger.rule.name.clone(),
            attempt: 1,
            started_at: None,
            finished_at: None,
            exit_code: None,
            outcome: None,
            status: ExecStatus::Pending,
        },
    );
}

fn dispatch(
    backend: &Arc<dyn RunnerBackend>,
    store: &Arc<StateStore>,
    trigger: Trigger,
    done_tx: &mpsc::Sender<WorkerDone>,
    force_stop: &watch::Receiver<bool>,
) {
    let backend = Arc::clone(backend);
    let store = Arc::clone(store);
    let done_tx = done_tx.clone();
    let force_stop = force_stop.clone();

    tokio::spawn(async move {
        let key = trigger.key.clone();
        run_trigger(backend, store, trigger, force_stop).await;
        let _ = done_tx.send(WorkerDone { key }).await;
    });
}

/// The whole retry sequence for one trigger, as plain control flow.
async fn run_trigger(
    backend: Arc<dyn RunnerBackend>,
    store: Arc<StateStore>,
    trigger: Trigger,
    mut force_stop: watch::Receiver<bool>,
) {
    let rule = Arc::clone(&trigger.rule);
    let max_attempts = rule.retry.max_retries.saturating_add(1);

    for attempt in 1..=max_attempts {
        let started_at = SystemTime::now();
        append(
            &store,
            ExecutionRecord {
                rule: rule.name.clone(),
                attempt,
                started_at: Some(started_at),
                finished_at: None,
                exit_code: None,
                outcome: None,
                status: ExecStatus::Running,
            },
        );

        let outcome = tokio::select! {
            res = backend.run_attempt(Arc::clone(&rule), attempt) => match res {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(rule = %rule.name, attempt, error = %e, "attempt failed to run");
                    AttemptOutcome::Failed(-1)
                }
            },
            _ = stopped(&mut force_stop) => {
                warn!(rule = %rule.name, attempt, "force stop; abandoning execution");
                append(&store, abandoned_record(&rule.name, attempt, started_at));
                return;
            }
        };
        let finished_at = SystemTime::now();

        let (exec_outcome, exit_code) = match outcome {
            AttemptOutcome::Succeeded => (ExecOutcome::Succeeded, Some(0)),
            AttemptOutcome::Failed(code) => (ExecOutcome::Failed, Some(code)),
            AttemptOutcome::TimedOut => (ExecOutcome::TimedOut, None),
        };

        if outcome.is_success() {
            append(
                &store,
                ExecutionRecord {
                    rule: rule.name.clone(),
                    attempt,
                    started_at: Some(started_at),
                    finished_at: Some(finished_at),
                    exit_code,
                    outcome: Some(exec_outcome),
                    status: ExecStatus::Succeeded,
                },
            );
            info!(rule = %rule.name, attempt, "execution succeeded");
            return;
        }

        if attempt < max_attempts {
            let delay = rule.retry.delay_after(attempt);
            append(
                &store,
                ExecutionRecord {
                    rule: rule.name.clone(),
                    attempt,
                    started_at: Some(started_at),
                    finished_at: Some(finished_at),
                    exit_code,
                    outcome: Some(exec_outcome),
                    status: ExecStatus::Retrying,
                },
            );
            warn!(
                rule = %rule.name,
                attempt,
                outcome = exec_outcome.as_str(),
                retry_in = ?delay,
                "execution failed; retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut force_stop) => {
                    warn!(rule = %rule.name, "force stop during backoff; abandoning execution");
                    return;
                }
            }
        } else {
            append(
                &store,
                ExecutionRecord {
                    rule: rule.name.clone(),
                    attempt,
                    started_at: Some(started_at),
                    finished_at: Some(finished_at),
                    exit_code,
                    outcome: Some(exec_outcome),
                    status: ExecStatus::Abandoned,
                },
            );
            warn!(
                rule = %rule.name,
                attempts = max_attempts,
                outcome = exec_outcome.as_str(),
                "retry budget exhausted; execution abandoned"
            );
        }
    }
}

fn abandoned_record(rule: &str, attempt: u32, started_at: SystemTime) -> ExecutionRecord {
    ExecutionRecord {
        rule: rule.to_string(),
        attempt,
        started_at: Some(started_at),
        finished_at: Some(SystemTime::now()),
        exit_code: None,
        outcome: Some(ExecOutcome::Failed),
        status: ExecStatus::Abandoned,
    }
}

/// Resolve when the force-stop flag flips to true; never resolves otherwise.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without a stop; keep workers running to completion.
            std::future::pending::<()>().await;
        }
    }
}

fn append(store: &StateStore, record: ExecutionRecord) {
    if let Err(e) = store.append_execution(&record) {
        // The execution itself proceeds; a store failure must never take
        // down a worker.
        error!(
            rule = %record.rule,
            status = record.status.as_str(),
            error = %e,
            "failed to append execution record"
        );
    }
}
