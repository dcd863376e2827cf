//! A scripted runner backend that never forks.
//!
//! Tests queue per-rule outcomes (defaulting to success once the script is
//! exhausted) and can add an artificial attempt duration to provoke
//! overlapping executions. The backend records every attempt and tracks the
//! peak number of concurrently running attempts, globally and per rule.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ldapwatchd::errors::Result;
use ldapwatchd::exec::{AttemptOutcome, RunnerBackend};
use ldapwatchd::rules::WatchRule;

#[derive(Default)]
struct Inner {
    outcomes: Mutex<HashMap<String, VecDeque<AttemptOutcome>>>,
    delay: Mutex<Duration>,
    log: Mutex<Vec<(String, u32)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    active_rules: Mutex<HashSet<String>>,
    overlap: AtomicBool,
}

#[derive(Clone, Default)]
pub struct ScriptedRunner {
    inner: Arc<Inner>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for a rule's next attempt. Unqueued attempts
    /// succeed.
    pub fn push_outcome(&self, rule: &str, outcome: AttemptOutcome) {
        self.inner
            .outcomes
            .lock()
            .expect("outcomes mutex")
            .entry(rule.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Make every attempt take this long (virtual time under a paused
    /// clock).
    pub fn set_attempt_duration(&self, delay: Duration) {
        *self.inner.delay.lock().expect("delay mutex") = delay;
    }

    /// Every recorded attempt, in start order, as (rule, attempt).
    pub fn attempts(&self) -> Vec<(String, u32)> {
        self.inner.log.lock().expect("log mutex").clone()
    }

    pub fn attempts_for(&self, rule: &str) -> Vec<u32> {
        self.attempts()
            .into_iter()
            .filter(|(r, _)| r == rule)
            .map(|(_, attempt)| attempt)
            .collect()
    }

    /// Peak number of concurrently running attempts.
    pub fn max_active(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// True if two attempts for the same rule ever overlapped.
    pub fn overlap_detected(&self) -> bool {
        self.inner.overlap.load(Ordering::SeqCst)
    }
}

impl RunnerBackend for ScriptedRunner {
    fn run_attempt(
        &self,
        rule: Arc<WatchRule>,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = Result<AttemptOutcome>> + Send + 'static>> {
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            let now_active = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
            inner.max_active.fetch_max(now_active, Ordering::SeqCst);

            {
                let mut running = inner.active_rules.lock().expect("active mutex");
                if !running.insert(rule.name.clone()) {
                    inner.overlap.store(true, Ordering::SeqCst);
                }
            }
            inner
                .log
                .lock()
                .expect("log mutex")
                .push((rule.name.clone(), attempt));

            let delay = *inner.delay.lock().expect("delay mutex");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            inner
                .active_rules
                .lock()
                .expect("active mutex")
                .remove(&rule.name);
            inner.active.fetch_sub(1, Ordering::SeqCst);

            let outcome = inner
                .outcomes
                .lock()
                .expect("outcomes mutex")
                .get_mut(&rule.name)
                .and_then(VecDeque::pop_front)
                .unwrap_or(AttemptOutcome::Succeeded);

            Ok(outcome)
        })
    }
}
