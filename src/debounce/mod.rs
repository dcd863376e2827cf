// src/debounce/mod.rs

//! Debounce / coalescing queue.
//!
//! Aggregates bursts of matched events into a single trigger per rule.
//! Receiving an event for a rule with no open window opens one and arms its
//! timer; further events append and re-arm it (sliding window), clamped by
//! the rule's optional maximum aggregation duration measured from the
//! window's first event, so continuous churn still flushes.
//!
//! The queue itself is pure and synchronous: `observe` returns the timer the
//! caller must arm, and a timer wake-up calls `close` with the arm id it was
//! armed with. Re-arming bumps the id, so stale wake-ups fall through
//! harmlessly. The async shell in `engine::runtime` owns the actual sleeps.
//!
//! Windows are keyed by rule, which is also the concurrency key unless a
//! rule overrides it; rules sharing a key aggregate separately and are
//! serialized against each other at the execution stage instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::diff::ChangeEvent;
use crate::rules::{MatchedEvent, WatchRule};
use crate::types::{ConcurrencyKey, RuleName};

/// The unit of work handed to the execution supervisor: one or more
/// aggregated changes for one rule.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub rule: Arc<WatchRule>,
    pub key: ConcurrencyKey,
    pub events: Vec<ChangeEvent>,
    pub first_seen: SystemTime,
    pub flushed_at: SystemTime,
}

/// Timer the caller must arm after an `observe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowTimer {
    pub rule: RuleName,
    pub arm: u64,
    pub delay: Duration,
}

#[derive(Debug)]
struct Window {
    rule: Arc<WatchRule>,
    events: Vec<ChangeEvent>,
    opened_mono: Instant,
    opened_wall: SystemTime,
    /// Id of the most recent arm; wake-ups carrying an older id are stale.
    arm: u64,
}

#[derive(Debug, Default)]
pub struct DebounceQueue {
    windows: HashMap<RuleName, Window>,
    arm_counter: u64,
}

impl DebounceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a matched event and return the timer to arm for its window.
    pub fn observe(
        &mut self,
        matched: MatchedEvent,
        now: Instant,
        now_wall: SystemTime,
    ) -> WindowTimer {
        let MatchedEvent { rule, event } = matched;
        let name = rule.name.clone();

        self.arm_counter += 1;
        let arm = self.arm_counter;

        let window = self.windows.entry(name.clone()).or_insert_with(|| Window {
            rule: Arc::clone(&rule),
            events: Vec::new(),
            opened_mono: now,
            opened_wall: now_wall,
            arm,
        });
        window.events.push(event);
        window.arm = arm;

        let mut delay = window.rule.debounce;
        if let Some(max_aggregation) = window.rule.max_aggregation {
            let hard_deadline = window.opened_mono + max_aggregation;
            delay = delay.min(hard_deadline.saturating_duration_since(now));
        }

        debug!(
            rule = %name,
            events = window.events.len(),
            delay = ?delay,
            "debounce window (re)armed"
        );

        WindowTimer { rule: name, arm, delay }
    }

    /// Handle a timer wake-up. Returns the flushed trigger when the wake-up
    /// matches the window's latest arm; stale wake-ups return `None`.
    pub fn close(&mut self, rule: &str, arm: u64, now_wall: SystemTime) -> Option<Trigger> {
        match self.windows.get(rule) {
            Some(window) if window.arm == arm => {}
            _ => return None,
        }

        let window = self.windows.remove(rule)?;
        debug!(rule = %rule, events = window.events.len(), "debounce window flushed");

        Some(Trigger {
            key: window.rule.concurrency_key.clone(),
            rule: window.rule,
            events: window.events,
            first_seen: window.opened_wall,
            flushed_at: now_wall,
        })
    }

    /// Flush every open window immediately (shutdown and `--once`), so no
    /// observed event is dropped on the floor.
    pub fn drain(&mut self, now_wall: SystemTime) -> Vec<Trigger> {
        let mut names: Vec<RuleName> = self.windows.keys().cloned().collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| {
                let arm = self.windows.get(&name).map(|w| w.arm)?;
                self.close(&name, arm, now_wall)
            })
            .collect()
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeKind;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use crate::rules::{AutomationTarget, RetryPolicy};
    use crate::types::SearchScope;

    fn rule(name: &str, debounce_secs: u64, max_aggregation: Option<u64>) -> Arc<WatchRule> {
        Arc::new(WatchRule {
            name: name.to_string(),
            base: "ou=groups,dc=example,dc=org".to_string(),
            scope: SearchScope::Sub,
            filter: "(objectClass=*)".to_string(),
            watched: BTreeSet::from(["memberuid".to_string()]),
            target: AutomationTarget {
                playbook: PathBuf::from("play.yml"),
                inventory: None,
                extra_vars: None,
                vault_file: None,
            },
            debounce: Duration::from_secs(debounce_secs),
            max_aggregation: max_aggregation.map(Duration::from_secs),
            concurrency_key: name.to_string(),
            retry: RetryPolicy {
                max_retries: 0,
                backoff_base: Duration::from_secs(1),
                backoff_cap: Duration::from_secs(60),
            },
            timeout: Duration::from_secs(60),
            scope_key: "scope".to_string(),
        })
    }

    fn event(dn: &str) -> ChangeEvent {
        ChangeEvent {
            dn: dn.to_string(),
            entry_uuid: None,
            kind: ChangeKind::Modified,
            changes: Vec::new(),
            detected_at: SystemTime::UNIX_EPOCH,
        }
    }

    fn matched(rule: &Arc<WatchRule>, dn: &str) -> MatchedEvent {
        MatchedEvent {
            rule: Arc::clone(rule),
            event: event(dn),
        }
    }

    fn wall() -> SystemTime {
        SystemTime::UNIX_EPOCH
    }

    #[test]
    fn burst_within_window_flushes_as_one_trigger_with_all_events() {
        let mut queue = DebounceQueue::new();
        let r = rule("groups", 5, None);
        let t0 = Instant::now();

        let timer1 = queue.observe(matched(&r, "cn=a"), t0, wall());
        assert_eq!(timer1.delay, Duration::from_secs(5));

        let timer2 = queue.observe(matched(&r, "cn=b"), t0 + Duration::from_secs(2), wall());
        let timer3 = queue.observe(matched(&r, "cn=c"), t0 + Duration::from_secs(4), wall());

        // Older arms are stale once the window was re-armed.
        assert!(queue.close("groups", timer1.arm, wall()).is_none());
        assert!(queue.close("groups", timer2.arm, wall()).is_none());

        let trigger = queue
            .close("groups", timer3.arm, wall())
            .expect("latest arm flushes");
        assert_eq!(trigger.events.len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn max_aggregation_caps_the_sliding_window() {
        let mut queue = DebounceQueue::new();
        let r = rule("groups", 5, Some(8));
        let t0 = Instant::now();

        queue.observe(matched(&r, "cn=a"), t0, wall());
        // 6s in: a plain re-arm would push the deadline to 11s, but the hard
        // deadline is at 8s, so only 2s remain.
        let timer = queue.observe(matched(&r, "cn=b"), t0 + Duration::from_secs(6), wall());
        assert_eq!(timer.delay, Duration::from_secs(2));

        // Past the hard deadline the delay collapses to zero.
        let timer = queue.observe(matched(&r, "cn=c"), t0 + Duration::from_secs(9), wall());
        assert_eq!(timer.delay, Duration::ZERO);
    }

    #[test]
    fn windows_for_different_rules_are_independent() {
        let mut queue = DebounceQueue::new();
        let a = rule("a", 5, None);
        let b = rule("b", 5, None);
        let t0 = Instant::now();

        let timer_a = queue.observe(matched(&a, "cn=x"), t0, wall());
        let timer_b = queue.observe(matched(&b, "cn=y"), t0, wall());

        let trigger_a = queue.close("a", timer_a.arm, wall()).expect("a flushes");
        assert_eq!(trigger_a.rule.name, "a");
        assert_eq!(queue.open_windows(), 1);

        let trigger_b = queue.close("b", timer_b.arm, wall()).expect("b flushes");
        assert_eq!(trigger_b.rule.name, "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn close_after_flush_is_a_no_op() {
        let mut queue = DebounceQueue::new();
        let r = rule("groups", 5, None);
        let timer = queue.observe(matched(&r, "cn=a"), Instant::now(), wall());

        assert!(queue.close("groups", timer.arm, wall()).is_some());
        assert!(queue.close("groups", timer.arm, wall()).is_none());
    }

    #[test]
    fn drain_flushes_every_open_window() {
        let mut queue = DebounceQueue::new();
        let t0 = Instant::now();
        queue.observe(matched(&rule("a", 5, None), "cn=x"), t0, wall());
        queue.observe(matched(&rule("b", 5, None), "cn=y"), t0, wall());
        queue.observe(matched(&rule("b", 5, None), "cn=z"), t0, wall());

        let triggers = queue.drain(wall());
        assert_eq!(triggers.len(), 2);
        assert!(queue.is_empty());

        let b = triggers.iter().find(|t| t.rule.name == "b").expect("b");
        assert_eq!(b.events.len(), 2);
    }

    #[test]
    fn a_new_window_after_flush_gets_fresh_arms() {
        let mut queue = DebounceQueue::new();
        let r = rule("groups", 5, None);
        let t0 = Instant::now();

        let first = queue.observe(matched(&r, "cn=a"), t0, wall());
        queue.close("groups", first.arm, wall()).expect("flush");

        let second = queue.observe(matched(&r, "cn=b"), t0 + Duration::from_secs(10), wall());
        assert_ne!(first.arm, second.arm);

        // The stale arm from the first window must not flush the new one.
        assert!(queue.close("groups", first.arm, wall()).is_none());
        let trigger = queue.close("groups", second.arm, wall()).expect("flush");
        assert_eq!(trigger.events.len(), 1);
    }
}
