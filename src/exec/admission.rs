// src/exec/admission.rs

//! Pure admission control for the execution supervisor.
//!
//! Two constraints govern when a trigger may start:
//! - per-key mutual exclusion: at most one execution per concurrency key is
//!   running at any time; later triggers for a busy key queue FIFO behind it;
//! - a global concurrency limit: triggers whose key is free but for which no
//!   slot is available queue FIFO in arrival order.
//!
//! No channels, no Tokio, no clocks; the supervisor's async shell feeds
//! `submit`/`complete` and dispatches whatever comes back.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::debounce::Trigger;
use crate::types::ConcurrencyKey;

#[derive(Debug, Default)]
pub struct Admission {
    limit: usize,
    running: HashSet<ConcurrencyKey>,
    /// Triggers whose key is free, waiting for a global slot. Holds at most
    /// one entry per key; same-key followers wait in `key_queues`.
    ready: VecDeque<Trigger>,
    /// Triggers queued behind a busy (running or already-ready) key.
    key_queues: HashMap<ConcurrencyKey, VecDeque<Trigger>>,
}

impl Admission {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            ..Default::default()
        }
    }

    /// Accept a trigger; returns the triggers that may start right now.
    pub fn submit(&mut self, trigger: Trigger) -> Vec<Trigger> {
        let key = trigger.key.clone();
        let key_busy = self.running.contains(&key)
            || self.key_queues.contains_key(&key)
            || self.ready.iter().any(|t| t.key == key);

        if key_busy {
            self.key_queues.entry(key).or_default().push_back(trigger);
        } else {
            self.ready.push_back(trigger);
        }

        self.pump()
    }

    /// Mark a key's execution as finished; returns newly startable triggers.
    pub fn complete(&mut self, key: &str) -> Vec<Trigger> {
        self.running.remove(key);

        if let Some(queue) = self.key_queues.get_mut(key) {
            if let Some(next) = queue.pop_front() {
                self.ready.push_back(next);
            }
            if queue.is_empty() {
                self.key_queues.remove(key);
            }
        }

        self.pump()
    }

    /// Start everything the limit allows. Entries in `ready` never have a
    /// running key (same-key triggers are parked in `key_queues`), so
    /// dispatch is a plain front-to-back pop.
    fn pump(&mut self) -> Vec<Trigger> {
        let mut startable = Vec::new();
        while self.running.len() < self.limit {
            let Some(trigger) = self.ready.pop_front() else {
                break;
            };
            self.running.insert(trigger.key.clone());
            startable.push(trigger);
        }
        startable
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.ready.len() + self.key_queues.values().map(VecDeque::len).sum::<usize>()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.queued_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{AutomationTarget, RetryPolicy, WatchRule};
    use crate::types::SearchScope;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    fn trigger(rule_name: &str, key: &str) -> Trigger {
        let rule = Arc::new(WatchRule {
            name: rule_name.to_string(),
            base: "dc=example,dc=org".to_string(),
            scope: SearchScope::Sub,
            filter: "(objectClass=*)".to_string(),
            watched: BTreeSet::new(),
            target: AutomationTarget {
                playbook: PathBuf::from("play.yml"),
                inventory: None,
                extra_vars: None,
                vault_file: None,
            },
            debounce: Duration::from_secs(1),
            max_aggregation: None,
            concurrency_key: key.to_string(),
            retry: RetryPolicy {
                max_retries: 0,
                backoff_base: Duration::from_secs(1),
                backoff_cap: Duration::from_secs(1),
            },
            timeout: Duration::from_secs(10),
            scope_key: "scope".to_string(),
        });
        Trigger {
            key: key.to_string(),
            rule,
            events: Vec::new(),
            first_seen: SystemTime::UNIX_EPOCH,
            flushed_at: SystemTime::UNIX_EPOCH,
        }
    }

    fn names(triggers: &[Trigger]) -> Vec<&str> {
        triggers.iter().map(|t| t.rule.name.as_str()).collect()
    }

    #[test]
    fn a_free_key_with_a_free_slot_starts_immediately() {
        let mut adm = Admission::new(2);
        let started = adm.submit(trigger("a", "a"));
        assert_eq!(names(&started), vec!["a"]);
        assert_eq!(adm.running_count(), 1);
    }

    #[test]
    fn same_key_triggers_never_run_concurrently() {
        let mut adm = Admission::new(4);
        assert_eq!(adm.submit(trigger("first", "k")).len(), 1);
        assert!(adm.submit(trigger("second", "k")).is_empty());
        assert!(adm.submit(trigger("third", "k")).is_empty());
        assert_eq!(adm.running_count(), 1);

        // Completion releases exactly the next one, in FIFO order.
        let next = adm.complete("k");
        assert_eq!(names(&next), vec!["second"]);
        assert_eq!(adm.running_count(), 1);

        let next = adm.complete("k");
        assert_eq!(names(&next), vec!["third"]);

        assert!(adm.complete("k").is_empty());
        assert!(adm.is_idle());
    }

    #[test]
    fn global_limit_bounds_concurrency_across_keys() {
        let mut adm = Admission::new(2);
        assert_eq!(adm.submit(trigger("a", "a")).len(), 1);
        assert_eq!(adm.submit(trigger("b", "b")).len(), 1);
        assert!(adm.submit(trigger("c", "c")).is_empty());
        assert!(adm.submit(trigger("d", "d")).is_empty());
        assert_eq!(adm.running_count(), 2);
        assert_eq!(adm.queued_count(), 2);

        // Slots free up in completion order; waiting keys start FIFO.
        let next = adm.complete("a");
        assert_eq!(names(&next), vec!["c"]);
        let next = adm.complete("b");
        assert_eq!(names(&next), vec!["d"]);
    }

    #[test]
    fn key_release_respects_the_global_limit() {
        let mut adm = Admission::new(1);
        assert_eq!(adm.submit(trigger("a1", "a")).len(), 1);
        assert!(adm.submit(trigger("a2", "a")).is_empty());
        assert!(adm.submit(trigger("b1", "b")).is_empty());

        // "a" completing frees its key and the only slot; "b1" was first in
        // the global queue, so it wins the slot over "a2".
        let next = adm.complete("a");
        assert_eq!(names(&next), vec!["b1"]);

        let next = adm.complete("b");
        assert_eq!(names(&next), vec!["a2"]);
        adm.complete("a");
        assert!(adm.is_idle());
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        let mut adm = Admission::new(0);
        assert_eq!(adm.submit(trigger("a", "a")).len(), 1);
        assert!(adm.submit(trigger("b", "b")).is_empty());
    }
}
