#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ldapwatchd::debounce::Trigger;
use ldapwatchd::diff::{AttributeChange, ChangeEvent, ChangeKind};
use ldapwatchd::rules::{AutomationTarget, RetryPolicy, WatchRule};
use ldapwatchd::types::SearchScope;

/// Builder for `WatchRule` to simplify test setup.
pub struct WatchRuleBuilder {
    rule: WatchRule,
}

impl WatchRuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            rule: WatchRule {
                name: name.to_string(),
                base: "ou=groups,dc=example,dc=org".to_string(),
                scope: SearchScope::Sub,
                filter: "(objectClass=*)".to_string(),
                watched: BTreeSet::from(["memberuid".to_string()]),
                target: AutomationTarget {
                    playbook: PathBuf::from(format!("{name}.yml")),
                    inventory: None,
                    extra_vars: None,
                    vault_file: None,
                },
                debounce: Duration::from_secs(1),
                max_aggregation: None,
                concurrency_key: name.to_string(),
                retry: RetryPolicy {
                    max_retries: 0,
                    backoff_base: Duration::from_secs(1),
                    backoff_cap: Duration::from_secs(60),
                },
                timeout: Duration::from_secs(60),
                scope_key: "scope".to_string(),
            },
        }
    }

    pub fn base(mut self, base: &str) -> Self {
        self.rule.base = base.to_string();
        self
    }

    pub fn watched(mut self, attrs: &[&str]) -> Self {
        self.rule.watched = attrs.iter().map(|a| a.to_lowercase()).collect();
        self
    }

    pub fn debounce(mut self, secs: u64) -> Self {
        self.rule.debounce = Duration::from_secs(secs);
        self
    }

    pub fn max_aggregation(mut self, secs: u64) -> Self {
        self.rule.max_aggregation = Some(Duration::from_secs(secs));
        self
    }

    pub fn concurrency_key(mut self, key: &str) -> Self {
        self.rule.concurrency_key = key.to_string();
        self
    }

    pub fn retries(mut self, max_retries: u32, backoff_base_secs: u64) -> Self {
        self.rule.retry.max_retries = max_retries;
        self.rule.retry.backoff_base = Duration::from_secs(backoff_base_secs.max(1));
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.rule.timeout = Duration::from_secs(secs);
        self
    }

    pub fn playbook(mut self, path: &str) -> Self {
        self.rule.target.playbook = PathBuf::from(path);
        self
    }

    pub fn build(self) -> Arc<WatchRule> {
        Arc::new(self.rule)
    }
}

/// A minimal `Modified` change event for tests.
pub fn modified_event(dn: &str, attribute: &str) -> ChangeEvent {
    ChangeEvent {
        dn: dn.to_string(),
        entry_uuid: None,
        kind: ChangeKind::Modified,
        changes: vec![AttributeChange {
            attribute: attribute.to_lowercase(),
            old: vec!["old".to_string()],
            new: vec!["new".to_string()],
        }],
        detected_at: SystemTime::UNIX_EPOCH,
    }
}

/// A ready-made trigger carrying one event, as the debounce queue would
/// produce it.
pub fn trigger_for(rule: &Arc<WatchRule>, dn: &str) -> Trigger {
    Trigger {
        key: rule.concurrency_key.clone(),
        rule: Arc::clone(rule),
        events: vec![modified_event(dn, "memberuid")],
        first_seen: SystemTime::UNIX_EPOCH,
        flushed_at: SystemTime::UNIX_EPOCH,
    }
}
