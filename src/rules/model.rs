// src/rules/model.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigFile;
use crate::directory::{normalize_dn, ENTRY_UUID_ATTR, MODIFY_TS_ATTR};
use crate::types::{ConcurrencyKey, RuleName, SearchScope};

/// What to run when a rule fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationTarget {
    pub playbook: PathBuf,
    pub inventory: Option<PathBuf>,
    pub extra_vars: Option<PathBuf>,
    pub vault_file: Option<PathBuf>,
}

/// Retry behaviour after a failed or timed-out execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `completed_attempt` (1-based):
    /// `base * 2^(n-1)`, capped.
    pub fn delay_after(&self, completed_attempt: u32) -> Duration {
        let exp = completed_attempt.saturating_sub(1).min(16);
        (self.backoff_base * 2u32.pow(exp)).min(self.backoff_cap)
    }
}

/// One compiled watch rule. Immutable for its active lifetime.
#[derive(Debug, Clone)]
pub struct WatchRule {
    pub name: RuleName,

    /// Normalized base DN.
    pub base: String,
    pub scope: SearchScope,
    pub filter: String,

    /// Lowercased watched attribute names.
    pub watched: BTreeSet<String>,

    pub target: AutomationTarget,

    pub debounce: Duration,
    pub max_aggregation: Option<Duration>,

    pub concurrency_key: ConcurrencyKey,
    pub retry: RetryPolicy,
    pub timeout: Duration,

    /// Key of the scope spec whose poll stream feeds this rule.
    pub scope_key: String,
}

/// One distinct (base, scope, filter) triple over the active rules, carrying
/// the union of the watched attributes of the rules that share it. The
/// poller runs one search per spec; snapshots are namespaced by `key`.
#[derive(Debug, Clone)]
pub struct ScopeSpec {
    pub key: String,
    pub base: String,
    pub scope: SearchScope,
    pub filter: String,

    /// Attributes requested from the server: the watched union plus the
    /// operational attributes the detector needs.
    pub request_attrs: Vec<String>,

    /// Lowercased watched union, for snapshot construction.
    pub watched: BTreeSet<String>,
}

/// The active rule set plus its derived scope specs.
///
/// Swapped wholesale on reload; in-flight triggers keep an `Arc` to the rule
/// they were matched against, so a reload never changes a running execution.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<WatchRule>>,
    scopes: Vec<ScopeSpec>,
    by_scope: HashMap<String, Vec<usize>>,
}

impl RuleSet {
    /// Compile the validated config into immutable rules and scope specs.
    pub fn compile(cfg: &ConfigFile) -> Self {
        let mut rules: Vec<Arc<WatchRule>> = Vec::with_capacity(cfg.rule.len());
        let mut scopes: BTreeMap<String, ScopeSpec> = BTreeMap::new();
        let mut by_scope: HashMap<String, Vec<usize>> = HashMap::new();

        for (name, rc) in cfg.rule.iter() {
            let base = normalize_dn(&rc.base);
            let filter = rc.filter.trim().to_string();
            let scope_key = scope_key_for(&base, rc.scope, &filter);

            let watched: BTreeSet<String> = rc
                .watched_attributes
                .iter()
                .map(|a| a.trim().to_lowercase())
                .collect();

            let spec = scopes.entry(scope_key.clone()).or_insert_with(|| ScopeSpec {
                key: scope_key.clone(),
                base: base.clone(),
                scope: rc.scope,
                filter: filter.clone(),
                request_attrs: Vec::new(),
                watched: BTreeSet::new(),
            });
            spec.watched.extend(watched.iter().cloned());

            let backoff_base = Duration::from_secs(rc.backoff_base_seconds.max(1));
            let backoff_cap = match rc.backoff_cap_seconds {
                Some(cap) => Duration::from_secs(cap.max(1)),
                None => backoff_base * 1024,
            };

            let rule = WatchRule {
                name: name.clone(),
                base,
                scope: rc.scope,
                filter,
                watched,
                target: AutomationTarget {
                    playbook: rc.playbook.clone(),
                    inventory: rc.inventory.clone(),
                    extra_vars: rc.extra_vars.clone(),
                    vault_file: rc.vault_file.clone(),
                },
                debounce: Duration::from_secs(rc.debounce_seconds),
                max_aggregation: rc.max_aggregation_seconds.map(Duration::from_secs),
                concurrency_key: rc.concurrency_key.clone().unwrap_or_else(|| name.clone()),
                retry: RetryPolicy {
                    max_retries: rc.max_retries,
                    backoff_base,
                    backoff_cap,
                },
                timeout: Duration::from_secs(rc.timeout_seconds),
                scope_key: scope_key.clone(),
            };

            by_scope
                .entry(scope_key)
                .or_default()
                .push(rules.len());
            rules.push(Arc::new(rule));
        }

        let scopes = scopes
            .into_values()
            .map(|mut spec| {
                spec.request_attrs = spec.watched.iter().cloned().collect();
                spec.request_attrs.push(ENTRY_UUID_ATTR.to_string());
                spec.request_attrs.push(MODIFY_TS_ATTR.to_string());
                spec
            })
            .collect();

        Self {
            rules,
            scopes,
            by_scope,
        }
    }

    pub fn rules(&self) -> &[Arc<WatchRule>] {
        &self.rules
    }

    pub fn scopes(&self) -> &[ScopeSpec] {
        &self.scopes
    }

    /// Rules fed by the given scope spec, in definition order.
    pub fn rules_for_scope(&self, scope_key: &str) -> impl Iterator<Item = &Arc<WatchRule>> {
        self.by_scope
            .get(scope_key)
            .into_iter()
            .flatten()
            .map(|&idx| &self.rules[idx])
    }

    /// Scope keys currently active, for pruning stale persisted state.
    pub fn scope_keys(&self) -> Vec<&str> {
        self.scopes.iter().map(|s| s.key.as_str()).collect()
    }
}

/// Deterministic identifier for a (base, scope, filter) triple, stable across
/// restarts so persisted snapshots keep matching their scope.
fn scope_key_for(base: &str, scope: SearchScope, filter: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(base.as_bytes());
    hasher.update(b"|");
    hasher.update(scope.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(filter.as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}
