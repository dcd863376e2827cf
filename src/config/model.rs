// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::types::SearchScope;

/// Top-level configuration as read from a TOML file, before validation.
///
/// ```toml
/// [daemon]
/// poll_interval_seconds = 30
/// max_concurrent_executions = 4
///
/// [directory]
/// url = "ldap://ldap.example.org:389"
/// bind_dn = "cn=watcher,dc=example,dc=org"
/// bind_password_file = "/etc/ldapwatchd.secret"
///
/// [rule.groups]
/// base = "ou=groups,dc=example,dc=org"
/// filter = "(objectClass=posixGroup)"
/// watched_attributes = ["memberUid"]
/// playbook = "/etc/ldapwatchd.d/groups.yml"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    /// Global daemon behaviour from `[daemon]`.
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Directory server connection parameters from `[directory]`.
    pub directory: DirectorySection,

    /// All watch rules from `[rule.<name>]`, keyed by rule name.
    #[serde(default)]
    pub rule: BTreeMap<String, RuleConfig>,
}

/// Validated configuration. Constructed only through
/// `ConfigFile::try_from(raw)`, which runs the semantic checks.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub daemon: DaemonSection,
    pub directory: DirectorySection,
    pub rule: BTreeMap<String, RuleConfig>,
}

impl ConfigFile {
    /// Internal constructor used by the validation layer.
    pub(crate) fn new_unchecked(
        daemon: DaemonSection,
        directory: DirectorySection,
        rule: BTreeMap<String, RuleConfig>,
    ) -> Self {
        Self {
            daemon,
            directory,
            rule,
        }
    }
}

/// `[daemon]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    /// Seconds between poll cycles. A new cycle never starts before the
    /// previous one fully completes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Upper bound on playbook executions running at the same time,
    /// across all rules.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// Path of the SQLite state database.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// How long a graceful shutdown waits for queued and running executions
    /// before force-killing them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// The automation runner binary.
    #[serde(default = "default_runner_command")]
    pub runner_command: String,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}

fn default_state_path() -> PathBuf {
    PathBuf::from("ldapwatchd.db")
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_runner_command() -> String {
    "ansible-playbook".to_string()
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            max_concurrent_executions: default_max_concurrent(),
            state_path: default_state_path(),
            shutdown_grace_seconds: default_shutdown_grace(),
            runner_command: default_runner_command(),
        }
    }
}

/// `[directory]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySection {
    /// Server URL, e.g. `ldap://host:389` or `ldaps://host:636`.
    pub url: String,

    /// DN used for the simple bind. Empty means anonymous.
    #[serde(default)]
    pub bind_dn: String,

    /// Bind password given inline.
    #[serde(default)]
    pub bind_password: Option<String>,

    /// Bind password read from a file (first line, trailing newline trimmed).
    /// Takes precedence over `bind_password`.
    #[serde(default)]
    pub bind_password_file: Option<PathBuf>,

    /// Upgrade a plain connection with STARTTLS before binding.
    #[serde(default)]
    pub use_starttls: bool,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Consecutive bind failures tolerated before the daemon exits non-zero.
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,

    /// Cap for the exponential reconnect/search backoff within a poll cycle.
    #[serde(default = "default_directory_backoff_cap")]
    pub backoff_cap_seconds: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_auth_failures() -> u32 {
    3
}

fn default_directory_backoff_cap() -> u64 {
    300
}

/// `[rule.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    /// Search base DN for this rule.
    pub base: String,

    /// Search scope below `base`.
    #[serde(default)]
    pub scope: SearchScope,

    /// LDAP filter applied server-side.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Attribute names that are diff-significant for this rule.
    /// Changes to anything else are ignored.
    pub watched_attributes: Vec<String>,

    /// Playbook to run when the rule fires.
    pub playbook: PathBuf,

    /// Inventory passed to the runner via `-i`.
    #[serde(default)]
    pub inventory: Option<PathBuf>,

    /// Extra-variables file passed via `-e @<file>`.
    #[serde(default)]
    pub extra_vars: Option<PathBuf>,

    /// Vault password file passed via `--vault-password-file`.
    #[serde(default)]
    pub vault_file: Option<PathBuf>,

    /// Sliding debounce window; further matched changes within this window
    /// coalesce into the same trigger and re-arm the timer.
    #[serde(default = "default_debounce")]
    pub debounce_seconds: u64,

    /// Upper bound on how long a window may stay open under continuous
    /// churn, measured from its first event. Unset means unbounded.
    #[serde(default)]
    pub max_aggregation_seconds: Option<u64>,

    /// Unit of mutual exclusion for executions. Defaults to the rule name;
    /// rules sharing a key never run concurrently with each other.
    #[serde(default)]
    pub concurrency_key: Option<String>,

    /// Retries after a failed or timed-out execution.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: u64,

    /// Cap for the retry backoff. Unset falls back to 10 doublings of base.
    #[serde(default)]
    pub backoff_cap_seconds: Option<u64>,

    /// Hard deadline for one playbook attempt; exceeding it kills the
    /// process and counts as a failure.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_filter() -> String {
    "(objectClass=*)".to_string()
}

fn default_debounce() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base() -> u64 {
    1
}

fn default_timeout() -> u64 {
    600
}
