// src/engine/mod.rs

//! Orchestration engine for ldapwatchd.
//!
//! This module ties together:
//! - the sequential poll-and-detect pipeline (one cycle at a time)
//! - the change detector and rule matcher
//! - the debounce queue and its timers
//! - reload and shutdown signal handling
//!
//! The deterministic pieces (diffing, matching, debouncing, admission) are
//! pure and live in their own modules; the async/IO shell is implemented in
//! [`runtime`].

use crate::types::RuleName;

/// Events flowing into the pipeline loop from timers and signal handlers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A debounce timer elapsed for a rule's window. Stale arms (the window
    /// was re-armed or already flushed) are ignored.
    WindowElapsed { rule: RuleName, arm: u64 },
    /// SIGHUP: reload the configuration and swap the active rule set.
    ReloadRequested,
    /// SIGTERM / Ctrl-C: flush open windows, then drain and exit.
    ShutdownRequested,
}

/// Runtime options used by the pipeline loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// If true, run a single poll cycle, flush pending windows immediately
    /// and exit once executions drain (used for `--once`).
    pub once: bool,
}

pub mod runtime;

pub use runtime::Runtime;
