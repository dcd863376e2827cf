// src/exec/mod.rs

//! Execution layer.
//!
//! This module is responsible for actually running the playbooks configured
//! on the rules, using `tokio::process::Command`, and for the bookkeeping
//! around it:
//!
//! - [`admission`] holds the pure per-key mutual-exclusion / global-limit
//!   queueing logic.
//! - [`backend`] provides the `RunnerBackend` trait and the concrete
//!   `AnsibleRunner` used in production; tests substitute a scripted
//!   implementation.
//! - [`supervisor`] owns the supervisor loop which admits triggers, drives
//!   the per-trigger retry sequence and appends execution records.

pub mod admission;
pub mod backend;
pub mod supervisor;

pub use admission::Admission;
pub use backend::{AnsibleRunner, AttemptOutcome, RunnerBackend};
pub use supervisor::spawn_supervisor;

use std::time::SystemTime;

use crate::types::RuleName;

/// Classification of a finished attempt, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl ExecOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecOutcome::Succeeded => "succeeded",
            ExecOutcome::Failed => "failed",
            ExecOutcome::TimedOut => "timed_out",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(ExecOutcome::Succeeded),
            "failed" => Some(ExecOutcome::Failed),
            "timed_out" => Some(ExecOutcome::TimedOut),
            _ => None,
        }
    }
}

/// Lifecycle state of an execution, as persisted.
///
/// Transitions: `Pending` -> `Running` -> `Succeeded` terminally, or
/// `Running` -> `Retrying` -> `Running` (next attempt) until `Abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Pending,
    Running,
    Succeeded,
    Retrying,
    Abandoned,
}

impl ExecStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecStatus::Pending => "pending",
            ExecStatus::Running => "running",
            ExecStatus::Succeeded => "succeeded",
            ExecStatus::Retrying => "retrying",
            ExecStatus::Abandoned => "abandoned",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecStatus::Pending),
            "running" => Some(ExecStatus::Running),
            "succeeded" => Some(ExecStatus::Succeeded),
            "retrying" => Some(ExecStatus::Retrying),
            "abandoned" => Some(ExecStatus::Abandoned),
            _ => None,
        }
    }

    /// Terminal states end a trigger's retry sequence.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecStatus::Succeeded | ExecStatus::Abandoned)
    }
}

/// One row of the append-only execution log. A state transition appends a
/// new row; rows are never updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub rule: RuleName,
    pub attempt: u32,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub outcome: Option<ExecOutcome>,
    pub status: ExecStatus,
}
