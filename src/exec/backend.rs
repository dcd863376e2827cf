// src/exec/backend.rs

//! Pluggable runner backend abstraction.
//!
//! The supervisor drives a `RunnerBackend` instead of spawning processes
//! directly. Production uses [`AnsibleRunner`]; tests can provide an
//! implementation that scripts outcomes and never forks.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::rules::WatchRule;

/// Result of one playbook attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Process exited 0.
    Succeeded,
    /// Process exited non-zero (or could not report a code).
    Failed(i32),
    /// The rule's timeout elapsed; the process was killed.
    TimedOut,
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, AttemptOutcome::Succeeded)
    }
}

/// Trait abstracting how one execution attempt is performed.
///
/// The returned future is bounded by the rule's execution timeout; it never
/// waits indefinitely.
pub trait RunnerBackend: Send + Sync + 'static {
    fn run_attempt(
        &self,
        rule: Arc<WatchRule>,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = Result<AttemptOutcome>> + Send + 'static>>;
}

/// Real backend invoking the automation runner as a subprocess.
///
/// The argument shape follows the conventional `ansible-playbook` call:
/// `-i <inventory> -e @<extra_vars> --vault-password-file <vault> <playbook>`,
/// each option present only when the rule configures it. Output is captured
/// and logged, never interpreted; the exit status is the whole contract.
pub struct AnsibleRunner {
    command: String,
}

impl AnsibleRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Arguments derived from a rule's automation target.
    fn argv(rule: &WatchRule) -> Vec<std::ffi::OsString> {
        let mut argv = Vec::new();
        if let Some(inventory) = &rule.target.inventory {
            argv.push("-i".into());
            argv.push(inventory.clone().into_os_string());
        }
        if let Some(extra_vars) = &rule.target.extra_vars {
            argv.push("-e".into());
            let mut arg = std::ffi::OsString::from("@");
            arg.push(extra_vars.as_os_str());
            argv.push(arg);
        }
        if let Some(vault_file) = &rule.target.vault_file {
            argv.push("--vault-password-file".into());
            argv.push(vault_file.clone().into_os_string());
        }
        argv.push(rule.target.playbook.clone().into_os_string());
        argv
    }
}

impl RunnerBackend for AnsibleRunner {
    fn run_attempt(
        &self,
        rule: Arc<WatchRule>,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = Result<AttemptOutcome>> + Send + 'static>> {
        let command = self.command.clone();

        Box::pin(async move {
            let argv = Self::argv(&rule);
            info!(
                rule = %rule.name,
                attempt,
                command = %command,
                playbook = ?rule.target.playbook,
                "starting playbook run"
            );

            let mut cmd = Command::new(&command);
            cmd.args(&argv)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd
                .spawn()
                .with_context(|| format!("spawning '{}' for rule '{}'", command, rule.name))?;

            // Drain both streams so the child can never block on a full pipe;
            // the content is logged, not interpreted.
            if let Some(stdout) = child.stdout.take() {
                let rule_name = rule.name.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(rule = %rule_name, "stdout: {}", line);
                    }
                });
            }
            if let Some(stderr) = child.stderr.take() {
                let rule_name = rule.name.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(rule = %rule_name, "stderr: {}", line);
                    }
                });
            }

            tokio::select! {
                status_res = child.wait() => {
                    let status = status_res
                        .with_context(|| format!("waiting for runner of rule '{}'", rule.name))?;
                    let code = status.code().unwrap_or(-1);

                    info!(
                        rule = %rule.name,
                        attempt,
                        exit_code = code,
                        success = status.success(),
                        "playbook run exited"
                    );

                    if status.success() {
                        Ok(AttemptOutcome::Succeeded)
                    } else {
                        Ok(AttemptOutcome::Failed(code))
                    }
                }

                _ = tokio::time::sleep(rule.timeout) => {
                    warn!(
                        rule = %rule.name,
                        attempt,
                        timeout = ?rule.timeout,
                        "playbook run exceeded its timeout; killing it"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(rule = %rule.name, error = %e, "failed to kill timed-out runner");
                    }
                    Ok(AttemptOutcome::TimedOut)
                }
            }
        })
    }
}
