// src/engine/runtime.rs

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::loader::load_and_validate;
use crate::debounce::{DebounceQueue, Trigger, WindowTimer};
use crate::diff::diff_snapshots;
use crate::directory::{normalize_dn, DirectoryClient, EntrySnapshot, PollOutcome, Poller};
use crate::errors::{LdapwatchError, Result};
use crate::rules::{match_event, RuleSet, ScopeSpec};
use crate::state::StateStore;

use super::{PipelineEvent, RuntimeOptions};

/// The poll-and-detect pipeline: one sequential loop owning the change
/// detector, rule matcher and debounce queue, feeding triggers to the
/// execution supervisor over a channel.
///
/// All per-key ordering falls out of this loop being single-threaded; the
/// only shared state is the store and the trigger channel.
pub struct Runtime<C: DirectoryClient> {
    config_path: PathBuf,
    poll_interval: std::time::Duration,
    rules: Arc<RuleSet>,
    poller: Poller<C>,
    store: Arc<StateStore>,
    debounce: DebounceQueue,
    events_tx: mpsc::Sender<PipelineEvent>,
    events_rx: mpsc::Receiver<PipelineEvent>,
    trigger_tx: mpsc::Sender<Trigger>,
    options: RuntimeOptions,
    /// Scopes that must ignore their watermark on the next cycle: all of
    /// them after a restart, and any scope whose previous cycle hit a store
    /// error (conservative re-poll instead of a silent skip).
    forced_full: HashSet<String>,
}

impl<C: DirectoryClient> Runtime<C> {
    pub fn new(
        config_path: impl Into<PathBuf>,
        poll_interval: std::time::Duration,
        rules: Arc<RuleSet>,
        poller: Poller<C>,
        store: Arc<StateStore>,
        trigger_tx: mpsc::Sender<Trigger>,
        options: RuntimeOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let forced_full = rules.scope_keys().iter().map(|k| k.to_string()).collect();

        Self {
            config_path: config_path.into(),
            poll_interval,
            rules,
            poller,
            store,
            debounce: DebounceQueue::new(),
            events_tx,
            events_rx,
            trigger_tx,
            options,
            forced_full,
        }
    }

    /// Sender for signal handlers (reload / shutdown) and timers.
    pub fn event_sender(&self) -> mpsc::Sender<PipelineEvent> {
        self.events_tx.clone()
    }

    /// Main pipeline loop.
    ///
    /// Runs a first cycle immediately, then one per interval. Debounce
    /// wake-ups and signals are handled between cycles; a cycle itself is
    /// never interrupted, so no two cycles overlap.
    pub async fn run(mut self) -> Result<()> {
        info!(
            rules = self.rules.rules().len(),
            scopes = self.rules.scopes().len(),
            interval = ?self.poll_interval,
            "pipeline started"
        );

        self.run_cycle().await?;

        if self.options.once {
            self.flush_all_windows().await;
            info!("single cycle complete");
            return Ok(());
        }

        let mut next_poll = tokio::time::Instant::now() + self.poll_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_poll) => {
                    self.run_cycle().await?;
                    next_poll = tokio::time::Instant::now() + self.poll_interval;
                }

                Some(event) = self.events_rx.recv() => match event {
                    PipelineEvent::WindowElapsed { rule, arm } => {
                        self.flush_window(&rule, arm).await;
                    }
                    PipelineEvent::ReloadRequested => {
                        self.reload();
                    }
                    PipelineEvent::ShutdownRequested => {
                        info!("shutdown requested");
                        break;
                    }
                },
            }
        }

        self.flush_all_windows().await;
        info!("pipeline exiting");
        Ok(())
    }

    /// One poll-and-detect cycle over every active scope.
    ///
    /// Scope failures are absorbed: a failing scope is skipped for this
    /// cycle (keeping its previous snapshot authoritative) and re-polled in
    /// full next time. Only exhausted authentication is fatal.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let scopes: Vec<ScopeSpec> = self.rules.scopes().to_vec();

        for spec in scopes {
            if let Err(err) = self.poll_scope(&spec).await {
                self.forced_full.insert(spec.key.clone());

                if matches!(err, LdapwatchError::AuthError(_)) && self.poller.auth_exhausted() {
                    error!(
                        scope = %spec.key,
                        error = %err,
                        "authentication failures exhausted; giving up"
                    );
                    return Err(err);
                }

                warn!(scope = %spec.key, error = %err, "poll cycle skipped for scope");
            }
        }

        Ok(())
    }

    async fn poll_scope(&mut self, spec: &ScopeSpec) -> Result<()> {
        let rules = Arc::clone(&self.rules);

        let prior = self.store.load_snapshots(&spec.key)?;
        let recorded_watermark = self.store.watermark(&spec.key)?;

        // No watermark row means this scope has never completed a cycle:
        // record the baseline without emitting events.
        let baseline = recorded_watermark.is_none();
        let watermark = if self.forced_full.contains(&spec.key) {
            None
        } else {
            recorded_watermark.clone()
        };

        let outcome = self.poller.fetch_scope(spec, watermark.as_deref()).await?;
        let current = merge_outcome(&prior, outcome);

        let now_wall = SystemTime::now();
        let events = if baseline {
            info!(
                scope = %spec.key,
                entries = current.len(),
                "baseline cycle; snapshots recorded without events"
            );
            Vec::new()
        } else {
            diff_snapshots(&prior, &current, now_wall)
        };

        let mut matched = 0usize;
        for event in &events {
            if let Err(e) = self.store.append_change(&spec.key, event) {
                warn!(dn = %event.dn, error = %e, "failed to record change in audit trail");
            }

            let matches = match_event(&rules, &spec.key, event);
            if matches.is_empty() {
                debug!(dn = %event.dn, kind = ?event.kind, "change matched no rule");
                continue;
            }

            matched += matches.len();
            let now = Instant::now();
            for matched_event in matches {
                let timer = self.debounce.observe(matched_event, now, now_wall);
                self.arm_timer(timer);
            }
        }

        // Commit the snapshot only after the events entered the pipeline; a
        // crash in between re-detects the change on the next full re-poll.
        self.store.replace_snapshots(&spec.key, &current)?;
        let new_watermark = highest_watermark(&current, recorded_watermark);
        self.store.set_watermark(&spec.key, &new_watermark)?;
        self.forced_full.remove(&spec.key);

        debug!(
            scope = %spec.key,
            entries = current.len(),
            events = events.len(),
            matched,
            "cycle complete for scope"
        );
        Ok(())
    }

    fn arm_timer(&self, timer: WindowTimer) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timer.delay).await;
            let _ = tx
                .send(PipelineEvent::WindowElapsed {
                    rule: timer.rule,
                    arm: timer.arm,
                })
                .await;
        });
    }

    async fn flush_window(&mut self, rule: &str, arm: u64) {
        if let Some(trigger) = self.debounce.close(rule, arm, SystemTime::now()) {
            self.send_trigger(trigger).await;
        }
    }

    /// Flush every open window immediately (shutdown and `--once`).
    pub async fn flush_all_windows(&mut self) {
        for trigger in self.debounce.drain(SystemTime::now()) {
            self.send_trigger(trigger).await;
        }
    }

    async fn send_trigger(&self, trigger: Trigger) {
        info!(
            rule = %trigger.rule.name,
            key = %trigger.key,
            events = trigger.events.len(),
            "dispatching trigger"
        );
        if self.trigger_tx.send(trigger).await.is_err() {
            warn!("execution supervisor is gone; trigger dropped");
        }
    }

    /// Reload the configuration and swap the active rule set atomically.
    /// A failing reload keeps the previous rule set active. In-flight
    /// triggers and executions keep the rule they were matched against.
    fn reload(&mut self) {
        match load_and_validate(&self.config_path) {
            Ok(cfg) => {
                let new_rules = Arc::new(RuleSet::compile(&cfg));
                self.poll_interval =
                    std::time::Duration::from_secs(cfg.daemon.poll_interval_seconds);

                if let Err(e) = self.store.prune_scopes(&new_rules.scope_keys()) {
                    warn!(error = %e, "failed to prune stale scope state");
                }

                info!(
                    rules = new_rules.rules().len(),
                    scopes = new_rules.scopes().len(),
                    "rule set reloaded"
                );
                self.rules = new_rules;
            }
            Err(e) => {
                error!(error = %e, "reload failed; keeping previous rule set");
            }
        }
    }
}

/// Build the cycle-N snapshot map from the poll outcome.
///
/// A full poll replaces everything; an incremental poll keeps the prior
/// entries that are still present and overlays the changed ones.
fn merge_outcome(
    prior: &BTreeMap<String, EntrySnapshot>,
    outcome: PollOutcome,
) -> BTreeMap<String, EntrySnapshot> {
    match outcome {
        PollOutcome::Full { snapshots } => snapshots
            .into_iter()
            .map(|snap| (normalize_dn(&snap.dn), snap))
            .collect(),
        PollOutcome::Incremental { changed, present } => {
            let mut current: BTreeMap<String, EntrySnapshot> = prior
                .iter()
                .filter(|(key, _)| present.contains(*key))
                .map(|(key, snap)| (key.clone(), snap.clone()))
                .collect();
            for snap in changed {
                current.insert(normalize_dn(&snap.dn), snap);
            }
            current
        }
    }
}

/// Advance the watermark to the highest modify timestamp seen, never moving
/// it backwards. Generalized-time strings order lexicographically.
fn highest_watermark(
    current: &BTreeMap<String, EntrySnapshot>,
    recorded: Option<String>,
) -> String {
    let mut watermark = recorded.unwrap_or_default();
    for snap in current.values() {
        if let Some(ts) = &snap.modify_ts {
            if *ts > watermark {
                watermark = ts.clone();
            }
        }
    }
    watermark
}
