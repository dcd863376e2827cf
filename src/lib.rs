// src/lib.rs

pub mod cli;
pub mod config;
pub mod debounce;
pub mod diff;
pub mod directory;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod rules;
pub mod state;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::ConfigFile;
use crate::directory::{LdapDirectoryClient, Poller};
use crate::engine::{PipelineEvent, Runtime, RuntimeOptions};
use crate::exec::{spawn_supervisor, AnsibleRunner};
use crate::rules::RuleSet;
use crate::state::StateStore;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - state store
/// - directory client / poller
/// - execution supervisor
/// - the pipeline runtime
/// - signal handling (reload, graceful shutdown)
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let store = Arc::new(StateStore::open(&cfg.daemon.state_path)?);
    let rules = Arc::new(RuleSet::compile(&cfg));

    // Drop persisted state for scopes no rule references anymore.
    if let Err(e) = store.prune_scopes(&rules.scope_keys()) {
        warn!(error = %e, "failed to prune stale scope state at startup");
    }

    let client = LdapDirectoryClient::new(cfg.directory.clone())?;
    let poller = Poller::new(client, &cfg.directory);

    // Force-stop channel: flipped after the shutdown grace period elapses.
    let (force_tx, force_rx) = watch::channel(false);

    let backend = Arc::new(AnsibleRunner::new(&cfg.daemon.runner_command));
    let (trigger_tx, mut supervisor) = spawn_supervisor(
        backend,
        Arc::clone(&store),
        cfg.daemon.max_concurrent_executions,
        force_rx,
    );

    let runtime = Runtime::new(
        &args.config,
        Duration::from_secs(cfg.daemon.poll_interval_seconds),
        rules,
        poller,
        store,
        trigger_tx,
        RuntimeOptions { once: args.once },
    );

    spawn_signal_handlers(runtime.event_sender());

    // The runtime owns the only trigger sender; when it returns, the
    // supervisor's intake closes and the drain begins.
    runtime.run().await?;

    let grace = Duration::from_secs(cfg.daemon.shutdown_grace_seconds);
    match tokio::time::timeout(grace, &mut supervisor).await {
        Ok(joined) => {
            if let Err(e) = joined {
                error!(error = %e, "execution supervisor task failed");
            }
            info!("shutdown complete");
        }
        Err(_) => {
            warn!(grace = ?grace, "grace period elapsed; force-stopping executions");
            let _ = force_tx.send(true);
            if let Err(e) = supervisor.await {
                error!(error = %e, "execution supervisor task failed");
            }
            info!("shutdown complete (forced)");
        }
    }

    Ok(())
}

/// Wire Ctrl-C / SIGTERM to a graceful shutdown and SIGHUP to a reload.
fn spawn_signal_handlers(events: tokio::sync::mpsc::Sender<PipelineEvent>) {
    {
        let tx = events.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(PipelineEvent::ShutdownRequested).await;
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        {
            let tx = events.clone();
            tokio::spawn(async move {
                let Ok(mut term) = signal(SignalKind::terminate()) else {
                    eprintln!("failed to install SIGTERM handler");
                    return;
                };
                while term.recv().await.is_some() {
                    let _ = tx.send(PipelineEvent::ShutdownRequested).await;
                }
            });
        }

        {
            let tx = events;
            tokio::spawn(async move {
                let Ok(mut hup) = signal(SignalKind::hangup()) else {
                    eprintln!("failed to install SIGHUP handler");
                    return;
                };
                while hup.recv().await.is_some() {
                    let _ = tx.send(PipelineEvent::ReloadRequested).await;
                }
            });
        }
    }
}

/// Simple dry-run output: print the daemon settings and the parsed rules.
fn print_dry_run(cfg: &ConfigFile) {
    println!("ldapwatchd dry-run");
    println!("  daemon.poll_interval_seconds = {}", cfg.daemon.poll_interval_seconds);
    println!(
        "  daemon.max_concurrent_executions = {}",
        cfg.daemon.max_concurrent_executions
    );
    println!("  directory.url = {}", cfg.directory.url);
    println!();

    println!("rules ({}):", cfg.rule.len());
    for (name, rule) in cfg.rule.iter() {
        println!("  - {name}");
        println!("      base: {}", rule.base);
        println!("      scope: {}", rule.scope);
        println!("      filter: {}", rule.filter);
        println!("      watched_attributes: {:?}", rule.watched_attributes);
        println!("      playbook: {}", rule.playbook.display());
        if let Some(ref inventory) = rule.inventory {
            println!("      inventory: {}", inventory.display());
        }
        if let Some(ref extra_vars) = rule.extra_vars {
            println!("      extra_vars: {}", extra_vars.display());
        }
        if let Some(ref vault_file) = rule.vault_file {
            println!("      vault_file: {}", vault_file.display());
        }
        println!("      debounce_seconds: {}", rule.debounce_seconds);
        if let Some(max_agg) = rule.max_aggregation_seconds {
            println!("      max_aggregation_seconds: {max_agg}");
        }
        if let Some(ref key) = rule.concurrency_key {
            println!("      concurrency_key: {key}");
        }
        println!(
            "      retries: {} (backoff base {}s)",
            rule.max_retries, rule.backoff_base_seconds
        );
        println!("      timeout_seconds: {}", rule.timeout_seconds);
    }
}
