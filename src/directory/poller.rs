// src/directory/poller.rs

//! Poll cycles against the directory server.
//!
//! One poll cycle runs one search per scope spec, strictly sequentially.
//! Connectivity failures are retried inside the cycle with a capped
//! exponential backoff; if they persist the scope's cycle is skipped and the
//! previous snapshot stays authoritative. Bind failures are counted across
//! cycles and become fatal once the configured threshold is reached.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::DirectorySection;
use crate::errors::{LdapwatchError, Result};
use crate::rules::ScopeSpec;

use super::client::DirectoryClient;
use super::snapshot::{normalize_dn, EntrySnapshot};
use super::MODIFY_TS_ATTR;

/// Search attempts per cycle before the scope is skipped.
const SEARCH_ATTEMPTS: u32 = 3;

/// Result of polling one scope.
#[derive(Debug)]
pub enum PollOutcome {
    /// Every entry currently in scope.
    Full { snapshots: Vec<EntrySnapshot> },

    /// Watermark-based poll: entries added or modified since the watermark,
    /// plus the normalized DNs of everything currently present (for removal
    /// detection).
    Incremental {
        changed: Vec<EntrySnapshot>,
        present: HashSet<String>,
    },
}

pub struct Poller<C: DirectoryClient> {
    client: C,
    backoff_cap: Duration,
    max_auth_failures: u32,
    consecutive_auth_failures: u32,
}

impl<C: DirectoryClient> Poller<C> {
    pub fn new(client: C, directory: &DirectorySection) -> Self {
        Self {
            client,
            backoff_cap: Duration::from_secs(directory.backoff_cap_seconds.max(1)),
            max_auth_failures: directory.max_auth_failures,
            consecutive_auth_failures: 0,
        }
    }

    /// True once the configured number of consecutive bind failures has been
    /// reached; the daemon must exit rather than keep running blind.
    pub fn auth_exhausted(&self) -> bool {
        self.consecutive_auth_failures >= self.max_auth_failures
    }

    /// Poll one scope. With a watermark an incremental poll is attempted
    /// first; if either incremental search is rejected, the poller falls back
    /// to a full poll of the scope.
    pub async fn fetch_scope(
        &mut self,
        spec: &ScopeSpec,
        watermark: Option<&str>,
    ) -> Result<PollOutcome> {
        match watermark.filter(|wm| !wm.is_empty()) {
            Some(wm) => match self.fetch_incremental(spec, wm).await {
                Ok(outcome) => Ok(outcome),
                Err(err @ LdapwatchError::AuthError(_)) => Err(err),
                Err(err) => {
                    warn!(
                        scope = %spec.key,
                        error = %err,
                        "watermark poll rejected; falling back to full poll"
                    );
                    self.fetch_full(spec).await
                }
            },
            None => self.fetch_full(spec).await,
        }
    }

    async fn fetch_full(&mut self, spec: &ScopeSpec) -> Result<PollOutcome> {
        let entries = self
            .search_with_retry(&spec.base, spec.scope, &spec.filter, &spec.request_attrs)
            .await?;

        debug!(scope = %spec.key, entries = entries.len(), "full poll completed");

        let snapshots = entries
            .into_iter()
            .map(|raw| EntrySnapshot::from_raw(raw, &spec.watched))
            .collect();

        Ok(PollOutcome::Full { snapshots })
    }

    async fn fetch_incremental(&mut self, spec: &ScopeSpec, watermark: &str) -> Result<PollOutcome> {
        let inc_filter = format!(
            "(&{}({}>={}))",
            wrap_filter(&spec.filter),
            MODIFY_TS_ATTR,
            watermark
        );

        let changed_raw = self
            .search_with_retry(&spec.base, spec.scope, &inc_filter, &spec.request_attrs)
            .await?;

        // A watermark search cannot observe deletions, so pair it with an
        // attribute-less presence scan of the scope.
        let presence_attrs = vec!["1.1".to_string()];
        let present_raw = self
            .search_with_retry(&spec.base, spec.scope, &spec.filter, &presence_attrs)
            .await?;

        debug!(
            scope = %spec.key,
            changed = changed_raw.len(),
            present = present_raw.len(),
            "incremental poll completed"
        );

        let changed = changed_raw
            .into_iter()
            .map(|raw| EntrySnapshot::from_raw(raw, &spec.watched))
            .collect();
        let present = present_raw
            .into_iter()
            .map(|raw| normalize_dn(&raw.dn))
            .collect();

        Ok(PollOutcome::Incremental { changed, present })
    }

    async fn search_with_retry(
        &mut self,
        base: &str,
        scope: crate::types::SearchScope,
        filter: &str,
        attrs: &[String],
    ) -> Result<Vec<super::client::RawEntry>> {
        let mut delay = Duration::from_secs(1);

        for attempt in 1..=SEARCH_ATTEMPTS {
            match self.client.search(base, scope, filter, attrs).await {
                Ok(entries) => {
                    self.consecutive_auth_failures = 0;
                    return Ok(entries);
                }
                Err(err @ LdapwatchError::AuthError(_)) => {
                    self.consecutive_auth_failures += 1;
                    warn!(
                        base,
                        failures = self.consecutive_auth_failures,
                        max = self.max_auth_failures,
                        error = %err,
                        "bind rejected by directory server"
                    );
                    return Err(err);
                }
                Err(err) if attempt < SEARCH_ATTEMPTS => {
                    warn!(
                        base,
                        attempt,
                        retry_in = ?delay,
                        error = %err,
                        "directory search failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.backoff_cap);
                }
                Err(err) => return Err(err),
            }
        }

        unreachable!("search retry loop always returns");
    }
}

/// Ensure a filter expression is parenthesized so it can be embedded in a
/// conjunction.
fn wrap_filter(filter: &str) -> String {
    let trimmed = filter.trim();
    if trimmed.starts_with('(') {
        trimmed.to_string()
    } else {
        format!("({trimmed})")
    }
}
