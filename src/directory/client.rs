// src/directory/client.rs

//! LDAP client abstraction.
//!
//! The pipeline talks to a [`DirectoryClient`] instead of `ldap3` directly,
//! so tests can substitute a scripted in-memory directory. The production
//! [`LdapDirectoryClient`] keeps one bound connection cached and rebuilds it
//! after any search failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DirectorySection;
use crate::errors::{LdapwatchError, Result};
use crate::types::SearchScope;

/// One entry as returned by the server, before snapshot conversion.
/// Binary attributes are not carried; watched attributes are textual.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

/// Read-only directory access as the poller needs it.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Run one search and return all matching entries.
    ///
    /// Implementations classify bind rejections as
    /// [`LdapwatchError::AuthError`] so the poller can count them toward the
    /// fatal threshold; everything else surfaces as a retryable directory
    /// error.
    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
    ) -> Result<Vec<RawEntry>>;
}

/// Production client backed by `ldap3`.
pub struct LdapDirectoryClient {
    config: DirectorySection,
    bind_password: String,
    /// Cached bound connection, rebuilt lazily after failures.
    connection: Arc<Mutex<Option<Ldap>>>,
}

impl LdapDirectoryClient {
    /// Build the client, resolving the bind password (file takes precedence
    /// over the inline value).
    pub fn new(config: DirectorySection) -> Result<Self> {
        let bind_password = match &config.bind_password_file {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                contents.trim_end_matches(['\r', '\n']).to_string()
            }
            None => config.bind_password.clone().unwrap_or_default(),
        };

        Ok(Self {
            config,
            bind_password,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    async fn get_connection(&self) -> Result<Ldap> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.create_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self) {
        let mut guard = self.connection.lock().await;
        *guard = None;
    }

    async fn create_connection(&self) -> Result<Ldap> {
        let url = self.config.url.trim();

        debug!(url = %url, "connecting to directory server");

        let settings = LdapConnSettings::new()
            .set_conn_timeout(Duration::from_secs(self.config.connect_timeout_seconds))
            .set_starttls(self.config.use_starttls);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, url).await?;

        // Drive the connection in the background for as long as it lives.
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "directory connection driver error");
            }
        });

        let bind_dn = &self.config.bind_dn;
        debug!(bind_dn = %bind_dn, "performing simple bind");

        let result = ldap.simple_bind(bind_dn, &self.bind_password).await?;
        if result.rc != 0 {
            // 49 = invalidCredentials; anything else non-zero on bind is
            // treated the same way for the fatal-failure counter.
            return Err(LdapwatchError::AuthError(format!(
                "bind as '{}' rejected with code {}: {}",
                bind_dn, result.rc, result.text
            )));
        }

        info!(url = %url, bind_dn = %bind_dn, "directory connection established");

        Ok(ldap)
    }
}

fn to_ldap_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::One => Scope::OneLevel,
        SearchScope::Sub => Scope::Subtree,
    }
}

#[async_trait]
impl DirectoryClient for LdapDirectoryClient {
    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
    ) -> Result<Vec<RawEntry>> {
        let mut ldap = self.get_connection().await?;

        let outcome = ldap
            .search(base, to_ldap_scope(scope), filter, attrs.to_vec())
            .await
            .and_then(|res| res.success());

        let (entries, _res) = match outcome {
            Ok(ok) => ok,
            Err(err) => {
                // The cached connection may be dead; rebuild it next time.
                self.drop_connection().await;
                return Err(err.into());
            }
        };

        let raw = entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                RawEntry {
                    dn: entry.dn,
                    attrs: entry.attrs,
                }
            })
            .collect();

        Ok(raw)
    }
}
