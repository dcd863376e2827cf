// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LdapwatchError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Connectivity and search failures against the directory server.
    /// Retryable; a cycle that keeps failing is skipped, never half-committed.
    #[error("Directory error: {0}")]
    DirectoryError(#[from] ldap3::LdapError),

    /// Bind rejected by the server. Fatal once the configured number of
    /// consecutive failures is reached.
    #[error("Directory authentication failed: {0}")]
    AuthError(String),

    #[error("State store error: {0}")]
    StateStoreError(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, LdapwatchError>;
