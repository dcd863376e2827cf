// src/directory/mod.rs

//! Directory server access layer.
//!
//! - [`client`] defines the `DirectoryClient` trait plus the production
//!   `ldap3` implementation, and owns bind/reconnect handling.
//! - [`snapshot`] holds the `EntrySnapshot` type stored per poll cycle.
//! - [`poller`] runs one search per scope spec and classifies failures
//!   (retryable connectivity vs. fatal authentication).

pub mod client;
pub mod poller;
pub mod snapshot;

pub use client::{DirectoryClient, LdapDirectoryClient, RawEntry};
pub use poller::{PollOutcome, Poller};
pub use snapshot::{normalize_dn, EntrySnapshot};

/// Operational attribute carrying a stable entry identifier, used to tell
/// renames from remove/add pairs.
pub const ENTRY_UUID_ATTR: &str = "entryUUID";

/// Operational attribute used as the incremental poll watermark.
pub const MODIFY_TS_ATTR: &str = "modifyTimestamp";
