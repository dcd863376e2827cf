// src/directory/snapshot.rs

//! Per-cycle entry snapshots and their content hash.

use std::collections::{BTreeMap, BTreeSet};

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use super::client::RawEntry;
use super::{ENTRY_UUID_ATTR, MODIFY_TS_ATTR};

/// The state of one directory entry as seen by one poll cycle.
///
/// Only watched attributes are stored; attribute names are lowercased and
/// values sorted so that snapshots compare and hash deterministically.
/// A snapshot is immutable once stored and is superseded wholesale by the
/// next cycle's snapshot for the same DN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    /// DN as returned by the server.
    pub dn: String,

    /// Stable entry identifier, when the server publishes one.
    pub entry_uuid: Option<String>,

    /// Watched attribute name (lowercase) -> sorted values.
    pub attributes: BTreeMap<String, Vec<String>>,

    /// `modifyTimestamp` as reported by the server (generalized time,
    /// lexicographically ordered).
    pub modify_ts: Option<String>,
}

impl EntrySnapshot {
    pub fn new(
        dn: impl Into<String>,
        entry_uuid: Option<String>,
        attributes: BTreeMap<String, Vec<String>>,
        modify_ts: Option<String>,
    ) -> Self {
        let attributes = attributes
            .into_iter()
            .map(|(name, mut values)| {
                values.sort();
                (name.to_lowercase(), values)
            })
            .collect();
        Self {
            dn: dn.into(),
            entry_uuid,
            attributes,
            modify_ts,
        }
    }

    /// Build a snapshot from a raw search entry, keeping only attributes in
    /// `watched` (lowercase names). The entry UUID and modify timestamp are
    /// pulled out of the operational attributes.
    pub fn from_raw(raw: RawEntry, watched: &BTreeSet<String>) -> Self {
        let mut entry_uuid = None;
        let mut modify_ts = None;
        let mut attributes = BTreeMap::new();

        for (name, values) in raw.attrs {
            let lower = name.to_lowercase();
            if lower == ENTRY_UUID_ATTR.to_lowercase() {
                entry_uuid = values.into_iter().next();
            } else if lower == MODIFY_TS_ATTR.to_lowercase() {
                modify_ts = values.into_iter().next();
            } else if watched.contains(&lower) {
                attributes.insert(lower, values);
            }
        }

        Self::new(raw.dn, entry_uuid, attributes, modify_ts)
    }

    /// Deterministic blake3 hash over the watched attribute map.
    ///
    /// Stored alongside the snapshot so unchanged entries can be compared
    /// without deserializing the attribute JSON.
    pub fn attr_hash(&self) -> String {
        let mut hasher = Hasher::new();
        for (name, values) in &self.attributes {
            hasher.update(name.as_bytes());
            hasher.update(b"\x1f");
            for value in values {
                hasher.update(value.as_bytes());
                hasher.update(b"\x1e");
            }
            hasher.update(b"\x1d");
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Normalize a DN for use as a map key and in scope comparisons:
/// lowercase, with spaces around the comma separators removed.
///
/// Not a full RFC 4514 normalization; escaped separators inside attribute
/// values are left untouched, which is enough for the subtree checks the
/// matcher performs.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(",")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn raw(dn: &str, attrs: &[(&str, &[&str])]) -> RawEntry {
        RawEntry {
            dn: dn.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn watched(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_lowercase()).collect()
    }

    #[test]
    fn from_raw_keeps_only_watched_attributes() {
        let snapshot = EntrySnapshot::from_raw(
            raw(
                "cn=staff,ou=groups,dc=example,dc=org",
                &[
                    ("memberUid", &["alice", "bob"]),
                    ("description", &["people"]),
                    ("entryUUID", &["u-1"]),
                    ("modifyTimestamp", &["20260101120000Z"]),
                ],
            ),
            &watched(&["memberUid"]),
        );

        assert_eq!(snapshot.entry_uuid.as_deref(), Some("u-1"));
        assert_eq!(snapshot.modify_ts.as_deref(), Some("20260101120000Z"));
        assert!(snapshot.attributes.contains_key("memberuid"));
        assert!(!snapshot.attributes.contains_key("description"));
    }

    #[test]
    fn attr_hash_is_order_insensitive() {
        let a = EntrySnapshot::new(
            "cn=a",
            None,
            BTreeMap::from([("memberuid".to_string(), vec!["b".to_string(), "a".to_string()])]),
            None,
        );
        let b = EntrySnapshot::new(
            "cn=a",
            None,
            BTreeMap::from([("memberuid".to_string(), vec!["a".to_string(), "b".to_string()])]),
            None,
        );
        assert_eq!(a.attr_hash(), b.attr_hash());
    }

    #[test]
    fn attr_hash_changes_with_values() {
        let a = EntrySnapshot::new(
            "cn=a",
            None,
            BTreeMap::from([("memberuid".to_string(), vec!["alice".to_string()])]),
            None,
        );
        let b = EntrySnapshot::new(
            "cn=a",
            None,
            BTreeMap::from([("memberuid".to_string(), vec!["bob".to_string()])]),
            None,
        );
        assert_ne!(a.attr_hash(), b.attr_hash());
    }

    #[test]
    fn normalize_dn_lowercases_and_strips_separator_spaces() {
        assert_eq!(
            normalize_dn("CN=Staff, OU=Groups, DC=Example, DC=Org"),
            "cn=staff,ou=groups,dc=example,dc=org"
        );
    }
}
