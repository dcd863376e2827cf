// src/diff/mod.rs

//! Change detection between consecutive snapshot sets.
//!
//! The detector is a pure function over (prior map, current map) for one
//! scope; it never touches the store or the network, which keeps it
//! exhaustively testable. Maps are keyed by normalized DN.
//!
//! Entry-UUID disambiguation:
//! - same DN, different UUID: the entry was replaced — `Removed` + `Added`.
//! - same UUID, different DN: the entry was renamed — one `Modified`
//!   carrying the DN move as an `entrydn` old/new pair.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::SystemTime;

use serde::Serialize;

use crate::directory::EntrySnapshot;

/// Pseudo-attribute name used to report a DN move inside a `Modified` event.
/// Diff-significant for every rule, whatever its watched set.
pub const DN_MOVE_ATTR: &str = "entrydn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One attribute-level difference. `old` is empty for values appearing with
/// an `Added` entry, `new` is empty for values going away with a `Removed`
/// one, so a change list is always enough to replay the transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeChange {
    pub attribute: String,
    pub old: Vec<String>,
    pub new: Vec<String>,
}

/// One entry-level change, produced once per poll cycle per changed DN.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// DN as reported by the server (the new DN for a rename).
    pub dn: String,
    pub entry_uuid: Option<String>,
    pub kind: ChangeKind,
    pub changes: Vec<AttributeChange>,
    pub detected_at: SystemTime,
}

/// Diff cycle N−1 (`prior`) against cycle N (`current`).
///
/// Both maps are keyed by normalized DN. Events come out in normalized-DN
/// order, additions and modifications first, then removals.
pub fn diff_snapshots(
    prior: &BTreeMap<String, EntrySnapshot>,
    current: &BTreeMap<String, EntrySnapshot>,
    detected_at: SystemTime,
) -> Vec<ChangeEvent> {
    let mut events = Vec::new();

    // Prior DNs indexed by entry UUID, for rename detection.
    let uuid_to_prior: HashMap<&str, &String> = prior
        .iter()
        .filter_map(|(key, snap)| snap.entry_uuid.as_deref().map(|uuid| (uuid, key)))
        .collect();

    // Prior keys explained away as the source of a rename.
    let mut renamed_away: HashSet<&String> = HashSet::new();

    for (key, cur) in current {
        match prior.get(key) {
            Some(old) => {
                let replaced = matches!(
                    (&old.entry_uuid, &cur.entry_uuid),
                    (Some(a), Some(b)) if a != b
                );
                if replaced {
                    events.push(ChangeEvent {
                        dn: old.dn.clone(),
                        entry_uuid: old.entry_uuid.clone(),
                        kind: ChangeKind::Removed,
                        changes: removal_changes(old),
                        detected_at,
                    });
                    events.push(ChangeEvent {
                        dn: cur.dn.clone(),
                        entry_uuid: cur.entry_uuid.clone(),
                        kind: ChangeKind::Added,
                        changes: addition_changes(cur),
                        detected_at,
                    });
                    continue;
                }

                let changes = attribute_diff(old, cur);
                if !changes.is_empty() {
                    events.push(ChangeEvent {
                        dn: cur.dn.clone(),
                        entry_uuid: cur.entry_uuid.clone(),
                        kind: ChangeKind::Modified,
                        changes,
                        detected_at,
                    });
                }
            }
            None => {
                // New DN. If its UUID was previously seen under a DN that is
                // now gone, this is a rename, not an addition.
                let rename_source = cur
                    .entry_uuid
                    .as_deref()
                    .and_then(|uuid| uuid_to_prior.get(uuid).copied())
                    .filter(|old_key| !current.contains_key(*old_key));

                if let Some(old_key) = rename_source {
                    let old = &prior[old_key];
                    renamed_away.insert(old_key);

                    let mut changes = vec![AttributeChange {
                        attribute: DN_MOVE_ATTR.to_string(),
                        old: vec![old.dn.clone()],
                        new: vec![cur.dn.clone()],
                    }];
                    changes.extend(attribute_diff(old, cur));

                    events.push(ChangeEvent {
                        dn: cur.dn.clone(),
                        entry_uuid: cur.entry_uuid.clone(),
                        kind: ChangeKind::Modified,
                        changes,
                        detected_at,
                    });
                } else {
                    events.push(ChangeEvent {
                        dn: cur.dn.clone(),
                        entry_uuid: cur.entry_uuid.clone(),
                        kind: ChangeKind::Added,
                        changes: addition_changes(cur),
                        detected_at,
                    });
                }
            }
        }
    }

    for (key, old) in prior {
        if !current.contains_key(key) && !renamed_away.contains(key) {
            events.push(ChangeEvent {
                dn: old.dn.clone(),
                entry_uuid: old.entry_uuid.clone(),
                kind: ChangeKind::Removed,
                changes: removal_changes(old),
                detected_at,
            });
        }
    }

    events
}

/// Attribute-level diff restricted to what the snapshots store (the watched
/// set). Values are already sorted, so slice equality is value-set equality.
fn attribute_diff(old: &EntrySnapshot, new: &EntrySnapshot) -> Vec<AttributeChange> {
    let mut names: Vec<&String> = old.attributes.keys().collect();
    for name in new.attributes.keys() {
        if !old.attributes.contains_key(name) {
            names.push(name);
        }
    }
    names.sort();

    let empty: Vec<String> = Vec::new();
    names
        .into_iter()
        .filter_map(|name| {
            let old_vals = old.attributes.get(name).unwrap_or(&empty);
            let new_vals = new.attributes.get(name).unwrap_or(&empty);
            if old_vals == new_vals {
                None
            } else {
                Some(AttributeChange {
                    attribute: name.clone(),
                    old: old_vals.clone(),
                    new: new_vals.clone(),
                })
            }
        })
        .collect()
}

fn addition_changes(snap: &EntrySnapshot) -> Vec<AttributeChange> {
    snap.attributes
        .iter()
        .map(|(name, values)| AttributeChange {
            attribute: name.clone(),
            old: Vec::new(),
            new: values.clone(),
        })
        .collect()
}

fn removal_changes(snap: &EntrySnapshot) -> Vec<AttributeChange> {
    snap.attributes
        .iter()
        .map(|(name, values)| AttributeChange {
            attribute: name.clone(),
            old: values.clone(),
            new: Vec::new(),
        })
        .collect()
}
