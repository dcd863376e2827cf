//! A scripted in-memory directory for pipeline tests.
//!
//! Holds a mutable set of entries; tests mutate it between poll cycles the
//! way an administrator would mutate a live directory. The filter handling
//! is deliberately minimal: the base/scope narrowing the poller relies on,
//! a `modifyTimestamp>=` conjunction for watermark searches, and the
//! attribute-less `1.1` presence request.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ldapwatchd::directory::{normalize_dn, DirectoryClient, RawEntry};
use ldapwatchd::errors::Result;
use ldapwatchd::types::SearchScope;

#[derive(Debug, Clone, Default)]
struct FakeEntry {
    dn: String,
    attrs: HashMap<String, Vec<String>>,
}

#[derive(Clone, Default)]
pub struct ScriptedDirectory {
    entries: Arc<Mutex<BTreeMap<String, FakeEntry>>>,
}

impl ScriptedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry. Attribute names keep the given case, like
    /// a real server would return them.
    pub fn put_entry(&self, dn: &str, attrs: &[(&str, &[&str])]) {
        let entry = FakeEntry {
            dn: dn.to_string(),
            attrs: attrs
                .iter()
                .map(|(name, values)| {
                    (
                        name.to_string(),
                        values.iter().map(|v| v.to_string()).collect(),
                    )
                })
                .collect(),
        };
        self.entries
            .lock()
            .expect("directory mutex")
            .insert(normalize_dn(dn), entry);
    }

    pub fn remove_entry(&self, dn: &str) {
        self.entries
            .lock()
            .expect("directory mutex")
            .remove(&normalize_dn(dn));
    }

    pub fn set_attribute(&self, dn: &str, name: &str, values: &[&str]) {
        let mut entries = self.entries.lock().expect("directory mutex");
        if let Some(entry) = entries.get_mut(&normalize_dn(dn)) {
            entry
                .attrs
                .insert(name.to_string(), values.iter().map(|v| v.to_string()).collect());
        }
    }

    fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
        let base = normalize_dn(base);
        if dn == base {
            return !matches!(scope, SearchScope::One);
        }
        let Some(prefix) = dn.strip_suffix(&format!(",{base}")) else {
            return false;
        };
        match scope {
            SearchScope::Base => false,
            SearchScope::One => !prefix.contains(','),
            SearchScope::Sub => true,
        }
    }
}

#[async_trait]
impl DirectoryClient for ScriptedDirectory {
    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
    ) -> Result<Vec<RawEntry>> {
        let watermark = filter
            .split_once("modifyTimestamp>=")
            .map(|(_, rest)| rest.trim_end_matches([')', ' ']).to_string());
        let dn_only = attrs.len() == 1 && attrs[0] == "1.1";

        let entries = self.entries.lock().expect("directory mutex");
        let results = entries
            .iter()
            .filter(|(key, _)| Self::in_scope(key, base, scope))
            .filter(|(_, entry)| match &watermark {
                Some(wm) => entry
                    .attrs
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("modifyTimestamp"))
                    .and_then(|(_, values)| values.first())
                    .is_some_and(|ts| ts >= wm),
                None => true,
            })
            .map(|(_, entry)| RawEntry {
                dn: entry.dn.clone(),
                attrs: if dn_only {
                    HashMap::new()
                } else {
                    entry.attrs.clone()
                },
            })
            .collect();

        Ok(results)
    }
}
