// src/rules/matcher.rs

//! Pure event-to-rule matching.

use std::sync::Arc;

use crate::diff::{ChangeEvent, ChangeKind, DN_MOVE_ATTR};
use crate::directory::normalize_dn;
use crate::types::SearchScope;

use super::model::{RuleSet, WatchRule};

/// A change event paired with one rule it matched. Fan-out produces one
/// `MatchedEvent` per matching rule.
#[derive(Debug, Clone)]
pub struct MatchedEvent {
    pub rule: Arc<WatchRule>,
    pub event: ChangeEvent,
}

/// Evaluate every active rule fed by `scope_key` against one event, in rule
/// definition order. All matches are emitted; order does not affect the
/// outcome.
pub fn match_event(rules: &RuleSet, scope_key: &str, event: &ChangeEvent) -> Vec<MatchedEvent> {
    rules
        .rules_for_scope(scope_key)
        .filter(|rule| rule_matches(rule, event))
        .map(|rule| MatchedEvent {
            rule: Arc::clone(rule),
            event: event.clone(),
        })
        .collect()
}

fn rule_matches(rule: &WatchRule, event: &ChangeEvent) -> bool {
    if !dn_in_scope(&normalize_dn(&event.dn), &rule.base, rule.scope) {
        return false;
    }

    match event.kind {
        ChangeKind::Added | ChangeKind::Removed => true,
        // A modification is only significant if it touches the rule's
        // watched set. A DN move is significant for every rule.
        ChangeKind::Modified => event
            .changes
            .iter()
            .any(|c| c.attribute == DN_MOVE_ATTR || rule.watched.contains(&c.attribute)),
    }
}

/// Does a normalized DN fall under a normalized base for the given scope?
fn dn_in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    if dn == base {
        return !matches!(scope, SearchScope::One);
    }

    let Some(prefix) = dn.strip_suffix(base) else {
        return false;
    };
    let Some(rdns) = prefix.strip_suffix(',') else {
        return false;
    };

    match scope {
        SearchScope::Base => false,
        // Exactly one RDN between the entry and the base.
        SearchScope::One => !rdns.contains(','),
        SearchScope::Sub => true,
    }
}
