// src/rules/mod.rs

//! Watch rules: compiled predicates and event matching.
//!
//! Rule predicates coming from loosely-typed config are compiled once into
//! an immutable [`RuleSet`] and evaluated by pure functions; a config reload
//! builds a fresh set and swaps it atomically.

pub mod matcher;
pub mod model;

pub use matcher::{match_event, MatchedEvent};
pub use model::{AutomationTarget, RetryPolicy, RuleSet, ScopeSpec, WatchRule};
