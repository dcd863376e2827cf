use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// LDAP search scope for a watch rule.
///
/// - `Base`: the base entry only.
/// - `One`: direct children of the base.
/// - `Sub`: the base and its whole subtree (default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    Base,
    One,
    Sub,
}

impl Default for SearchScope {
    fn default() -> Self {
        SearchScope::Sub
    }
}

impl SearchScope {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchScope::Base => "base",
            SearchScope::One => "one",
            SearchScope::Sub => "sub",
        }
    }
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "base" => Ok(SearchScope::Base),
            "one" | "onelevel" => Ok(SearchScope::One),
            "sub" | "subtree" => Ok(SearchScope::Sub),
            other => Err(format!(
                "invalid scope: {other} (expected \"base\", \"one\" or \"sub\")"
            )),
        }
    }
}

/// Canonical rule name type used throughout the pipeline.
pub type RuleName = String;

/// Unit of mutual exclusion for executions; defaults to the rule name.
pub type ConcurrencyKey = String;
