// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile, RuleConfig};
use crate::errors::{LdapwatchError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::LdapwatchError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.daemon, raw.directory, raw.rule))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_rules(cfg)?;
    validate_daemon(cfg)?;
    validate_directory(cfg)?;
    for (name, rule) in cfg.rule.iter() {
        validate_rule(name, rule)?;
    }
    Ok(())
}

fn ensure_has_rules(cfg: &RawConfigFile) -> Result<()> {
    if cfg.rule.is_empty() {
        return Err(LdapwatchError::ConfigError(
            "config must contain at least one [rule.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_daemon(cfg: &RawConfigFile) -> Result<()> {
    if cfg.daemon.poll_interval_seconds == 0 {
        return Err(LdapwatchError::ConfigError(
            "[daemon].poll_interval_seconds must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.daemon.max_concurrent_executions == 0 {
        return Err(LdapwatchError::ConfigError(
            "[daemon].max_concurrent_executions must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.daemon.runner_command.trim().is_empty() {
        return Err(LdapwatchError::ConfigError(
            "[daemon].runner_command must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_directory(cfg: &RawConfigFile) -> Result<()> {
    let url = cfg.directory.url.trim();
    if !(url.starts_with("ldap://") || url.starts_with("ldaps://")) {
        return Err(LdapwatchError::ConfigError(format!(
            "[directory].url must start with ldap:// or ldaps:// (got '{}')",
            cfg.directory.url
        )));
    }
    if cfg.directory.max_auth_failures == 0 {
        return Err(LdapwatchError::ConfigError(
            "[directory].max_auth_failures must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_rule(name: &str, rule: &RuleConfig) -> Result<()> {
    if rule.base.trim().is_empty() {
        return Err(LdapwatchError::ConfigError(format!(
            "rule '{}' has an empty `base`",
            name
        )));
    }
    if rule.watched_attributes.is_empty() {
        return Err(LdapwatchError::ConfigError(format!(
            "rule '{}' must list at least one watched attribute",
            name
        )));
    }
    if rule.watched_attributes.iter().any(|a| a.trim().is_empty()) {
        return Err(LdapwatchError::ConfigError(format!(
            "rule '{}' has an empty entry in `watched_attributes`",
            name
        )));
    }
    if rule.playbook.as_os_str().is_empty() {
        return Err(LdapwatchError::ConfigError(format!(
            "rule '{}' has an empty `playbook`",
            name
        )));
    }
    if rule.timeout_seconds == 0 {
        return Err(LdapwatchError::ConfigError(format!(
            "rule '{}': `timeout_seconds` must be >= 1 (got 0)",
            name
        )));
    }
    if let Some(key) = &rule.concurrency_key {
        if key.trim().is_empty() {
            return Err(LdapwatchError::ConfigError(format!(
                "rule '{}' has an empty `concurrency_key`",
                name
            )));
        }
    }
    if let Some(max_agg) = rule.max_aggregation_seconds {
        if max_agg < rule.debounce_seconds {
            return Err(LdapwatchError::ConfigError(format!(
                "rule '{}': `max_aggregation_seconds` ({}) must be >= `debounce_seconds` ({})",
                name, max_agg, rule.debounce_seconds
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_str).expect("toml should deserialize");
        ConfigFile::try_from(raw)
    }

    const MINIMAL: &str = r#"
        [directory]
        url = "ldap://localhost:389"
        bind_dn = "cn=admin,dc=example,dc=org"
        bind_password = "secret"

        [rule.groups]
        base = "ou=groups,dc=example,dc=org"
        watched_attributes = ["memberUid"]
        playbook = "/etc/ldapwatchd.d/groups.yml"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = parse(MINIMAL).expect("minimal config should validate");

        assert_eq!(cfg.daemon.poll_interval_seconds, 30);
        assert_eq!(cfg.daemon.max_concurrent_executions, 4);
        assert_eq!(cfg.daemon.runner_command, "ansible-playbook");

        let rule = &cfg.rule["groups"];
        assert_eq!(rule.filter, "(objectClass=*)");
        assert_eq!(rule.debounce_seconds, 5);
        assert_eq!(rule.max_retries, 2);
        assert_eq!(rule.backoff_base_seconds, 1);
        assert_eq!(rule.timeout_seconds, 600);
        assert!(rule.inventory.is_none());
    }

    #[test]
    fn config_without_rules_is_rejected() {
        let err = parse(
            r#"
            [directory]
            url = "ldap://localhost"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, LdapwatchError::ConfigError(_)));
    }

    #[test]
    fn bad_directory_url_is_rejected() {
        let bad = MINIMAL.replace("ldap://localhost:389", "http://localhost");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn empty_watched_attributes_is_rejected() {
        let bad = MINIMAL.replace(r#"["memberUid"]"#, "[]");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let bad = format!("[daemon]\npoll_interval_seconds = 0\n{MINIMAL}");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn max_aggregation_below_debounce_is_rejected() {
        let bad = format!("{MINIMAL}\nmax_aggregation_seconds = 2\ndebounce_seconds = 10\n");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn full_rule_options_parse() {
        let cfg = parse(
            r#"
            [daemon]
            poll_interval_seconds = 10
            max_concurrent_executions = 2
            runner_command = "/usr/bin/ansible-playbook"

            [directory]
            url = "ldaps://ldap.example.org:636"
            bind_dn = "cn=watcher,dc=example,dc=org"
            bind_password_file = "/etc/ldapwatchd.secret"
            max_auth_failures = 5

            [rule.hosts]
            base = "ou=hosts,dc=example,dc=org"
            scope = "one"
            filter = "(objectClass=ipHost)"
            watched_attributes = ["ipHostNumber", "cn"]
            playbook = "/etc/ldapwatchd.d/hosts.yml"
            inventory = "/etc/ldapwatchd.d/inventory"
            extra_vars = "/etc/ldapwatchd.d/extra.yml"
            vault_file = "/etc/ldapwatchd.d/vault/secret.yml"
            debounce_seconds = 3
            max_aggregation_seconds = 60
            concurrency_key = "dns"
            max_retries = 4
            backoff_base_seconds = 2
            timeout_seconds = 120
            "#,
        )
        .expect("full config should validate");

        let rule = &cfg.rule["hosts"];
        assert_eq!(rule.scope, crate::types::SearchScope::One);
        assert_eq!(rule.concurrency_key.as_deref(), Some("dns"));
        assert_eq!(rule.max_aggregation_seconds, Some(60));
        assert_eq!(cfg.directory.max_auth_failures, 5);
    }
}
