//! Process-wide configuration.
//!
//! A [`Config`] is built once at startup and passed to the constructors that
//! need it; nothing in the crate reads the environment on its own.

use crate::record::PrimaryKeyFormat;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Environment variable holding the base encryption key.
pub const ENV_KEY: &str = "DB_ENCRYPT_KEY";
/// Environment variable selecting the primary key format (`int` or `uuid`).
pub const ENV_PRIMARY_KEY_FORMAT: &str = "DB_ENCRYPT_DB_PRIMARY_KEY_FORMAT";
/// Environment variable holding the log verbosity (0-3).
pub const ENV_LOG_LEVEL: &str = "DB_ENCRYPT_LOG_LEVEL";
/// Environment variable holding the log indicator.
pub const ENV_LOG_INDICATOR: &str = "DB_ENCRYPT_LOG_INDICATOR";

const DEFAULT_INDICATOR: &str = "db-encrypt";

/// Configuration value object.
///
/// # Example
///
/// ```
/// use dbcrypt::config::Config;
/// use dbcrypt::record::PrimaryKeyFormat;
///
/// let config = Config::from_lookup(|name| match name {
///     "DB_ENCRYPT_KEY" => Some("base64-secret".to_string()),
///     "DB_ENCRYPT_DB_PRIMARY_KEY_FORMAT" => Some("uuid".to_string()),
///     _ => None,
/// });
/// assert!(config.has_key());
/// assert_eq!(config.primary_key_format, PrimaryKeyFormat::Uuid);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base encryption key. Every cipher operation fails without it.
    #[serde(default)]
    pub key: Option<SecretString>,

    /// Format of host primary keys, fixed for the whole side table.
    #[serde(default)]
    pub primary_key_format: PrimaryKeyFormat,

    /// Verbosity: 0 = none, 1 = high-level, 2 = mid-level, 3 = everything.
    #[serde(default)]
    pub log_level: u8,

    /// Prefix recorded on log lines for filtering.
    #[serde(default = "default_indicator")]
    pub log_indicator: String,
}

fn default_indicator() -> String {
    DEFAULT_INDICATOR.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key: None,
            primary_key_format: PrimaryKeyFormat::default(),
            log_level: 0,
            log_indicator: default_indicator(),
        }
    }
}

impl Config {
    /// Reads configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through an arbitrary variable lookup.
    ///
    /// Unparseable values fall back to their defaults. The key is kept
    /// verbatim; a blank key counts as no key.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = lookup(ENV_KEY).filter(|k| !k.trim().is_empty()).map(SecretString::new);

        let primary_key_format = lookup(ENV_PRIMARY_KEY_FORMAT)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        let log_level =
            lookup(ENV_LOG_LEVEL).and_then(|v| v.trim().parse::<u8>().ok()).unwrap_or(0).min(3);

        let log_indicator = lookup(ENV_LOG_INDICATOR)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(default_indicator);

        Self { key, primary_key_format, log_level, log_indicator }
    }

    /// Returns true if a non-blank base key is configured.
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.key.as_ref().is_some_and(|k| !k.expose_secret().trim().is_empty())
    }

    /// Maps `log_level` to a `tracing` filter directive.
    #[must_use]
    pub const fn log_directive(&self) -> &'static str {
        match self.log_level {
            0 => "off",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherEngine;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = Config::from_lookup(|_| None);
        assert!(!config.has_key());
        assert_eq!(config.primary_key_format, PrimaryKeyFormat::Int);
        assert_eq!(config.log_level, 0);
        assert_eq!(config.log_indicator, "db-encrypt");
        assert_eq!(config.log_directive(), "off");
    }

    #[test]
    fn test_blank_key_is_not_configured() {
        let config = Config::from_lookup(lookup_from(&[(ENV_KEY, "   ")]));
        assert!(!config.has_key());
    }

    #[test]
    fn test_key_is_not_trimmed() {
        let config = Config::from_lookup(lookup_from(&[(ENV_KEY, " padded-key\t")]));
        assert_eq!(config.key.as_ref().map(|k| k.expose_secret().as_str()), Some(" padded-key\t"));

        let padded = CipherEngine::from_config(&config);
        let trimmed = CipherEngine::new("padded-key");
        let envelope = padded.encrypt(Some("123-45-6789"), None).unwrap();
        assert_eq!(padded.decrypt(Some(&envelope), None).unwrap(), "123-45-6789");
        assert!(!trimmed.verify("123-45-6789", &envelope));
    }

    #[test]
    fn test_reads_all_variables() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_KEY, "secret"),
            (ENV_PRIMARY_KEY_FORMAT, "uuid"),
            (ENV_LOG_LEVEL, "2"),
            (ENV_LOG_INDICATOR, "crypt"),
        ]));
        assert_eq!(config.key.as_ref().map(|k| k.expose_secret().as_str()), Some("secret"));
        assert_eq!(config.primary_key_format, PrimaryKeyFormat::Uuid);
        assert_eq!(config.log_directive(), "debug");
        assert_eq!(config.log_indicator, "crypt");
    }

    #[test]
    fn test_log_level_is_clamped() {
        let config = Config::from_lookup(lookup_from(&[(ENV_LOG_LEVEL, "9")]));
        assert_eq!(config.log_level, 3);
        assert_eq!(config.log_directive(), "trace");
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: Config =
            serde_json::from_str(r#"{"key":"abc","primary_key_format":"uuid"}"#).unwrap();
        assert!(config.has_key());
        assert_eq!(config.primary_key_format, PrimaryKeyFormat::Uuid);
        assert_eq!(config.log_indicator, "db-encrypt");
    }
}
