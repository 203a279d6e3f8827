//! Configuration file loading.
//!
//! ```toml
//! [agent]
//! pubkey = "<64 hex chars>"
//!
//! [engine]
//! relays = ["wss://relay.damus.io", "wss://nos.lol"]
//!
//! [engine.rate_limit.inbound_per_relay]
//! rate_per_hour = 100
//! burst = 100
//! ```

use anyhow::{Context, Result, bail};
use nostr_client::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "dandelions.toml";

/// Comma separated relay list that replaces the configured one.
pub const RELAYS_ENV: &str = "DANDELIONS_RELAYS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hex pubkey of the agent. Events mentioning it are handled, events
    /// authored by it are ignored.
    pub pubkey: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] if it exists, or fall
    /// back to defaults. Environment overrides are applied and the result is
    /// validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_relay_override(std::env::var(RELAYS_ENV).ok().as_deref());
        config.finish()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Replace the relay list with a comma separated override, if non-empty.
    pub fn apply_relay_override(&mut self, relays: Option<&str>) {
        let Some(relays) = relays else {
            return;
        };
        let relays: Vec<String> = relays
            .split(',')
            .map(str::trim)
            .filter(|relay| !relay.is_empty())
            .map(str::to_string)
            .collect();
        if !relays.is_empty() {
            self.engine.relays = relays;
        }
    }

    /// Check the agent key and the engine config, and make sure the agent
    /// never answers itself.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(pubkey) = &self.agent.pubkey {
            if pubkey.len() != 64 || !pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("agent.pubkey must be 64 hex characters");
            }
            let pubkey = pubkey.to_lowercase();
            if !self.engine.dispatch.ignore_authors.contains(&pubkey) {
                self.engine.dispatch.ignore_authors.push(pubkey.clone());
            }
            self.agent.pubkey = Some(pubkey);
        }

        self.engine.validate().context("invalid engine configuration")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const PUBKEY: &str = "b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0";

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[agent]
pubkey = "{PUBKEY}"

[engine]
relays = ["wss://one.test", "wss://two.test"]

[engine.publish]
max_attempts = 2
"#
        )
        .unwrap();

        let mut config = AppConfig::from_file(file.path()).unwrap();
        config.finish().unwrap();

        assert_eq!(config.engine.relays, vec!["wss://one.test", "wss://two.test"]);
        assert_eq!(config.engine.publish.max_attempts, 2);
        // Untouched sections keep their defaults
        assert_eq!(config.engine.dedup.capacity, 10_000);
        assert_eq!(config.engine.dispatch.ignore_authors, vec![PUBKEY.to_string()]);
    }

    #[test]
    fn test_example_file_parses() {
        let mut config: AppConfig =
            toml::from_str(include_str!("../dandelions.example.toml")).unwrap();
        config.finish().unwrap();
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_relay_override() {
        let mut config = AppConfig::default();
        config.apply_relay_override(Some(" wss://a.test , wss://b.test,,"));
        assert_eq!(config.engine.relays, vec!["wss://a.test", "wss://b.test"]);

        config.apply_relay_override(Some(" , "));
        assert_eq!(config.engine.relays.len(), 2);
        config.apply_relay_override(None);
        assert_eq!(config.engine.relays.len(), 2);
    }

    #[test]
    fn test_rejects_bad_pubkey_and_relays() {
        let mut config = AppConfig::default();
        config.agent.pubkey = Some("npub1xyz".to_string());
        assert!(config.finish().is_err());

        let mut config = AppConfig::default();
        config.engine.relays = vec!["https://not-a-relay.test".to_string()];
        assert!(config.finish().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
