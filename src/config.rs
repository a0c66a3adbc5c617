use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BrokerError, Result};
use crate::mqtt::{PROTOCOL_LEVEL, PROTOCOL_NAME};

/// When the publisher of a QoS 1 message receives its PUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckMode {
    /// After every live recipient acknowledged its copy.
    Confirmed,
    /// Right after fan-out.
    Optimistic,
}

impl Default for AckMode {
    fn default() -> Self {
        AckMode::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub dir: PathBuf,
    pub file_name: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            dir: PathBuf::from("persistence"),
            file_name: "backup.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub protocol_name: String,
    pub protocol_level: u8,
    /// Length of the client id assigned to clients connecting without one.
    pub generated_id_length: usize,
    pub ack_mode: AckMode,
    pub allow_anonymous: bool,
    /// Username -> password, a non-empty table enables password checks.
    pub credentials: HashMap<String, String>,
    pub retain_available: bool,
    /// Journal for the offline message store, in memory only when unset.
    pub persistence: Option<PersistenceConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_level: PROTOCOL_LEVEL,
            generated_id_length: 23,
            ack_mode: AckMode::default(),
            allow_anonymous: true,
            credentials: HashMap::new(),
            retain_available: true,
            persistence: None,
        }
    }
}

impl BrokerConfig {
    pub fn from_ron(source: &str) -> Result<BrokerConfig> {
        let config: BrokerConfig =
            ron::from_str(source).map_err(|e| BrokerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<BrokerConfig> {
        let source = fs::read_to_string(path.as_ref())?;
        BrokerConfig::from_ron(&source)
    }

    pub fn to_ron(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| BrokerError::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        // a uuid v4 simple string has 32 characters
        if self.generated_id_length == 0 || self.generated_id_length > 32 {
            return Err(BrokerError::Config(format!(
                "generated_id_length must be within 1..=32, got {}",
                self.generated_id_length
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = BrokerConfig::from_ron("()").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.protocol_name, "MQTT");
        assert_eq!(config.protocol_level, 4);
        assert_eq!(config.generated_id_length, 23);
        assert_eq!(config.ack_mode, AckMode::Confirmed);
    }

    #[test]
    fn parses_overrides() {
        let config = BrokerConfig::from_ron(
            r#"(
                ack_mode: Optimistic,
                allow_anonymous: false,
                credentials: { "alice": "secret" },
                persistence: Some((dir: "/var/lib/broker", file_name: "journal.log")),
            )"#,
        )
        .unwrap();
        assert_eq!(config.ack_mode, AckMode::Optimistic);
        assert!(!config.allow_anonymous);
        assert_eq!(config.credentials["alice"], "secret");
        assert_eq!(
            config.persistence.unwrap().dir,
            PathBuf::from("/var/lib/broker")
        );
    }

    #[test]
    fn rejects_bad_id_length() {
        assert!(matches!(
            BrokerConfig::from_ron("(generated_id_length: 40)"),
            Err(BrokerError::Config(_))
        ));
        assert!(matches!(
            BrokerConfig::from_ron("(ack_mode: Sometimes)"),
            Err(BrokerError::Config(_))
        ));
    }

    #[test]
    fn round_trips_through_ron() {
        let mut config = BrokerConfig::default();
        config.persistence = Some(PersistenceConfig::default());
        let text = config.to_ron().unwrap();
        assert_eq!(BrokerConfig::from_ron(&text).unwrap(), config);
    }
}
