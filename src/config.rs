use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HomeguardConfig {
    pub alarm: AlarmConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AlarmConfig {
    /// Credential expected from authenticators during an intrusion
    #[serde(default = "default_credential")]
    pub credential: String,

    /// Maximum authentication window, duration string (e.g. "30s", "5m")
    #[serde(default = "default_max_auth_time")]
    pub max_auth_time: String,

    /// Retry budget per authentication session
    #[serde(default = "default_max_auth_tries")]
    pub max_auth_tries: u32,

    /// Path of the persisted alarm state file
    #[serde(default = "default_data_file")]
    pub data_file: String,
}

impl HomeguardConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("homeguard.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("alarm.credential", default_credential())?
            .set_default("alarm.max_auth_time", default_max_auth_time())?
            .set_default("alarm.max_auth_tries", default_max_auth_tries())?
            .set_default("alarm.data_file", default_data_file())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with HOMEGUARD_ prefix
            .add_source(Environment::with_prefix("HOMEGUARD").separator("_"))
            .build()?;

        let config: HomeguardConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alarm.credential.is_empty() {
            return Err(ConfigError::Message(
                "Alarm credential must be set".to_string(),
            ));
        }

        if self.alarm.max_auth_tries == 0 {
            return Err(ConfigError::Message(
                "Alarm max_auth_tries must be greater than 0".to_string(),
            ));
        }

        if crate::duration::parse_duration(&self.alarm.max_auth_time).is_err() {
            return Err(ConfigError::Message(format!(
                "Alarm max_auth_time {:?} is not a valid duration",
                self.alarm.max_auth_time
            )));
        }

        if self.alarm.data_file.is_empty() {
            return Err(ConfigError::Message(
                "Alarm data_file must be set".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for HomeguardConfig {
    fn default() -> Self {
        Self {
            alarm: AlarmConfig {
                credential: default_credential(),
                max_auth_time: default_max_auth_time(),
                max_auth_tries: default_max_auth_tries(),
                data_file: default_data_file(),
            },
        }
    }
}

// Default value functions
fn default_credential() -> String {
    String::new()
}
fn default_max_auth_time() -> String {
    "30s".to_string()
}
fn default_max_auth_tries() -> u32 {
    3
}
fn default_data_file() -> String {
    "homeguard_state.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_requires_a_credential() {
        let mut config = HomeguardConfig::default();

        // The shipped defaults deliberately leave the credential unset
        assert!(config.validate().is_err());

        config.alarm.credential = "1234".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = HomeguardConfig::default();
        config.alarm.credential = "1234".to_string();

        config.alarm.max_auth_tries = 0;
        assert!(config.validate().is_err());
        config.alarm.max_auth_tries = 3;

        config.alarm.max_auth_time = "half an hour".to_string();
        assert!(config.validate().is_err());
        config.alarm.max_auth_time = "5m".to_string();

        config.alarm.data_file = String::new();
        assert!(config.validate().is_err());
        config.alarm.data_file = "homeguard_state.json".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = HomeguardConfig::load_from_file("/nonexistent/homeguard.toml").unwrap();
        assert_eq!(config.alarm.max_auth_time, "30s");
        assert_eq!(config.alarm.max_auth_tries, 3);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("homeguard.toml");
        std::fs::write(
            &path,
            "[alarm]\ncredential = \"9876\"\nmax_auth_time = \"2m\"\n",
        )
        .unwrap();

        let config = HomeguardConfig::load_from_file(&path).unwrap();
        assert_eq!(config.alarm.credential, "9876");
        assert_eq!(config.alarm.max_auth_time, "2m");
        assert_eq!(config.alarm.max_auth_tries, 3);
        assert!(config.validate().is_ok());
    }
}
