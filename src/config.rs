//! Interop configuration, read from JSON

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{InteropError, Result};
use crate::il2cpp::offsets::{IL2CPP_LIBRARY, UNITY_PLAYER_LIBRARY};
use crate::version::UnityVersion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { filter: "info".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteropConfig {
    /// e.g. `2021.3.14f1`; detected from the host executable when absent
    pub unity_version: Option<String>,
    /// Library exporting the `il2cpp_*` entry points
    pub game_assembly: PathBuf,
    /// Module the icall offset table is relative to
    pub icall_module: String,
    /// Replaces the embedded icall table
    pub icall_table: Option<PathBuf>,
    /// Log every successful type registration
    pub log_registrations: bool,
    pub logging: LoggingConfig,
}

impl Default for InteropConfig {
    fn default() -> Self {
        InteropConfig {
            unity_version: None,
            game_assembly: PathBuf::from(IL2CPP_LIBRARY),
            icall_module: UNITY_PLAYER_LIBRARY.to_string(),
            icall_table: None,
            log_registrations: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl InteropConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: InteropConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// The configured version, if any
    pub fn version(&self) -> Result<Option<UnityVersion>> {
        self.unity_version.as_deref().map(UnityVersion::parse_strict).transpose()
    }

    fn validate(&self) -> Result<()> {
        if self.game_assembly.as_os_str().is_empty() {
            return Err(InteropError::Config("game_assembly must not be empty".to_string()));
        }
        if self.icall_module.is_empty() {
            return Err(InteropError::Config("icall_module must not be empty".to_string()));
        }
        self.version()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = InteropConfig::from_json_str(r#"{ "unity_version": "2021.3.14f1" }"#).unwrap();
        assert_eq!(config.version().unwrap(), Some(UnityVersion::new(2021, 3, 14)));
        assert_eq!(config.game_assembly, PathBuf::from(IL2CPP_LIBRARY));
        assert_eq!(config.icall_module, UNITY_PLAYER_LIBRARY);
        assert!(config.log_registrations);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(InteropConfig::from_json_str("{}").unwrap(), InteropConfig::default());
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "unity_version": "2019.4.40f1",
            "game_assembly": "/opt/game/GameAssembly.so",
            "icall_module": "UnityPlayer.so",
            "icall_table": "icalls.csv",
            "log_registrations": false,
            "logging": { "filter": "il2cpp_interop=trace" }
        }"#;
        let config = InteropConfig::from_json_str(json).unwrap();
        assert_eq!(config.game_assembly, PathBuf::from("/opt/game/GameAssembly.so"));
        assert_eq!(config.icall_table, Some(PathBuf::from("icalls.csv")));
        assert!(!config.log_registrations);
        assert_eq!(config.logging.filter, "il2cpp_interop=trace");
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            InteropConfig::from_json_str(r#"{ "unity_version": "unity six" }"#),
            Err(InteropError::InvalidVersion(_))
        ));
        assert!(matches!(InteropConfig::from_json_str(r#"{ "icall_module": "" }"#), Err(InteropError::Config(_))));
        assert!(matches!(InteropConfig::from_json_str("[1, 2]"), Err(InteropError::Json(_))));
        assert!(matches!(InteropConfig::from_file(Path::new("/nonexistent/interop.json")), Err(InteropError::Io(_))));
    }
}
