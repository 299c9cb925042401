//! Plugin configuration
//!
//! Loaded from a YAML file (`/etc/oci/config.yaml` unless overridden via
//! `CONFIG_YAML_FILENAME`) holding the cloud auth material, the compartment
//! volumes are provisioned into, and optional initial tags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cloud::{DefinedTags, FreeformTags};
use crate::error::{Error, Result};

/// Environment variable overriding the config file location.
pub const CONFIG_YAML_FILENAME_ENV: &str = "CONFIG_YAML_FILENAME";

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/oci/config.yaml";

/// Environment variable toggling injection of the reserved system-tag
/// namespace on created resources.
pub const RESOURCE_ATTRIBUTION_ENV: &str = "CPO_ENABLE_RESOURCE_ATTRIBUTION";

/// Cloud auth material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub tenancy: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub key_file: Option<String>,
    /// Use the instance-principal identity instead of user keys.
    #[serde(default)]
    pub use_instance_principals: bool,
}

/// Tags applied to every resource the plugin creates, merged under any
/// per-volume overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialTags {
    #[serde(default)]
    pub freeform: FreeformTags,
    #[serde(default)]
    pub defined: DefinedTags,
}

/// Top-level plugin configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    /// Compartment volumes and backups are provisioned into.
    #[serde(default)]
    pub compartment: String,
    #[serde(default)]
    pub tags: Option<InitialTags>,
}

impl Config {
    /// Resolves the config path from the environment.
    pub fn path() -> PathBuf {
        std::env::var(CONFIG_YAML_FILENAME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), err))
        })?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.compartment.is_empty() {
            return Err(Error::Configuration(
                "compartment must be set in the config file".to_string(),
            ));
        }
        Ok(())
    }
}

/// True when resource-attribution system tags should be injected.
pub fn resource_attribution_enabled() -> bool {
    std::env::var(RESOURCE_ATTRIBUTION_ENV)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
auth:
  region: us-ashburn-1
  use_instance_principals: true
compartment: ocid1.compartment.oc1..aaaa
tags:
  freeform:
    owner: storage-team
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.auth.region, "us-ashburn-1");
        assert!(config.auth.use_instance_principals);
        assert_eq!(config.compartment, "ocid1.compartment.oc1..aaaa");
        assert_eq!(
            config
                .tags
                .unwrap()
                .freeform
                .get("owner")
                .map(String::as_str),
            Some("storage-team")
        );
    }

    #[test]
    fn test_missing_compartment_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "auth:\n  region: us-ashburn-1\n").unwrap();
        assert_matches!(Config::load(&path), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            Config::load(Path::new("/nonexistent/config.yaml")),
            Err(Error::Configuration(_))
        );
    }
}
