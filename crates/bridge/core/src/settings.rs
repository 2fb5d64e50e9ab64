//! Bridge configuration
//!
//! The layout mirrors the XFS registry: logical services name a provider,
//! providers carry the reader settings.
//!
//! ```toml
//! [logical_services.IDC30]
//! provider = "pcsc"
//!
//! [service_providers.pcsc]
//! reader_name = "ACS ACR39U ICC Reader 00 00"
//! exclusive = false
//!
//! [service_providers.pcsc.workarounds]
//! correct_chip_io = true
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SettingsError;
use crate::resource::ShareMode;

/// Prefix of environment variables overriding the configuration file
pub const ENV_PREFIX: &str = "XFS_BRIDGE_";

/// Whole bridge configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Logical services by name
    pub logical_services: BTreeMap<String, LogicalService>,
    /// Service providers by name
    pub service_providers: BTreeMap<String, ProviderConfig>,
}

/// A logical service entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalService {
    /// Provider implementing the service
    pub provider: String,
}

/// Settings of one service provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Reader to bind to; the first reader a card is inserted into if unset
    pub reader_name: Option<String>,
    /// Trace level
    pub trace_level: u32,
    /// Connect to cards exclusively
    pub exclusive: bool,
    /// Client compatibility switches
    pub workarounds: Workarounds,
}

/// Client compatibility switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workarounds {
    /// Drop the trailing Le byte that some clients append to T=0 case 3 APDUs
    pub correct_chip_io: bool,
    /// Report eject as successful although the reader cannot eject
    pub can_eject: bool,
}

impl BridgeConfig {
    /// Figment reading `path` and environment overrides.
    ///
    /// Nested keys in the environment are separated by `__`, e.g.
    /// `XFS_BRIDGE_SERVICE_PROVIDERS__PCSC__EXCLUSIVE=true`.
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load the configuration from `path` and the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let config: Self = Self::figment(path).extract()?;
        debug!(
            services = config.logical_services.len(),
            providers = config.service_providers.len(),
            "Configuration loaded"
        );
        Ok(config)
    }
}

/// Resolved settings of an open service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Logical service name the service was opened with
    pub logical_name: String,
    /// Provider name, fixed at open
    pub provider_name: String,
    /// Reader to bind to
    pub reader_name: Option<String>,
    /// Trace level
    pub trace_level: u32,
    /// Connect to cards exclusively
    pub exclusive: bool,
    /// Client compatibility switches
    pub workarounds: Workarounds,
}

impl Settings {
    /// Resolve the settings of `logical_name`
    pub fn resolve(config: &BridgeConfig, logical_name: &str) -> Result<Self, SettingsError> {
        let service = config
            .logical_services
            .get(logical_name)
            .ok_or_else(|| SettingsError::UnknownLogicalService(logical_name.to_owned()))?;

        let mut settings = Self {
            logical_name: logical_name.to_owned(),
            provider_name: service.provider.clone(),
            reader_name: None,
            trace_level: 0,
            exclusive: false,
            workarounds: Workarounds::default(),
        };
        settings.reread(config);
        Ok(settings)
    }

    /// Refresh everything except the provider name
    pub fn reread(&mut self, config: &BridgeConfig) {
        let provider = config
            .service_providers
            .get(&self.provider_name)
            .cloned()
            .unwrap_or_default();

        self.reader_name = provider.reader_name.filter(|name| !name.is_empty());
        self.trace_level = provider.trace_level;
        self.exclusive = provider.exclusive;
        self.workarounds = provider.workarounds;
        debug!(settings = ?self, "Settings read");
    }

    /// Share mode used for card connections
    pub const fn share_mode(&self) -> ShareMode {
        if self.exclusive {
            ShareMode::Exclusive
        } else {
            ShareMode::Shared
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const CONFIG: &str = r#"
        [logical_services.IDC30]
        provider = "pcsc"

        [logical_services.Orphan]
        provider = "missing"

        [service_providers.pcsc]
        reader_name = "ACS ACR39U ICC Reader 00 00"
        trace_level = 3
        exclusive = true

        [service_providers.pcsc.workarounds]
        correct_chip_io = true
    "#;

    #[test]
    fn test_resolve_from_file() {
        Jail::expect_with(|jail| {
            jail.create_file("bridge.toml", CONFIG)?;
            let config = BridgeConfig::load("bridge.toml").map_err(|e| e.to_string())?;

            let settings = Settings::resolve(&config, "IDC30").map_err(|e| e.to_string())?;
            assert_eq!(settings.provider_name, "pcsc");
            assert_eq!(
                settings.reader_name.as_deref(),
                Some("ACS ACR39U ICC Reader 00 00")
            );
            assert_eq!(settings.trace_level, 3);
            assert_eq!(settings.share_mode(), ShareMode::Exclusive);
            assert!(settings.workarounds.correct_chip_io);
            assert!(!settings.workarounds.can_eject);
            Ok(())
        });
    }

    #[test]
    fn test_missing_provider_uses_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("bridge.toml", CONFIG)?;
            let config = BridgeConfig::load("bridge.toml").map_err(|e| e.to_string())?;

            let settings = Settings::resolve(&config, "Orphan").map_err(|e| e.to_string())?;
            assert_eq!(settings.reader_name, None);
            assert_eq!(settings.share_mode(), ShareMode::Shared);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("bridge.toml", CONFIG)?;
            jail.set_env("XFS_BRIDGE_SERVICE_PROVIDERS__PCSC__EXCLUSIVE", "false");
            jail.set_env("XFS_BRIDGE_SERVICE_PROVIDERS__PCSC__WORKAROUNDS__CAN_EJECT", "true");

            let config = BridgeConfig::load("bridge.toml").map_err(|e| e.to_string())?;
            let settings = Settings::resolve(&config, "IDC30").map_err(|e| e.to_string())?;
            assert!(!settings.exclusive);
            assert!(settings.workarounds.can_eject);
            Ok(())
        });
    }

    #[test]
    fn test_unknown_logical_service() {
        let err = Settings::resolve(&BridgeConfig::default(), "IDC99").unwrap_err();
        assert!(matches!(err, SettingsError::UnknownLogicalService(name) if name == "IDC99"));
    }

    #[test]
    fn test_reread_keeps_provider() {
        let mut config = BridgeConfig::default();
        config.logical_services.insert(
            "IDC30".into(),
            LogicalService {
                provider: "pcsc".into(),
            },
        );
        let mut settings = Settings::resolve(&config, "IDC30").unwrap();
        assert_eq!(settings.reader_name, None);

        config.service_providers.insert(
            "pcsc".into(),
            ProviderConfig {
                reader_name: Some("Reader A".into()),
                ..ProviderConfig::default()
            },
        );
        settings.reread(&config);
        assert_eq!(settings.provider_name, "pcsc");
        assert_eq!(settings.reader_name.as_deref(), Some("Reader A"));
    }
}
