use crate::core::bip44::validate_derivation_path;
use crate::core::errors::WalletError;
use crate::hardware::types::HardwareWalletType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Configuration file used when `CONFIG_PATH` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "hwwallet.toml";

/// Hardware wallet configuration
///
/// Built once at startup and shared read-only by the manager and every wallet.
/// `auto_reconnect` and `max_retries` are accepted for compatibility with
/// existing configuration files but nothing acts on them: connect and sign
/// failures are always surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareWalletConfig {
    /// Vendors the manager will discover and connect
    pub enabled_wallets: Vec<HardwareWalletType>,

    /// Deadline for transport connect plus handshake (seconds)
    #[serde(default = "HardwareWalletConfig::default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Deadline for a signing request, including on-device confirmation (seconds)
    #[serde(default = "HardwareWalletConfig::default_signing_timeout")]
    pub signing_timeout_secs: u64,

    pub auto_reconnect: bool,

    #[serde(default = "HardwareWalletConfig::default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "HardwareWalletConfig::default_derivation_path")]
    pub default_derivation_path: String,
}

impl HardwareWalletConfig {
    fn default_connection_timeout() -> u64 { 30 }
    fn default_signing_timeout() -> u64 { 120 }
    fn default_max_retries() -> u32 { 3 }
    fn default_derivation_path() -> String { "m/44'/60'/0'/0/0".to_string() }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.signing_timeout_secs)
    }

    /// Per-read deadline for blocking device transports. Outlasts both
    /// manager deadlines, so a pending confirmation ends as `SigningTimeout`.
    pub fn device_read_timeout(&self) -> Duration {
        self.connection_timeout() + self.signing_timeout()
    }

    pub fn is_enabled(&self, wallet_type: HardwareWalletType) -> bool {
        self.enabled_wallets.contains(&wallet_type)
    }

    /// Parse a TOML document. Missing keys fall back to their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, WalletError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WalletError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `CONFIG_PATH` (or `hwwallet.toml`), falling back to defaults
    /// when the file is missing.
    pub fn load_from_env() -> Result<Self, WalletError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        if !Path::new(&path).exists() {
            tracing::warn!("Config file {} not found, using default configuration", path);
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.connection_timeout_secs == 0 {
            return Err(WalletError::ConfigError(
                "connection_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.signing_timeout_secs == 0 {
            return Err(WalletError::ConfigError(
                "signing_timeout_secs must be greater than zero".to_string(),
            ));
        }
        validate_derivation_path(&self.default_derivation_path)
            .map_err(|e| WalletError::ConfigError(format!("default_derivation_path: {}", e)))?;
        Ok(())
    }
}

impl Default for HardwareWalletConfig {
    fn default() -> Self {
        Self {
            enabled_wallets: vec![HardwareWalletType::Ledger, HardwareWalletType::Trezor],
            connection_timeout_secs: Self::default_connection_timeout(),
            signing_timeout_secs: Self::default_signing_timeout(),
            auto_reconnect: false,
            max_retries: Self::default_max_retries(),
            default_derivation_path: Self::default_derivation_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HardwareWalletConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.signing_timeout(), Duration::from_secs(120));
        assert!(config.is_enabled(HardwareWalletType::Ledger));
        assert!(config.is_enabled(HardwareWalletType::Trezor));
    }

    #[test]
    fn test_device_read_timeout_covers_signing() {
        let config = HardwareWalletConfig::default();
        assert!(config.device_read_timeout() > config.signing_timeout());
        assert!(config.device_read_timeout() > config.connection_timeout());

        let config = HardwareWalletConfig {
            connection_timeout_secs: 45,
            signing_timeout_secs: 10,
            ..Default::default()
        };
        assert_eq!(config.device_read_timeout(), Duration::from_secs(55));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = HardwareWalletConfig::from_toml_str(
            r#"
            enabled_wallets = ["ledger"]
            signing_timeout_secs = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.enabled_wallets, vec![HardwareWalletType::Ledger]);
        assert_eq!(config.signing_timeout_secs, 45);
        assert_eq!(config.connection_timeout_secs, 30);
        assert_eq!(config.default_derivation_path, "m/44'/60'/0'/0/0");
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = HardwareWalletConfig::from_toml_str("connection_timeout_secs = 0").unwrap_err();
        assert!(matches!(err, WalletError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_bad_default_path() {
        let err = HardwareWalletConfig::from_toml_str(r#"default_derivation_path = "m/0/1""#)
            .unwrap_err();
        assert!(matches!(err, WalletError::ConfigError(msg) if msg.contains("default_derivation_path")));
    }

    #[test]
    fn test_rejects_unknown_vendor() {
        let err = HardwareWalletConfig::from_toml_str(r#"enabled_wallets = ["keystone"]"#)
            .unwrap_err();
        assert!(matches!(err, WalletError::ConfigError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "enabled_wallets = [\"trezor\"]").unwrap();
        writeln!(file, "auto_reconnect = true").unwrap();
        writeln!(file, "max_retries = 5").unwrap();

        let config = HardwareWalletConfig::load(file.path()).unwrap();
        assert_eq!(config.enabled_wallets, vec![HardwareWalletType::Trezor]);
        assert!(config.auto_reconnect);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = HardwareWalletConfig {
            signing_timeout_secs: 10,
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(HardwareWalletConfig::from_toml_str(&text).unwrap(), config);
    }
}
