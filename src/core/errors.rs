use std::fmt::Display;

/// Error type for hardware wallet operations.
///
/// Every variant carries a human readable message. Context added on the way
/// up (device id, derivation path, operation) is prepended to that message and
/// never changes the variant, so callers can match on the kind no matter how
/// deep the failure originated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    /// The derivation path does not follow `m/44'/coin'/account'/change/index`.
    #[error("Invalid derivation path: {0}")]
    InvalidDerivationPath(String),
    /// The device is not in the registry or its handle is no longer live.
    #[error("Device not connected: {0}")]
    NotConnected(String),
    /// No backend is registered or enabled for the requested vendor.
    #[error("Unsupported wallet type: {0}")]
    UnsupportedWalletType(String),
    /// The transport could not be opened or the handshake failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// `connection_timeout` elapsed before the device answered.
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),
    /// `signing_timeout` elapsed while waiting for the device.
    #[error("Signing timeout: {0}")]
    SigningTimeout(String),
    /// Device I/O failed or the device answered with something unexpected.
    #[error("Transport error: {0}")]
    TransportError(String),
    /// The operator refused the request on the device.
    #[error("Rejected on device: {0}")]
    UserRejected(String),
    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl WalletError {
    /// Prefix the message with `ctx`, keeping the variant.
    pub fn context(self, ctx: impl Display) -> Self {
        let wrap = |msg: String| format!("{}: {}", ctx, msg);
        match self {
            WalletError::InvalidDerivationPath(m) => WalletError::InvalidDerivationPath(wrap(m)),
            WalletError::NotConnected(m) => WalletError::NotConnected(wrap(m)),
            WalletError::UnsupportedWalletType(m) => WalletError::UnsupportedWalletType(wrap(m)),
            WalletError::ConnectionFailed(m) => WalletError::ConnectionFailed(wrap(m)),
            WalletError::ConnectionTimeout(m) => WalletError::ConnectionTimeout(wrap(m)),
            WalletError::SigningTimeout(m) => WalletError::SigningTimeout(wrap(m)),
            WalletError::TransportError(m) => WalletError::TransportError(wrap(m)),
            WalletError::UserRejected(m) => WalletError::UserRejected(wrap(m)),
            WalletError::ConfigError(m) => WalletError::ConfigError(wrap(m)),
        }
    }
}

impl From<toml::de::Error> for WalletError {
    fn from(err: toml::de::Error) -> Self {
        WalletError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_not_connected() {
        let err = WalletError::NotConnected("dev1".to_string());
        assert_eq!(format!("{}", err), "Device not connected: dev1");
    }

    #[test]
    fn test_context_keeps_variant() {
        let err = WalletError::TransportError("short response".to_string())
            .context("get_address m/44'/60'/0'/0/0")
            .context("device dev1");
        match err {
            WalletError::TransportError(msg) => {
                assert_eq!(msg, "device dev1: get_address m/44'/60'/0'/0/0: short response")
            }
            other => panic!("Expected TransportError, got {:?}", other),
        }
    }
}
