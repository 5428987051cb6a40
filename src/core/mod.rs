pub mod bip44;
pub mod config;
pub mod errors;

pub use config::HardwareWalletConfig;
pub use errors::WalletError;
