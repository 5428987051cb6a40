// src/lib.rs

pub mod core;

// Hardware wallet support modules
pub mod hardware;

pub use crate::core::{HardwareWalletConfig, WalletError};
pub use hardware::{DeviceInfo, HardwareWallet, HardwareWalletManager, HardwareWalletType, SignedTransaction};
