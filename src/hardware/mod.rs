//! Hardware wallet integration
//!
//! One capability contract ([`HardwareWallet`]) implemented per vendor on top
//! of a vendor transport, plus the [`manager::HardwareWalletManager`] registry
//! that callers go through.

pub mod backend;
pub mod ledger;
pub mod manager;
pub mod simulator;
pub mod trezor;
pub mod types;

pub use backend::{DeviceBackend, LedgerBackend, TransportProvider, TrezorBackend};
pub use manager::{HardwareWalletManager, WalletHandle};
pub use types::{DeviceInfo, HardwareWalletType, SignedTransaction};

use crate::core::bip44;
use crate::core::errors::WalletError;
use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Chains reachable through the Ethereum app on either vendor.
pub const SUPPORTED_CHAINS: [&str; 5] = ["ethereum", "polygon", "bsc", "arbitrum", "optimism"];

/// Capability contract shared by every vendor.
///
/// All operations except `connect`, `is_connected`, `validate_derivation_path`,
/// `get_supported_chains` and `wallet_type` fail with `NotConnected` on a
/// disconnected wallet before touching the transport. Operations taking a
/// derivation path validate it before any device I/O.
#[async_trait]
pub trait HardwareWallet: Send + Sync {
    async fn connect(&self) -> Result<(), WalletError>;

    async fn disconnect(&self) -> Result<(), WalletError>;

    fn is_connected(&self) -> bool;

    /// Snapshot taken at connect time.
    fn get_device_info(&self) -> Result<DeviceInfo, WalletError>;

    /// EIP-55 checksummed address for `path`.
    async fn get_address(&self, path: &str) -> Result<String, WalletError>;

    /// Sequential fan-out over [`HardwareWallet::get_address`]. The first
    /// failure aborts the batch and discards what was already fetched.
    async fn get_addresses(&self, paths: &[String]) -> Result<Vec<String>, WalletError> {
        let mut addresses = Vec::with_capacity(paths.len());
        for path in paths {
            let address = self
                .get_address(path)
                .await
                .map_err(|e| e.context(format!("address for path {}", path)))?;
            addresses.push(address);
        }
        Ok(addresses)
    }

    async fn get_public_key(&self, path: &str) -> Result<Vec<u8>, WalletError>;

    async fn sign_transaction(
        &self,
        tx: &TypedTransaction,
        path: &str,
    ) -> Result<SignedTransaction, WalletError>;

    /// EIP-191 personal message signature, 65 bytes `r || s || v`.
    async fn sign_message(&self, message: &[u8], path: &str) -> Result<Vec<u8>, WalletError>;

    /// Signs `typed_data` as a personal message.
    ///
    /// Neither vendor implementation speaks EIP-712 yet, so the signature is
    /// over the EIP-191 prefixed bytes, not over the struct hash.
    async fn sign_typed_data(&self, typed_data: &[u8], path: &str) -> Result<Vec<u8>, WalletError> {
        tracing::warn!(
            wallet = %self.wallet_type(),
            "EIP-712 not supported by device driver, signing typed data as a personal message"
        );
        self.sign_message(typed_data, path).await
    }

    fn get_supported_chains(&self) -> Vec<String> {
        SUPPORTED_CHAINS.iter().map(|c| c.to_string()).collect()
    }

    fn validate_derivation_path(&self, path: &str) -> Result<(), WalletError> {
        bip44::validate_derivation_path(path)
    }

    fn wallet_type(&self) -> HardwareWalletType;

    fn device_id(&self) -> &str;
}

/// Runs a blocking device exchange on the blocking pool.
///
/// The owned guard moves into the blocking task, so the device stays locked
/// until the exchange really finishes even if the awaiting caller was dropped
/// by a deadline.
pub(crate) async fn run_exclusive<T, F>(io_lock: &Arc<Mutex<()>>, exchange: F) -> Result<T, WalletError>
where
    F: FnOnce() -> Result<T, WalletError> + Send + 'static,
    T: Send + 'static,
{
    let guard = io_lock.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        exchange()
    })
    .await
    .map_err(|e| WalletError::TransportError(format!("device task aborted: {}", e)))?
}
