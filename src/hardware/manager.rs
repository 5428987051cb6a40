//! Hardware wallet manager
//!
//! Registry of connected devices keyed by device id. Callers go through the
//! manager for every device operation; it owns the connection lifecycle and
//! applies the configured deadlines.

use super::backend::{DeviceBackend, LedgerBackend, TrezorBackend};
use super::ledger::SimulatedLedger;
use super::trezor::SimulatedTrezor;
use super::types::{DeviceInfo, HardwareWalletType, SignedTransaction};
use super::HardwareWallet;
use crate::core::bip44;
use crate::core::config::HardwareWalletConfig;
use crate::core::errors::WalletError;
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Shared handle to a connected wallet.
pub type WalletHandle = Arc<dyn HardwareWallet>;

/// Hardware wallet manager
pub struct HardwareWalletManager {
    config: HardwareWalletConfig,
    backends: HashMap<HardwareWalletType, Arc<dyn DeviceBackend>>,
    /// Never held across an await.
    registry: RwLock<HashMap<String, WalletHandle>>,
    /// Per-device lock serializing connect and disconnect of that id.
    lifecycle: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HardwareWalletManager {
    pub fn new(config: HardwareWalletConfig, backends: Vec<Arc<dyn DeviceBackend>>) -> Self {
        if config.auto_reconnect || config.max_retries > 0 {
            warn!(
                auto_reconnect = config.auto_reconnect,
                max_retries = config.max_retries,
                "Retry settings are not applied; device errors are returned to the caller"
            );
        }

        let backends = backends
            .into_iter()
            .map(|backend| (backend.wallet_type(), backend))
            .collect();

        Self {
            config,
            backends,
            registry: RwLock::new(HashMap::new()),
            lifecycle: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Manager over synthetic devices with the given ids.
    pub fn with_simulated_devices(config: HardwareWalletConfig, ledger_ids: &[&str], trezor_ids: &[&str]) -> Self {
        let ledgers = ledger_ids.iter().map(|id| Arc::new(SimulatedLedger::new(*id))).collect();
        let trezors = trezor_ids.iter().map(|id| Arc::new(SimulatedTrezor::new(*id))).collect();
        let ledger: Arc<dyn DeviceBackend> = Arc::new(LedgerBackend::simulated(ledgers));
        let trezor: Arc<dyn DeviceBackend> = Arc::new(TrezorBackend::simulated(trezors));
        Self::new(config, vec![ledger, trezor])
    }

    pub fn config(&self) -> &HardwareWalletConfig {
        &self.config
    }

    fn transition_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.lifecycle.lock().entry(device_id.to_string()).or_default().clone()
    }

    fn backend(&self, wallet_type: HardwareWalletType) -> Result<Arc<dyn DeviceBackend>, WalletError> {
        if !self.config.is_enabled(wallet_type) {
            return Err(WalletError::UnsupportedWalletType(format!("{} is not enabled", wallet_type)));
        }
        self.backends
            .get(&wallet_type)
            .cloned()
            .ok_or_else(|| WalletError::UnsupportedWalletType(format!("no backend for {}", wallet_type)))
    }

    /// Scan every enabled vendor. A vendor that fails to enumerate is logged
    /// and skipped.
    pub async fn discover_wallets(&self) -> Vec<DeviceInfo> {
        let mut enabled: Vec<HardwareWalletType> = Vec::new();
        let mut backends = Vec::new();
        for wallet_type in &self.config.enabled_wallets {
            if enabled.contains(wallet_type) {
                continue;
            }
            enabled.push(*wallet_type);
            match self.backends.get(wallet_type) {
                Some(backend) => backends.push(backend.clone()),
                None => debug!("No backend registered for {}", wallet_type),
            }
        }

        let scans = backends.into_iter().map(|backend| async move {
            let wallet_type = backend.wallet_type();
            let result = tokio::task::spawn_blocking(move || backend.discover())
                .await
                .map_err(|e| WalletError::TransportError(format!("discovery task aborted: {}", e)))
                .and_then(|r| r);
            (wallet_type, result)
        });

        let mut devices = Vec::new();
        for (wallet_type, result) in join_all(scans).await {
            match result {
                Ok(found) => {
                    info!("Discovered {} {} device(s)", found.len(), wallet_type);
                    devices.extend(found);
                }
                Err(e) => warn!("{} discovery failed: {}", wallet_type, e),
            }
        }
        devices
    }

    /// Connect `device_id`, or return the live handle if already connected.
    pub async fn connect_wallet(
        &self,
        device_id: &str,
        wallet_type: HardwareWalletType,
    ) -> Result<WalletHandle, WalletError> {
        let backend = self.backend(wallet_type)?;
        let transition = self.transition_lock(device_id);
        let _transition = transition.lock().await;

        let existing = self.registry.read().get(device_id).cloned();
        if let Some(handle) = existing {
            if handle.is_connected() {
                debug!("{} already connected", device_id);
                return Ok(handle);
            }
            warn!("Dropping stale handle for {}", device_id);
            self.registry.write().remove(device_id);
        }

        let wallet = backend
            .create_wallet(device_id)
            .map_err(|e| e.context(format!("connect {} {}", wallet_type, device_id)))?;

        let deadline = self.config.connection_timeout();
        match tokio::time::timeout(deadline, wallet.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.context(format!("connect {} {}", wallet_type, device_id))),
            Err(_) => {
                warn!("Connecting {} timed out after {:?}", device_id, deadline);
                return Err(WalletError::ConnectionTimeout(format!(
                    "{} did not connect within {}s",
                    device_id,
                    deadline.as_secs()
                )));
            }
        }

        self.registry.write().insert(device_id.to_string(), wallet.clone());
        info!(device_id, wallet = %wallet_type, "Hardware wallet connected");
        Ok(wallet)
    }

    /// Remove `device_id` and close its transport. Only this id waits for
    /// the teardown, which queues behind any exchange still on the device.
    pub async fn disconnect_wallet(&self, device_id: &str) -> Result<(), WalletError> {
        let transition = self.transition_lock(device_id);
        let _transition = transition.lock().await;

        let handle = self
            .registry
            .write()
            .remove(device_id)
            .ok_or_else(|| WalletError::NotConnected(device_id.to_string()))?;

        handle
            .disconnect()
            .await
            .map_err(|e| e.context(format!("disconnect {}", device_id)))?;
        info!(device_id, "Hardware wallet disconnected");
        Ok(())
    }

    /// Snapshot of live handles. Entries whose device dropped are pruned first.
    pub fn get_connected_wallets(&self) -> HashMap<String, WalletHandle> {
        let mut registry = self.registry.write();
        registry.retain(|id, handle| {
            let live = handle.is_connected();
            if !live {
                warn!("Pruning disconnected wallet {}", id);
            }
            live
        });
        registry.clone()
    }

    fn lookup(&self, device_id: &str) -> Result<WalletHandle, WalletError> {
        let handle = self
            .registry
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| WalletError::NotConnected(device_id.to_string()))?;
        if !handle.is_connected() {
            self.prune_if_stale(device_id, &handle);
            return Err(WalletError::NotConnected(device_id.to_string()));
        }
        Ok(handle)
    }

    /// Drop the entry for `device_id` only if it is still `stale` and still dead.
    /// A concurrent connect may already have put a live handle in its place.
    fn prune_if_stale(&self, device_id: &str, stale: &WalletHandle) -> bool {
        let mut registry = self.registry.write();
        let replaced = match registry.get(device_id) {
            Some(current) => !Arc::ptr_eq(current, stale) || current.is_connected(),
            None => true,
        };
        if replaced {
            return false;
        }
        warn!("Pruning disconnected wallet {}", device_id);
        registry.remove(device_id);
        true
    }

    async fn with_signing_deadline<T>(
        &self,
        device_id: &str,
        operation: impl Future<Output = Result<T, WalletError>>,
    ) -> Result<T, WalletError> {
        let deadline: Duration = self.config.signing_timeout();
        match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Signing on {} timed out after {:?}", device_id, deadline);
                Err(WalletError::SigningTimeout(format!(
                    "{} did not answer within {}s",
                    device_id,
                    deadline.as_secs()
                )))
            }
        }
    }

    pub async fn sign_transaction_with_hardware_wallet(
        &self,
        device_id: &str,
        tx: &TypedTransaction,
        path: &str,
    ) -> Result<SignedTransaction, WalletError> {
        let handle = self.lookup(device_id)?;
        self.with_signing_deadline(device_id, handle.sign_transaction(tx, path))
            .await
            .map_err(|e| e.context(format!("sign_transaction on {} at {}", device_id, path)))
    }

    pub async fn sign_message_with_hardware_wallet(
        &self,
        device_id: &str,
        message: &[u8],
        path: &str,
    ) -> Result<Vec<u8>, WalletError> {
        let handle = self.lookup(device_id)?;
        self.with_signing_deadline(device_id, handle.sign_message(message, path))
            .await
            .map_err(|e| e.context(format!("sign_message on {} at {}", device_id, path)))
    }

    pub async fn get_address_from_hardware_wallet(&self, device_id: &str, path: &str) -> Result<String, WalletError> {
        let handle = self.lookup(device_id)?;
        handle
            .get_address(path)
            .await
            .map_err(|e| e.context(format!("get_address on {} at {}", device_id, path)))
    }

    pub async fn get_public_key_from_hardware_wallet(
        &self,
        device_id: &str,
        path: &str,
    ) -> Result<Vec<u8>, WalletError> {
        let handle = self.lookup(device_id)?;
        handle
            .get_public_key(path)
            .await
            .map_err(|e| e.context(format!("get_public_key on {} at {}", device_id, path)))
    }

    pub fn get_device_info(&self, device_id: &str) -> Result<DeviceInfo, WalletError> {
        self.lookup(device_id)?.get_device_info()
    }

    pub fn validate_derivation_path(&self, path: &str) -> Result<(), WalletError> {
        bip44::validate_derivation_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> HardwareWalletManager {
        HardwareWalletManager::with_simulated_devices(HardwareWalletConfig::default(), &["dev1"], &["dev2"])
    }

    #[tokio::test]
    async fn test_disabled_vendor_is_unsupported() {
        let config = HardwareWalletConfig {
            enabled_wallets: vec![HardwareWalletType::Ledger],
            ..Default::default()
        };
        let manager = HardwareWalletManager::with_simulated_devices(config, &["dev1"], &["dev2"]);

        let err = manager.connect_wallet("dev2", HardwareWalletType::Trezor).await.err().unwrap();
        assert!(matches!(err, WalletError::UnsupportedWalletType(_)));
        assert!(manager.get_connected_wallets().is_empty());

        // Discovery only covers enabled vendors.
        let found = manager.discover_wallets().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].wallet_type, HardwareWalletType::Ledger);
    }

    #[tokio::test]
    async fn test_unknown_device_id() {
        let manager = manager();
        let err = manager.connect_wallet("nope", HardwareWalletType::Ledger).await.err().unwrap();
        assert!(matches!(err, WalletError::ConnectionFailed(_)));
        assert!(manager.get_connected_wallets().is_empty());
    }

    #[tokio::test]
    async fn test_device_info_requires_connection() {
        let manager = manager();
        assert!(matches!(manager.get_device_info("dev1"), Err(WalletError::NotConnected(_))));

        manager.connect_wallet("dev1", HardwareWalletType::Ledger).await.unwrap();
        let info = manager.get_device_info("dev1").unwrap();
        assert_eq!(info.serial_number, "dev1");
        assert_eq!(info.label, "My Ledger");
    }

    #[tokio::test]
    async fn test_stale_handle_is_pruned() {
        let manager = manager();
        let handle = manager.connect_wallet("dev1", HardwareWalletType::Ledger).await.unwrap();

        // Disconnect behind the manager's back.
        handle.disconnect().await.unwrap();

        assert!(manager.get_connected_wallets().is_empty());
        assert!(matches!(
            manager.get_address_from_hardware_wallet("dev1", "m/44'/60'/0'/0/0").await,
            Err(WalletError::NotConnected(_))
        ));

        let fresh = manager.connect_wallet("dev1", HardwareWalletType::Ledger).await.unwrap();
        assert!(fresh.is_connected());
    }

    #[tokio::test]
    async fn test_prune_removes_only_the_dead_handle() {
        let manager = manager();
        let stale = manager.connect_wallet("dev1", HardwareWalletType::Ledger).await.unwrap();
        stale.disconnect().await.unwrap();
        assert!(manager.prune_if_stale("dev1", &stale));
        assert!(manager.registry.read().is_empty());

        // A lookup that saw `stale` loses the race against a reconnect.
        let stale = manager.connect_wallet("dev1", HardwareWalletType::Ledger).await.unwrap();
        stale.disconnect().await.unwrap();
        let fresh = manager.connect_wallet("dev1", HardwareWalletType::Ledger).await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));

        assert!(!manager.prune_if_stale("dev1", &stale));
        let connected = manager.get_connected_wallets();
        assert!(Arc::ptr_eq(&connected["dev1"], &fresh));
        assert!(manager.get_address_from_hardware_wallet("dev1", "m/44'/60'/0'/0/0").await.is_ok());
    }
}
