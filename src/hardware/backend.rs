//! Vendor backends
//!
//! A backend knows how to find devices of one vendor and wrap a device in the
//! matching [`HardwareWallet`]. Device access goes through a
//! [`TransportProvider`] so the same backend drives USB HID or synthetic
//! devices.

use crate::core::errors::WalletError;
use crate::hardware::ledger::{LedgerTransport, LedgerWallet, SimulatedLedger};
use crate::hardware::trezor::{SimulatedTrezor, TrezorTransport, TrezorWallet};
use crate::hardware::types::{DeviceInfo, HardwareWalletType};
use crate::hardware::HardwareWallet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of transports of kind `T` (e.g. `dyn LedgerTransport`).
pub trait TransportProvider<T: ?Sized>: Send + Sync {
    /// Identifiers of attached devices.
    fn enumerate(&self) -> Result<Vec<String>, WalletError>;

    /// Transport for one device; the session is not opened yet.
    fn open(&self, device_id: &str) -> Result<Arc<T>, WalletError>;
}

pub trait DeviceBackend: Send + Sync {
    fn wallet_type(&self) -> HardwareWalletType;

    /// Blocking scan. Devices that cannot be described are skipped.
    fn discover(&self) -> Result<Vec<DeviceInfo>, WalletError>;

    /// Wallet for `device_id`, not yet connected.
    fn create_wallet(&self, device_id: &str) -> Result<Arc<dyn HardwareWallet>, WalletError>;
}

fn discover_with<T: ?Sized>(
    wallet_type: HardwareWalletType,
    provider: &dyn TransportProvider<T>,
    describe: impl Fn(&T) -> Result<DeviceInfo, WalletError>,
) -> Result<Vec<DeviceInfo>, WalletError> {
    let ids = provider.enumerate()?;
    debug!("{} provider reports {} device(s)", wallet_type, ids.len());

    let mut found = Vec::with_capacity(ids.len());
    for id in ids {
        match provider.open(&id).and_then(|transport| describe(transport.as_ref())) {
            Ok(info) => found.push(info),
            Err(e) => warn!("Skipping {} device {}: {}", wallet_type, id, e),
        }
    }
    Ok(found)
}

pub struct LedgerBackend {
    provider: Arc<dyn TransportProvider<dyn LedgerTransport>>,
}

impl LedgerBackend {
    pub fn new(provider: Arc<dyn TransportProvider<dyn LedgerTransport>>) -> Self {
        Self { provider }
    }

    /// Backend over synthetic devices.
    pub fn simulated(devices: Vec<Arc<SimulatedLedger>>) -> Self {
        Self::new(Arc::new(SimulatedProvider::new(devices)))
    }

    #[cfg(feature = "ledger")]
    pub fn hid(read_timeout: std::time::Duration) -> Result<Self, WalletError> {
        Ok(Self::new(Arc::new(crate::hardware::ledger::hid::HidLedgerProvider::new(read_timeout)?)))
    }
}

impl DeviceBackend for LedgerBackend {
    fn wallet_type(&self) -> HardwareWalletType {
        HardwareWalletType::Ledger
    }

    fn discover(&self) -> Result<Vec<DeviceInfo>, WalletError> {
        discover_with(HardwareWalletType::Ledger, self.provider.as_ref(), |t| t.device_info())
    }

    fn create_wallet(&self, device_id: &str) -> Result<Arc<dyn HardwareWallet>, WalletError> {
        let transport = self.provider.open(device_id)?;
        Ok(Arc::new(LedgerWallet::new(device_id, transport)))
    }
}

pub struct TrezorBackend {
    provider: Arc<dyn TransportProvider<dyn TrezorTransport>>,
}

impl TrezorBackend {
    pub fn new(provider: Arc<dyn TransportProvider<dyn TrezorTransport>>) -> Self {
        Self { provider }
    }

    pub fn simulated(devices: Vec<Arc<SimulatedTrezor>>) -> Self {
        Self::new(Arc::new(SimulatedProvider::new(devices)))
    }

    #[cfg(feature = "trezor")]
    pub fn hid(read_timeout: std::time::Duration) -> Result<Self, WalletError> {
        Ok(Self::new(Arc::new(crate::hardware::trezor::hid::HidTrezorProvider::new(read_timeout)?)))
    }
}

impl DeviceBackend for TrezorBackend {
    fn wallet_type(&self) -> HardwareWalletType {
        HardwareWalletType::Trezor
    }

    fn discover(&self) -> Result<Vec<DeviceInfo>, WalletError> {
        discover_with(HardwareWalletType::Trezor, self.provider.as_ref(), |t| t.device_info())
    }

    fn create_wallet(&self, device_id: &str) -> Result<Arc<dyn HardwareWallet>, WalletError> {
        let transport = self.provider.open(device_id)?;
        Ok(Arc::new(TrezorWallet::new(device_id, transport)))
    }
}

/// Fixed set of synthetic devices. Opening an id twice yields the same device.
pub struct SimulatedProvider<D> {
    devices: Vec<Arc<D>>,
}

impl<D> SimulatedProvider<D> {
    pub fn new(devices: Vec<Arc<D>>) -> Self {
        Self { devices }
    }
}

impl TransportProvider<dyn LedgerTransport> for SimulatedProvider<SimulatedLedger> {
    fn enumerate(&self) -> Result<Vec<String>, WalletError> {
        self.devices
            .iter()
            .map(|d| d.device_info().map(|info| info.serial_number))
            .collect()
    }

    fn open(&self, device_id: &str) -> Result<Arc<dyn LedgerTransport>, WalletError> {
        self.devices
            .iter()
            .find(|d| d.device_info().map(|i| i.serial_number == device_id).unwrap_or(false))
            .map(|d| d.clone() as Arc<dyn LedgerTransport>)
            .ok_or_else(|| WalletError::ConnectionFailed(format!("no Ledger with id {}", device_id)))
    }
}

impl TransportProvider<dyn TrezorTransport> for SimulatedProvider<SimulatedTrezor> {
    fn enumerate(&self) -> Result<Vec<String>, WalletError> {
        self.devices
            .iter()
            .map(|d| d.device_info().map(|info| info.serial_number))
            .collect()
    }

    fn open(&self, device_id: &str) -> Result<Arc<dyn TrezorTransport>, WalletError> {
        self.devices
            .iter()
            .find(|d| d.device_info().map(|i| i.serial_number == device_id).unwrap_or(false))
            .map(|d| d.clone() as Arc<dyn TrezorTransport>)
            .ok_or_else(|| WalletError::ConnectionFailed(format!("no Trezor with id {}", device_id)))
    }
}
