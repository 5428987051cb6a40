//! Ledger transport seam
//!
//! A transport moves raw APDU bytes to one physical (or synthetic) device.
//! Calls are blocking; the wallet runs them on the blocking pool and never
//! issues two at once on the same transport.

use super::apdu::{ApduCommand, ApduResponse};
use crate::core::errors::WalletError;
use crate::hardware::types::DeviceInfo;

/// Ledger device USB vendor id
pub const LEDGER_VENDOR_ID: u16 = 0x2C97;
/// HID usage page of the APDU interface
pub const LEDGER_USAGE_PAGE: u16 = 0xFFA0;

pub trait LedgerTransport: Send + Sync {
    fn connect(&self) -> Result<(), WalletError>;

    fn disconnect(&self) -> Result<(), WalletError>;

    fn is_connected(&self) -> bool;

    /// Send one serialized APDU and return the raw response including SW1 SW2.
    fn exchange(&self, apdu: &[u8]) -> Result<Vec<u8>, WalletError>;

    /// Identity of the attached device, available without an open session.
    fn device_info(&self) -> Result<DeviceInfo, WalletError>;
}

/// Send a command and split off the status word.
pub fn exchange_command(
    transport: &dyn LedgerTransport,
    command: &ApduCommand,
) -> Result<ApduResponse, WalletError> {
    let raw = transport.exchange(&command.to_bytes())?;
    let response = ApduResponse::from_bytes(&raw)?;
    if !response.is_success() {
        tracing::warn!(
            "APDU INS={:02X} failed: {:04X} - {}",
            command.ins,
            response.status_code(),
            response.error_description()
        );
    }
    Ok(response)
}
