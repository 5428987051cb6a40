//! Trezor transport seam
//!
//! A transport delivers one request message and returns the device's next
//! message. Calls are blocking; the wallet serializes them per device.

use super::messages::TrezorMessage;
use crate::core::errors::WalletError;
use crate::hardware::types::DeviceInfo;

/// SatoshiLabs USB vendor id
pub const TREZOR_VENDOR_ID: u16 = 0x534C;
pub const TREZOR_ONE_PRODUCT_ID: u16 = 0x0001;
/// Model T and later use the Trezor vendor id with this product id.
pub const TREZOR_T_VENDOR_ID: u16 = 0x1209;
pub const TREZOR_T_PRODUCT_ID: u16 = 0x53C1;

pub trait TrezorTransport: Send + Sync {
    fn connect(&self) -> Result<(), WalletError>;

    fn disconnect(&self) -> Result<(), WalletError>;

    fn is_connected(&self) -> bool;

    /// Write `request` and read the device's reply.
    fn call(&self, request: &TrezorMessage) -> Result<TrezorMessage, WalletError>;

    /// Identity of the attached device as seen on the bus, before any session.
    fn device_info(&self) -> Result<DeviceInfo, WalletError>;
}
