//! Ledger HID transport
//!
//! APDUs travel over 64-byte HID reports: `channel(2) tag(1) seq(2)` header,
//! the first report additionally carries the total length (2 bytes). The
//! framing is plain functions so it can be exercised without a device; the
//! hidapi-backed transport is only built with the `ledger` feature.

use crate::core::errors::WalletError;

/// HID report size
pub const HID_PACKET_SIZE: usize = 64;

/// APDU channel
pub const CHANNEL: u16 = 0x0101;

/// HID command tag for APDU traffic
pub const TAG_APDU: u8 = 0x05;

/// Upper bound on reports per response.
const MAX_RESPONSE_PACKETS: u16 = 100;

/// Split a serialized APDU into HID reports (without the leading report id).
pub fn wrap_apdu(apdu: &[u8]) -> Vec<[u8; HID_PACKET_SIZE]> {
    let mut packets = Vec::new();
    let mut offset = 0;
    let mut sequence = 0u16;

    loop {
        let mut packet = [0u8; HID_PACKET_SIZE];
        packet[0..2].copy_from_slice(&CHANNEL.to_be_bytes());
        packet[2] = TAG_APDU;
        packet[3..5].copy_from_slice(&sequence.to_be_bytes());

        let data_start = if sequence == 0 {
            packet[5..7].copy_from_slice(&(apdu.len() as u16).to_be_bytes());
            7
        } else {
            5
        };
        let chunk_size = (HID_PACKET_SIZE - data_start).min(apdu.len() - offset);
        packet[data_start..data_start + chunk_size].copy_from_slice(&apdu[offset..offset + chunk_size]);
        offset += chunk_size;

        packets.push(packet);
        sequence += 1;
        if offset >= apdu.len() {
            break;
        }
    }

    packets
}

/// Reassembles a response from HID reports.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    data: Vec<u8>,
    expected: Option<usize>,
    sequence: u16,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one report. Returns the full response once complete.
    ///
    /// Reports on other channels or tags are ignored, as the device may emit
    /// keep-alives.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, WalletError> {
        if packet.len() < 5 {
            return Err(WalletError::TransportError("HID report too short".to_string()));
        }
        let channel = u16::from_be_bytes([packet[0], packet[1]]);
        if channel != CHANNEL || packet[2] != TAG_APDU {
            return Ok(None);
        }

        let sequence = u16::from_be_bytes([packet[3], packet[4]]);
        if sequence != self.sequence {
            return Err(WalletError::TransportError(format!(
                "HID sequence mismatch: expected {}, got {}",
                self.sequence, sequence
            )));
        }
        if sequence >= MAX_RESPONSE_PACKETS {
            return Err(WalletError::TransportError("too many HID reports in response".to_string()));
        }

        if sequence == 0 {
            if packet.len() < 7 {
                return Err(WalletError::TransportError("HID report too short".to_string()));
            }
            self.expected = Some(u16::from_be_bytes([packet[5], packet[6]]) as usize);
            self.data.extend_from_slice(&packet[7..]);
        } else {
            self.data.extend_from_slice(&packet[5..]);
        }
        self.sequence += 1;

        match self.expected {
            Some(len) if self.data.len() >= len => {
                let mut data = std::mem::take(&mut self.data);
                data.truncate(len);
                Ok(Some(data))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(feature = "ledger")]
pub use device::{HidLedgerProvider, HidLedgerTransport};

#[cfg(feature = "ledger")]
mod device {
    use super::{wrap_apdu, ResponseAssembler, HID_PACKET_SIZE};
    use crate::core::errors::WalletError;
    use crate::hardware::backend::TransportProvider;
    use crate::hardware::ledger::transport::{LedgerTransport, LEDGER_USAGE_PAGE, LEDGER_VENDOR_ID};
    use crate::hardware::types::{DeviceInfo, HardwareWalletType};
    use hidapi::{HidApi, HidDevice};
    use parking_lot::Mutex;
    use std::ffi::CString;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{debug, info};

    fn model_name(product_id: u16) -> &'static str {
        match product_id >> 8 {
            0x10 => "Nano S",
            0x40 => "Nano X",
            0x50 => "Nano S Plus",
            0x60 => "Stax",
            _ => match product_id {
                0x0001 => "Nano S",
                0x0004 => "Nano X",
                0x0005 => "Nano S Plus",
                _ => "Ledger",
            },
        }
    }

    /// HID transport bound to one device path.
    pub struct HidLedgerTransport {
        api: Arc<Mutex<HidApi>>,
        path: CString,
        info: DeviceInfo,
        read_timeout: Duration,
        device: Mutex<Option<HidDevice>>,
    }

    impl HidLedgerTransport {
        fn with_device<T>(&self, f: impl FnOnce(&HidDevice) -> Result<T, WalletError>) -> Result<T, WalletError> {
            let guard = self.device.lock();
            let device = guard
                .as_ref()
                .ok_or_else(|| WalletError::TransportError("Ledger HID handle is closed".to_string()))?;
            f(device)
        }
    }

    impl LedgerTransport for HidLedgerTransport {
        fn connect(&self) -> Result<(), WalletError> {
            let mut guard = self.device.lock();
            if guard.is_some() {
                return Ok(());
            }
            let device = self
                .api
                .lock()
                .open_path(&self.path)
                .map_err(|e| WalletError::ConnectionFailed(format!("cannot open Ledger HID device: {}", e)))?;
            info!("Opened Ledger HID device {}", self.info.serial_number);
            *guard = Some(device);
            Ok(())
        }

        fn disconnect(&self) -> Result<(), WalletError> {
            self.device.lock().take();
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.device.lock().is_some()
        }

        fn exchange(&self, apdu: &[u8]) -> Result<Vec<u8>, WalletError> {
            self.with_device(|device| {
                for (i, packet) in wrap_apdu(apdu).iter().enumerate() {
                    let mut report = Vec::with_capacity(HID_PACKET_SIZE + 1);
                    report.push(0x00); // report id
                    report.extend_from_slice(packet);
                    debug!("Ledger HID write #{}", i);
                    device
                        .write(&report)
                        .map_err(|e| WalletError::TransportError(format!("HID write failed: {}", e)))?;
                }

                let mut assembler = ResponseAssembler::new();
                loop {
                    let mut buf = [0u8; HID_PACKET_SIZE];
                    let read = device
                        .read_timeout(&mut buf, self.read_timeout.as_millis() as i32)
                        .map_err(|e| WalletError::TransportError(format!("HID read failed: {}", e)))?;
                    if read == 0 {
                        return Err(WalletError::TransportError("HID read timed out".to_string()));
                    }
                    if let Some(response) = assembler.push(&buf[..read])? {
                        return Ok(response);
                    }
                }
            })
        }

        fn device_info(&self) -> Result<DeviceInfo, WalletError> {
            Ok(self.info.clone())
        }
    }

    /// Enumerates Ledger devices over hidapi.
    pub struct HidLedgerProvider {
        api: Arc<Mutex<HidApi>>,
        read_timeout: Duration,
    }

    impl HidLedgerProvider {
        pub fn new(read_timeout: Duration) -> Result<Self, WalletError> {
            let api = HidApi::new()
                .map_err(|e| WalletError::TransportError(format!("HID API init failed: {}", e)))?;
            Ok(Self {
                api: Arc::new(Mutex::new(api)),
                read_timeout,
            })
        }

        fn scan(&self) -> Result<Vec<(String, CString, DeviceInfo)>, WalletError> {
            let mut api = self.api.lock();
            api.refresh_devices()
                .map_err(|e| WalletError::TransportError(format!("HID enumeration failed: {}", e)))?;
            Ok(api
                .device_list()
                .filter(|d| d.vendor_id() == LEDGER_VENDOR_ID && d.usage_page() == LEDGER_USAGE_PAGE)
                .map(|d| {
                    let path = d.path().to_owned();
                    let id = d
                        .serial_number()
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| path.to_string_lossy().to_string());
                    let info = DeviceInfo {
                        wallet_type: HardwareWalletType::Ledger,
                        model: model_name(d.product_id()).to_string(),
                        serial_number: id.clone(),
                        firmware_version: String::new(),
                        is_locked: false,
                        is_initialized: true,
                        label: d.product_string().unwrap_or("Ledger").to_string(),
                        supported_apps: vec!["Ethereum".to_string()],
                    };
                    (id, path, info)
                })
                .collect())
        }
    }

    impl TransportProvider<dyn LedgerTransport> for HidLedgerProvider {
        fn enumerate(&self) -> Result<Vec<String>, WalletError> {
            Ok(self.scan()?.into_iter().map(|(id, _, _)| id).collect())
        }

        fn open(&self, device_id: &str) -> Result<Arc<dyn LedgerTransport>, WalletError> {
            let (_, path, info) = self
                .scan()?
                .into_iter()
                .find(|(id, _, _)| id == device_id)
                .ok_or_else(|| WalletError::ConnectionFailed(format!("Ledger {} not attached", device_id)))?;
            Ok(Arc::new(HidLedgerTransport {
                api: self.api.clone(),
                path,
                info,
                read_timeout: self.read_timeout,
                device: Mutex::new(None),
            }))
        }
    }
}
