//! Trezor HID transport (protocol v1)
//!
//! Each 64-byte report starts with `?`. The first report of a message adds the
//! `##` magic, the message type and the payload length. Framing is kept as
//! plain functions; the hidapi transport is only built with the `trezor`
//! feature.

use super::messages::TrezorMessage;
use crate::core::errors::WalletError;

/// HID report size
pub const HID_PACKET_SIZE: usize = 64;

const REPORT_MARKER: u8 = b'?';
const HEADER_MAGIC: &[u8] = b"##";

/// Split a message into HID reports (without the leading report id).
pub fn wrap_message(message: &TrezorMessage) -> Vec<[u8; HID_PACKET_SIZE]> {
    // serialize() already yields type(2) || length(4) || payload
    let mut stream = HEADER_MAGIC.to_vec();
    stream.extend_from_slice(&message.serialize());

    stream
        .chunks(HID_PACKET_SIZE - 1)
        .map(|chunk| {
            let mut packet = [0u8; HID_PACKET_SIZE];
            packet[0] = REPORT_MARKER;
            packet[1..1 + chunk.len()].copy_from_slice(chunk);
            packet
        })
        .collect()
}

/// Reassembles a message from HID reports.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: Vec<u8>,
    expected: Option<usize>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: &[u8]) -> Result<Option<TrezorMessage>, WalletError> {
        if packet.first() != Some(&REPORT_MARKER) {
            return Err(WalletError::TransportError("invalid Trezor HID report marker".to_string()));
        }
        let body = &packet[1..];

        if self.expected.is_none() {
            if body.len() < 8 || &body[0..2] != HEADER_MAGIC {
                return Err(WalletError::TransportError("invalid Trezor message header".to_string()));
            }
            let payload_len = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
            self.expected = Some(6 + payload_len);
            self.buffer.extend_from_slice(&body[2..]);
        } else {
            self.buffer.extend_from_slice(body);
        }

        match self.expected {
            Some(len) if self.buffer.len() >= len => {
                let message = TrezorMessage::deserialize(&self.buffer[..len])?;
                self.buffer.clear();
                self.expected = None;
                Ok(Some(message))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(feature = "trezor")]
pub use device::{HidTrezorProvider, HidTrezorTransport};

#[cfg(feature = "trezor")]
mod device {
    use super::{wrap_message, MessageAssembler, HID_PACKET_SIZE};
    use crate::core::errors::WalletError;
    use crate::hardware::backend::TransportProvider;
    use crate::hardware::trezor::messages::TrezorMessage;
    use crate::hardware::trezor::transport::{
        TrezorTransport, TREZOR_ONE_PRODUCT_ID, TREZOR_T_PRODUCT_ID, TREZOR_T_VENDOR_ID, TREZOR_VENDOR_ID,
    };
    use crate::hardware::types::{DeviceInfo, HardwareWalletType};
    use hidapi::{HidApi, HidDevice};
    use parking_lot::Mutex;
    use std::ffi::CString;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{debug, info};

    fn model_name(vendor_id: u16, product_id: u16) -> Option<&'static str> {
        match (vendor_id, product_id) {
            (TREZOR_VENDOR_ID, TREZOR_ONE_PRODUCT_ID) => Some("Trezor One"),
            (TREZOR_T_VENDOR_ID, TREZOR_T_PRODUCT_ID) => Some("Model T"),
            _ => None,
        }
    }

    /// HID transport bound to one device path.
    pub struct HidTrezorTransport {
        api: Arc<Mutex<HidApi>>,
        path: CString,
        info: DeviceInfo,
        read_timeout: Duration,
        device: Mutex<Option<HidDevice>>,
    }

    impl TrezorTransport for HidTrezorTransport {
        fn connect(&self) -> Result<(), WalletError> {
            let mut guard = self.device.lock();
            if guard.is_some() {
                return Ok(());
            }
            let device = self
                .api
                .lock()
                .open_path(&self.path)
                .map_err(|e| WalletError::ConnectionFailed(format!("cannot open Trezor HID device: {}", e)))?;
            info!("Opened Trezor HID device {}", self.info.serial_number);
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

        fn call(&self, request: &TrezorMessage) -> Result<TrezorMessage, WalletError> {
            let guard = self.device.lock();
            let device = guard
                .as_ref()
                .ok_or_else(|| WalletError::TransportError("Trezor HID handle is closed".to_string()))?;

            debug!("Trezor HID write {:?} ({} bytes)", request.msg_type, request.payload.len());
            for packet in wrap_message(request) {
                let mut report = Vec::with_capacity(HID_PACKET_SIZE + 1);
                report.push(0x00); // report id
                report.extend_from_slice(&packet);
                device
                    .write(&report)
                    .map_err(|e| WalletError::TransportError(format!("HID write failed: {}", e)))?;
            }

            let mut assembler = MessageAssembler::new();
            loop {
                let mut buf = [0u8; HID_PACKET_SIZE];
                let read = device
                    .read_timeout(&mut buf, self.read_timeout.as_millis() as i32)
                    .map_err(|e| WalletError::TransportError(format!("HID read failed: {}", e)))?;
                if read == 0 {
                    return Err(WalletError::TransportError("HID read timed out".to_string()));
                }
                if let Some(message) = assembler.push(&buf[..read])? {
                    return Ok(message);
                }
            }
        }

        fn device_info(&self) -> Result<DeviceInfo, WalletError> {
            Ok(self.info.clone())
        }
    }

    /// Enumerates Trezor devices over hidapi.
    pub struct HidTrezorProvider {
        api: Arc<Mutex<HidApi>>,
        read_timeout: Duration,
    }

    impl HidTrezorProvider {
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
                .filter_map(|d| {
                    let model = model_name(d.vendor_id(), d.product_id())?;
                    let path = d.path().to_owned();
                    let id = d
                        .serial_number()
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| path.to_string_lossy().to_string());
                    let info = DeviceInfo {
                        wallet_type: HardwareWalletType::Trezor,
                        model: model.to_string(),
                        serial_number: id.clone(),
                        firmware_version: String::new(),
                        is_locked: false,
                        is_initialized: true,
                        label: d.product_string().unwrap_or("Trezor").to_string(),
                        supported_apps: vec!["Ethereum".to_string()],
                    };
                    Some((id, path, info))
                })
                .collect())
        }
    }

    impl TransportProvider<dyn TrezorTransport> for HidTrezorProvider {
        fn enumerate(&self) -> Result<Vec<String>, WalletError> {
            Ok(self.scan()?.into_iter().map(|(id, _, _)| id).collect())
        }

        fn open(&self, device_id: &str) -> Result<Arc<dyn TrezorTransport>, WalletError> {
            let (_, path, info) = self
                .scan()?
                .into_iter()
                .find(|(id, _, _)| id == device_id)
                .ok_or_else(|| WalletError::ConnectionFailed(format!("Trezor {} not attached", device_id)))?;
            Ok(Arc::new(HidTrezorTransport {
                api: self.api.clone(),
                path,
                info,
                read_timeout: self.read_timeout,
                device: Mutex::new(None),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::trezor::messages::MessageType;

    #[test]
    fn test_first_report_header() {
        let message = TrezorMessage::new(MessageType::Features, vec![0xAA; 4]);
        let packets = wrap_message(&message);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][0..3], b"?##");
        assert_eq!(&packets[0][3..5], &[0x00, 0x11]);
        assert_eq!(&packets[0][5..9], &[0x00, 0x00, 0x00, 0x04]);
        assert_eq!(&packets[0][9..13], &[0xAA; 4]);
    }

    #[test]
    fn test_reassembly_across_reports() {
        let message = TrezorMessage::new(MessageType::EthereumTxAck, (0..200u8).collect());
        let packets = wrap_message(&message);
        assert_eq!(packets.len(), 4);
        assert!(packets.iter().all(|p| p[0] == b'?'));

        let mut assembler = MessageAssembler::new();
        let mut result = None;
        for packet in &packets {
            result = assembler.push(packet).unwrap();
        }
        assert_eq!(result.unwrap(), message);
    }

    #[test]
    fn test_rejects_bad_marker() {
        let mut assembler = MessageAssembler::new();
        assert!(assembler.push(&[0x00; 64]).is_err());
        let mut no_magic = [0u8; 64];
        no_magic[0] = b'?';
        assert!(assembler.push(&no_magic).is_err());
    }
}
