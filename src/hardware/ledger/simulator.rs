//! Synthetic Ledger
//!
//! Speaks the Ethereum app's APDU dialect against a [`SoftwareSecureElement`]:
//! address derivation, chunked transaction and personal-message signing, and
//! the dashboard's app query.

use super::apdu::{ApduCommand, ApduResponse, P1_FIRST_CHUNK, P1_MORE_CHUNK, SW_CONDITIONS_NOT_SATISFIED};
use super::transport::LedgerTransport;
use super::wallet::ETHEREUM_APP_NAME;
use crate::core::errors::WalletError;
use crate::hardware::simulator::{keccak, SimulationOptions, SoftwareSecureElement};
use crate::hardware::types::{DeviceInfo, HardwareWalletType};
use ethers::utils::hash_message;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const SIMULATED_MODEL: &str = "Nano S Plus";
pub const SIMULATED_FIRMWARE: &str = "1.0.3";
pub const SIMULATED_LABEL: &str = "My Ledger";
const SIMULATED_APP_VERSION: &str = "1.10.3";

const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
const SW_CLA_NOT_SUPPORTED: u16 = 0x6E00;
const SW_INVALID_DATA: u16 = 0x6A80;
const SW_INVALID_P1P2: u16 = 0x6B00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignKind {
    Transaction,
    Message,
}

/// Multi-APDU signing request being accumulated.
struct PendingSign {
    kind: SignKind,
    path: Vec<u32>,
    payload: Vec<u8>,
}

/// Total encoded length of an (optionally typed) RLP transaction, once enough
/// of its header has arrived.
fn rlp_transaction_len(payload: &[u8]) -> Option<usize> {
    let (type_prefix, body) = match payload.first()? {
        b if *b <= 0x7F => (1, &payload[1..]),
        _ => (0, payload),
    };
    let header = *body.first()?;
    match header {
        0xC0..=0xF7 => Some(type_prefix + 1 + (header - 0xC0) as usize),
        0xF8..=0xFF => {
            let len_of_len = (header - 0xF7) as usize;
            let len_bytes = body.get(1..1 + len_of_len)?;
            let len = len_bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
            Some(type_prefix + 1 + len_of_len + len)
        }
        _ => None,
    }
}

fn parse_path(data: &[u8]) -> Option<(Vec<u32>, usize)> {
    let depth = *data.first()? as usize;
    let end = 1 + depth * 4;
    let raw = data.get(1..end)?;
    let path = raw
        .chunks(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some((path, end))
}

/// Synthetic Ledger transport
pub struct SimulatedLedger {
    device_id: String,
    app_name: String,
    secure_element: SoftwareSecureElement,
    options: SimulationOptions,
    connected: AtomicBool,
    pending: Mutex<Option<PendingSign>>,
    connects: AtomicUsize,
    exchanges: AtomicUsize,
}

impl SimulatedLedger {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::with_options(device_id, SimulationOptions::default())
    }

    pub fn with_options(device_id: impl Into<String>, options: SimulationOptions) -> Self {
        let device_id = device_id.into();
        Self {
            secure_element: SoftwareSecureElement::for_device(&device_id),
            device_id,
            app_name: ETHEREUM_APP_NAME.to_string(),
            options,
            connected: AtomicBool::new(false),
            pending: Mutex::new(None),
            connects: AtomicUsize::new(0),
            exchanges: AtomicUsize::new(0),
        }
    }

    /// Pretend a different app is open on the device.
    pub fn with_open_app(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn secure_element(&self) -> &SoftwareSecureElement {
        &self.secure_element
    }

    /// Number of `connect` calls that reached the device.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of APDUs the device received.
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    fn handle(&self, command: ApduCommand) -> ApduResponse {
        match (command.cla, command.ins) {
            (0xB0, 0x01) => self.app_and_version(),
            (0xE0, 0x02) => self.eth_address(&command.data),
            (0xE0, 0x04) => self.sign_chunk(SignKind::Transaction, &command),
            (0xE0, 0x06) => self.app_configuration(),
            (0xE0, 0x08) => self.sign_chunk(SignKind::Message, &command),
            (0xE0, _) | (0xB0, _) => ApduResponse::new(Vec::new(), SW_INS_NOT_SUPPORTED),
            _ => ApduResponse::new(Vec::new(), SW_CLA_NOT_SUPPORTED),
        }
    }

    fn app_configuration(&self) -> ApduResponse {
        if self.app_name != ETHEREUM_APP_NAME {
            return ApduResponse::new(Vec::new(), SW_CLA_NOT_SUPPORTED);
        }
        ApduResponse::success(vec![0x02, 1, 10, 3])
    }

    fn app_and_version(&self) -> ApduResponse {
        let mut data = vec![0x01, self.app_name.len() as u8];
        data.extend_from_slice(self.app_name.as_bytes());
        data.push(SIMULATED_APP_VERSION.len() as u8);
        data.extend_from_slice(SIMULATED_APP_VERSION.as_bytes());
        data.extend_from_slice(&[1, 0x00]);
        ApduResponse::success(data)
    }

    fn eth_address(&self, data: &[u8]) -> ApduResponse {
        if self.app_name != ETHEREUM_APP_NAME {
            return ApduResponse::new(Vec::new(), SW_CLA_NOT_SUPPORTED);
        }
        let Some((path, _)) = parse_path(data) else {
            return ApduResponse::new(Vec::new(), SW_INVALID_DATA);
        };
        let (public_key, address) = match (self.secure_element.public_key(&path), self.secure_element.address(&path)) {
            (Ok(pk), Ok(addr)) => (pk, addr),
            _ => return ApduResponse::new(Vec::new(), SW_INVALID_DATA),
        };
        let address_hex = hex::encode(address.as_bytes());

        let mut out = vec![public_key.len() as u8];
        out.extend_from_slice(&public_key);
        out.push(address_hex.len() as u8);
        out.extend_from_slice(address_hex.as_bytes());
        ApduResponse::success(out)
    }

    fn sign_chunk(&self, kind: SignKind, command: &ApduCommand) -> ApduResponse {
        if self.app_name != ETHEREUM_APP_NAME {
            return ApduResponse::new(Vec::new(), SW_CLA_NOT_SUPPORTED);
        }
        let mut pending = self.pending.lock();
        match command.p1 {
            P1_FIRST_CHUNK => {
                let Some((path, offset)) = parse_path(&command.data) else {
                    return ApduResponse::new(Vec::new(), SW_INVALID_DATA);
                };
                *pending = Some(PendingSign {
                    kind,
                    path,
                    payload: command.data[offset..].to_vec(),
                });
            }
            P1_MORE_CHUNK => match pending.as_mut() {
                Some(request) if request.kind == kind => request.payload.extend_from_slice(&command.data),
                _ => return ApduResponse::new(Vec::new(), SW_INVALID_DATA),
            },
            _ => return ApduResponse::new(Vec::new(), SW_INVALID_P1P2),
        }

        let complete = match pending.as_ref() {
            Some(request) => match request.kind {
                SignKind::Transaction => rlp_transaction_len(&request.payload)
                    .map(|len| request.payload.len() >= len)
                    .unwrap_or(false),
                SignKind::Message => request.payload.len() >= 4 && {
                    let len = u32::from_be_bytes([
                        request.payload[0],
                        request.payload[1],
                        request.payload[2],
                        request.payload[3],
                    ]) as usize;
                    request.payload.len() >= 4 + len
                },
            },
            None => false,
        };
        if !complete {
            return ApduResponse::success(Vec::new());
        }

        let Some(request) = pending.take() else {
            return ApduResponse::new(Vec::new(), SW_INVALID_DATA);
        };
        if self.options.reject_signing {
            return ApduResponse::new(Vec::new(), SW_CONDITIONS_NOT_SATISFIED);
        }

        let digest = match request.kind {
            SignKind::Transaction => keccak(&request.payload),
            SignKind::Message => hash_message(&request.payload[4..]).0,
        };
        match self.secure_element.sign_digest(&request.path, &digest) {
            Ok(signature) => {
                let v = match request.kind {
                    SignKind::Transaction => signature.parity,
                    SignKind::Message => 27 + signature.parity,
                };
                let mut out = vec![v];
                out.extend_from_slice(&signature.r);
                out.extend_from_slice(&signature.s);
                ApduResponse::success(out)
            }
            Err(_) => ApduResponse::new(Vec::new(), SW_INVALID_DATA),
        }
    }
}

impl LedgerTransport for SimulatedLedger {
    fn connect(&self) -> Result<(), WalletError> {
        self.options.pause();
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.options.fail_connect {
            return Err(WalletError::ConnectionFailed(format!(
                "Ledger {} is not reachable",
                self.device_id
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), WalletError> {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn exchange(&self, apdu: &[u8]) -> Result<Vec<u8>, WalletError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(WalletError::TransportError(format!(
                "Ledger {} session is closed",
                self.device_id
            )));
        }
        self.options.pause();
        let command = ApduCommand::from_bytes(apdu)?;
        Ok(self.handle(command).to_bytes())
    }

    fn device_info(&self) -> Result<DeviceInfo, WalletError> {
        Ok(DeviceInfo {
            wallet_type: HardwareWalletType::Ledger,
            model: SIMULATED_MODEL.to_string(),
            serial_number: self.device_id.clone(),
            firmware_version: SIMULATED_FIRMWARE.to_string(),
            is_locked: false,
            is_initialized: true,
            label: SIMULATED_LABEL.to_string(),
            supported_apps: vec!["Ethereum".to_string(), "Bitcoin".to_string()],
        })
    }
}
