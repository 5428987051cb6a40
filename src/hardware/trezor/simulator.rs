//! Synthetic Trezor
//!
//! Answers the Ethereum message flow the way firmware 2.x does: an
//! Initialize/Features handshake, a ButtonRequest before anything that needs
//! confirmation, calldata pulled in `EthereumTxRequest` rounds, and Failure
//! replies for unexpected input or a user who cancels.

use super::messages::{
    encode_bool_field, encode_bytes_field, encode_string_field, encode_uint32_field, encode_uint64_field,
    failure_code, MessageType, ProtoFields, TrezorMessage,
};
use super::transport::TrezorTransport;
use super::wallet::MAX_DATA_CHUNK;
use crate::core::errors::WalletError;
use crate::hardware::simulator::{keccak, SimulationOptions, SoftwareSecureElement};
use crate::hardware::types::{eip155_v, DeviceInfo, HardwareWalletType};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256};
use ethers::utils::hash_message;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const SIMULATED_MODEL: &str = "T";
pub const SIMULATED_FIRMWARE: (u64, u64, u64) = (2, 5, 3);
pub const SIMULATED_LABEL: &str = "My Trezor";

/// Work parked behind a ButtonRequest or a calldata round trip.
enum Pending {
    /// Reply to send once the user confirms.
    Confirm(Confirmed),
    /// Transaction still receiving calldata.
    Calldata { tx: PendingTx, remaining: usize },
}

enum Confirmed {
    Message { path: Vec<u32>, message: Vec<u8> },
    Transaction(PendingTx),
}

struct PendingTx {
    path: Vec<u32>,
    tx: TypedTransaction,
    data: Vec<u8>,
    chain_id: u64,
}

fn failure(code: u64, message: &str) -> TrezorMessage {
    let mut payload = encode_uint64_field(1, code);
    payload.extend(encode_string_field(2, message));
    TrezorMessage::new(MessageType::Failure, payload)
}

fn data_request(length: usize) -> TrezorMessage {
    TrezorMessage::new(MessageType::EthereumTxRequest, encode_uint32_field(1, length as u32))
}

fn button_request() -> TrezorMessage {
    // ButtonRequest_SignTx
    TrezorMessage::new(MessageType::ButtonRequest, encode_uint32_field(1, 8))
}

fn parse_u256(fields: &ProtoFields, field: u32) -> U256 {
    fields.bytes(field).map(U256::from_big_endian).unwrap_or_default()
}

fn parse_recipient(fields: &ProtoFields, field: u32) -> Result<Option<Address>, String> {
    match fields.string(field) {
        None => Ok(None),
        Some(text) if text.is_empty() => Ok(None),
        Some(text) => Address::from_str(&text).map(Some).map_err(|_| format!("invalid recipient {}", text)),
    }
}

/// Rebuild the transaction the host asked to sign from the request fields.
fn decode_sign_tx(msg_type: MessageType, fields: &ProtoFields) -> Result<(PendingTx, usize), String> {
    let path: Vec<u32> = fields.repeated_uint(1).into_iter().map(|i| i as u32).collect();
    if path.is_empty() {
        return Err("missing address_n".to_string());
    }

    let (tx, initial, data_length, chain_id): (TypedTransaction, Vec<u8>, usize, u64) = match msg_type {
        MessageType::EthereumSignTx => {
            let mut req = TransactionRequest::new()
                .nonce(parse_u256(fields, 2))
                .gas_price(parse_u256(fields, 3))
                .gas(parse_u256(fields, 4))
                .value(parse_u256(fields, 6));
            if let Some(to) = parse_recipient(fields, 11)? {
                req = req.to(to);
            }
            let chain_id = fields.uint(9).ok_or("missing chain_id")?;
            (
                req.chain_id(chain_id).into(),
                fields.bytes(7).unwrap_or_default().to_vec(),
                fields.uint(8).unwrap_or_default() as usize,
                chain_id,
            )
        }
        MessageType::EthereumSignTxEIP1559 => {
            let mut req = Eip1559TransactionRequest::new()
                .nonce(parse_u256(fields, 2))
                .max_fee_per_gas(parse_u256(fields, 3))
                .max_priority_fee_per_gas(parse_u256(fields, 4))
                .gas(parse_u256(fields, 5))
                .value(parse_u256(fields, 7));
            if let Some(to) = parse_recipient(fields, 6)? {
                req = req.to(to);
            }
            let chain_id = fields.uint(10).ok_or("missing chain_id")?;
            (
                req.chain_id(chain_id).into(),
                fields.bytes(8).unwrap_or_default().to_vec(),
                fields.uint(9).unwrap_or_default() as usize,
                chain_id,
            )
        }
        other => return Err(format!("{:?} is not a signing request", other)),
    };

    if initial.len() > data_length || initial.len() > MAX_DATA_CHUNK {
        return Err("data_initial_chunk larger than declared".to_string());
    }
    let remaining = data_length - initial.len();
    Ok((
        PendingTx {
            path,
            tx,
            data: initial,
            chain_id,
        },
        remaining,
    ))
}

/// Synthetic Trezor transport
pub struct SimulatedTrezor {
    device_id: String,
    secure_element: SoftwareSecureElement,
    options: SimulationOptions,
    connected: AtomicBool,
    pending: Mutex<Option<Pending>>,
    connects: AtomicUsize,
    calls: AtomicUsize,
}

impl SimulatedTrezor {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::with_options(device_id, SimulationOptions::default())
    }

    pub fn with_options(device_id: impl Into<String>, options: SimulationOptions) -> Self {
        let device_id = device_id.into();
        Self {
            secure_element: SoftwareSecureElement::for_device(&device_id),
            device_id,
            options,
            connected: AtomicBool::new(false),
            pending: Mutex::new(None),
            connects: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn secure_element(&self) -> &SoftwareSecureElement {
        &self.secure_element
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of messages the device received.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn features(&self) -> TrezorMessage {
        let (major, minor, patch) = SIMULATED_FIRMWARE;
        let mut payload = encode_string_field(1, "trezor.io");
        payload.extend(encode_uint64_field(2, major));
        payload.extend(encode_uint64_field(3, minor));
        payload.extend(encode_uint64_field(4, patch));
        payload.extend(encode_string_field(6, &self.device_id));
        payload.extend(encode_bool_field(7, false));
        payload.extend(encode_string_field(10, SIMULATED_LABEL));
        payload.extend(encode_bool_field(12, true));
        payload.extend(encode_bool_field(16, true));
        payload.extend(encode_string_field(21, SIMULATED_MODEL));
        TrezorMessage::new(MessageType::Features, payload)
    }

    fn handle(&self, request: &TrezorMessage) -> TrezorMessage {
        let fields = match request.fields() {
            Ok(fields) => fields,
            Err(e) => return failure(failure_code::DATA_ERROR, &e.to_string()),
        };
        let path: Vec<u32> = fields.repeated_uint(1).into_iter().map(|i| i as u32).collect();
        let mut pending = self.pending.lock();

        match request.msg_type {
            MessageType::Initialize => {
                pending.take();
                self.features()
            }
            MessageType::EthereumGetAddress => match self.secure_element.address(&path) {
                Ok(address) if !path.is_empty() => TrezorMessage::new(
                    MessageType::EthereumAddress,
                    encode_string_field(2, &format!("{:#x}", address)),
                ),
                _ => failure(failure_code::DATA_ERROR, "invalid address_n"),
            },
            MessageType::EthereumGetPublicKey => match self.secure_element.compressed_public_key(&path) {
                Ok(public_key) if !path.is_empty() => {
                    let mut node = encode_uint32_field(1, path.len() as u32);
                    node.extend(encode_uint32_field(2, 0));
                    node.extend(encode_uint32_field(3, path[path.len() - 1]));
                    node.extend(encode_bytes_field(4, &keccak(&public_key)));
                    node.extend(encode_bytes_field(6, &public_key));
                    TrezorMessage::new(MessageType::EthereumPublicKey, encode_bytes_field(1, &node))
                }
                _ => failure(failure_code::DATA_ERROR, "invalid address_n"),
            },
            MessageType::EthereumSignMessage => {
                if path.is_empty() {
                    return failure(failure_code::DATA_ERROR, "invalid address_n");
                }
                let message = fields.bytes(2).unwrap_or_default().to_vec();
                *pending = Some(Pending::Confirm(Confirmed::Message { path, message }));
                button_request()
            }
            MessageType::EthereumSignTx | MessageType::EthereumSignTxEIP1559 => {
                match decode_sign_tx(request.msg_type, &fields) {
                    Ok((tx, 0)) => {
                        *pending = Some(Pending::Confirm(Confirmed::Transaction(tx)));
                        button_request()
                    }
                    Ok((tx, remaining)) => {
                        *pending = Some(Pending::Calldata { tx, remaining });
                        data_request(remaining.min(MAX_DATA_CHUNK))
                    }
                    Err(e) => failure(failure_code::DATA_ERROR, &e),
                }
            }
            MessageType::EthereumTxAck => match pending.take() {
                Some(Pending::Calldata { mut tx, remaining }) => {
                    let chunk = fields.bytes(1).unwrap_or_default();
                    if chunk.is_empty() || chunk.len() > remaining {
                        return failure(failure_code::DATA_ERROR, "unexpected data_chunk length");
                    }
                    tx.data.extend_from_slice(chunk);
                    let remaining = remaining - chunk.len();
                    if remaining == 0 {
                        *pending = Some(Pending::Confirm(Confirmed::Transaction(tx)));
                        button_request()
                    } else {
                        *pending = Some(Pending::Calldata { tx, remaining });
                        data_request(remaining.min(MAX_DATA_CHUNK))
                    }
                }
                _ => failure(failure_code::UNEXPECTED_MESSAGE, "Unexpected message"),
            },
            MessageType::ButtonAck => match pending.take() {
                Some(Pending::Confirm(_)) if self.options.reject_signing => {
                    failure(failure_code::ACTION_CANCELLED, "Action cancelled by user")
                }
                Some(Pending::Confirm(confirmed)) => self.sign(confirmed),
                _ => failure(failure_code::UNEXPECTED_MESSAGE, "Unexpected message"),
            },
            _ => failure(failure_code::UNEXPECTED_MESSAGE, "Unexpected message"),
        }
    }

    fn sign(&self, confirmed: Confirmed) -> TrezorMessage {
        match confirmed {
            Confirmed::Message { path, message } => {
                let digest = hash_message(&message).0;
                match (self.secure_element.sign_digest(&path, &digest), self.secure_element.address(&path)) {
                    (Ok(sig), Ok(address)) => {
                        let mut signature = sig.r.to_vec();
                        signature.extend_from_slice(&sig.s);
                        signature.push(27 + sig.parity);
                        let mut payload = encode_bytes_field(2, &signature);
                        payload.extend(encode_string_field(3, &format!("{:#x}", address)));
                        TrezorMessage::new(MessageType::EthereumMessageSignature, payload)
                    }
                    _ => failure(failure_code::FIRMWARE_ERROR, "signing failed"),
                }
            }
            Confirmed::Transaction(PendingTx { path, mut tx, data, chain_id }) => {
                if !data.is_empty() {
                    tx.set_data(Bytes::from(data));
                }
                let legacy = matches!(tx, TypedTransaction::Legacy(_));
                match self.secure_element.sign_digest(&path, &tx.sighash().0) {
                    Ok(sig) => {
                        let v = if legacy { eip155_v(sig.parity, chain_id) } else { sig.parity as u64 };
                        let mut payload = encode_uint64_field(2, v);
                        payload.extend(encode_bytes_field(3, &sig.r));
                        payload.extend(encode_bytes_field(4, &sig.s));
                        TrezorMessage::new(MessageType::EthereumTxRequest, payload)
                    }
                    Err(_) => failure(failure_code::FIRMWARE_ERROR, "signing failed"),
                }
            }
        }
    }
}

impl TrezorTransport for SimulatedTrezor {
    fn connect(&self) -> Result<(), WalletError> {
        self.options.pause();
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.options.fail_connect {
            return Err(WalletError::ConnectionFailed(format!(
                "Trezor {} is not reachable",
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

    fn call(&self, request: &TrezorMessage) -> Result<TrezorMessage, WalletError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(WalletError::TransportError(format!(
                "Trezor {} session is closed",
                self.device_id
            )));
        }
        self.options.pause();
        // Round-trip through the wire encoding like a real link would.
        let request = TrezorMessage::deserialize(&request.serialize())?;
        Ok(self.handle(&request))
    }

    fn device_info(&self) -> Result<DeviceInfo, WalletError> {
        let (major, minor, patch) = SIMULATED_FIRMWARE;
        Ok(DeviceInfo {
            wallet_type: HardwareWalletType::Trezor,
            model: "Model T".to_string(),
            serial_number: self.device_id.clone(),
            firmware_version: format!("{}.{}.{}", major, minor, patch),
            is_locked: false,
            is_initialized: true,
            label: SIMULATED_LABEL.to_string(),
            supported_apps: vec!["Ethereum".to_string(), "Bitcoin".to_string()],
        })
    }
}
