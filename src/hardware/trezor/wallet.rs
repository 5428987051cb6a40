//! Trezor wallet on top of a message transport

use super::messages::{
    encode_bip32_path, encode_bool_field, encode_bytes_field, encode_string_field, encode_uint32_field,
    encode_uint64_field, failure_code, MessageType, ProtoFields, TrezorMessage,
};
use super::transport::TrezorTransport;
use crate::core::bip44::Bip44Path;
use crate::core::errors::WalletError;
use crate::hardware::types::{
    checksum_address, eip155_v, message_signature_bytes, parity_from_v, signature_from_parts,
    with_chain_id, DeviceInfo, HardwareWalletType, SignedTransaction,
};
use crate::hardware::{run_exclusive, HardwareWallet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, NameOrAddress, U256};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use parking_lot::RwLock;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Largest data slice sent in `data_initial_chunk` or a single `EthereumTxAck`.
pub const MAX_DATA_CHUNK: usize = 1024;

/// Upper bound on button confirmations for one request.
const MAX_BUTTON_REQUESTS: usize = 16;

/// Subset of the `Features` message the wallet uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub vendor: String,
    pub major_version: u64,
    pub minor_version: u64,
    pub patch_version: u64,
    pub device_id: String,
    pub label: String,
    pub initialized: bool,
    pub unlocked: bool,
    pub model: String,
}

impl Features {
    pub fn parse(fields: &ProtoFields) -> Self {
        Self {
            vendor: fields.string(1).unwrap_or_default(),
            major_version: fields.uint(2).unwrap_or_default(),
            minor_version: fields.uint(3).unwrap_or_default(),
            patch_version: fields.uint(4).unwrap_or_default(),
            device_id: fields.string(6).unwrap_or_default(),
            label: fields.string(10).unwrap_or_default(),
            initialized: fields.bool(12).unwrap_or(false),
            // Firmware older than 2.3 does not report the lock state.
            unlocked: fields.bool(16).unwrap_or(true),
            model: fields.string(21).unwrap_or_else(|| "1".to_string()),
        }
    }

    pub fn firmware_version(&self) -> String {
        format!("{}.{}.{}", self.major_version, self.minor_version, self.patch_version)
    }

    pub fn model_name(&self) -> String {
        match self.model.as_str() {
            "1" => "Trezor One".to_string(),
            "T" => "Model T".to_string(),
            other => other.to_string(),
        }
    }
}

/// One Initialize/Features handshake.
#[derive(Debug, Clone)]
pub struct TrezorSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub features: Features,
}

fn u256_bytes(value: Option<U256>) -> Vec<u8> {
    let value = value.unwrap_or_default();
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    let first = buf.iter().position(|b| *b != 0).unwrap_or(buf.len());
    buf[first..].to_vec()
}

fn recipient(to: Option<&NameOrAddress>) -> Result<String, WalletError> {
    match to {
        None => Ok(String::new()),
        Some(NameOrAddress::Address(address)) => Ok(checksum_address(address)),
        Some(NameOrAddress::Name(name)) => Err(WalletError::TransportError(format!(
            "ENS name {} must be resolved before signing",
            name
        ))),
    }
}

/// Encode the signing request and return it with the calldata that did not
/// fit into `data_initial_chunk`.
fn sign_tx_request(tx: &TypedTransaction, path: &Bip44Path, chain_id: u64) -> Result<(TrezorMessage, Vec<u8>), WalletError> {
    let mut payload = encode_bip32_path(&path.to_derivation_path());
    let (msg_type, data) = match tx {
        TypedTransaction::Legacy(req) => {
            let data = req.data.as_ref().map(|d| d.to_vec()).unwrap_or_default();
            let to = recipient(req.to.as_ref())?;
            payload.extend(encode_bytes_field(2, &u256_bytes(req.nonce)));
            payload.extend(encode_bytes_field(3, &u256_bytes(req.gas_price)));
            payload.extend(encode_bytes_field(4, &u256_bytes(req.gas)));
            if !to.is_empty() {
                payload.extend(encode_string_field(11, &to));
            }
            payload.extend(encode_bytes_field(6, &u256_bytes(req.value)));
            payload.extend(encode_bytes_field(7, &data[..data.len().min(MAX_DATA_CHUNK)]));
            payload.extend(encode_uint32_field(8, data.len() as u32));
            payload.extend(encode_uint64_field(9, chain_id));
            (MessageType::EthereumSignTx, data)
        }
        TypedTransaction::Eip1559(req) => {
            if !req.access_list.0.is_empty() {
                return Err(WalletError::TransportError(
                    "access lists are not supported by the Trezor driver".to_string(),
                ));
            }
            let data = req.data.as_ref().map(|d| d.to_vec()).unwrap_or_default();
            let to = recipient(req.to.as_ref())?;
            payload.extend(encode_bytes_field(2, &u256_bytes(req.nonce)));
            payload.extend(encode_bytes_field(3, &u256_bytes(req.max_fee_per_gas)));
            payload.extend(encode_bytes_field(4, &u256_bytes(req.max_priority_fee_per_gas)));
            payload.extend(encode_bytes_field(5, &u256_bytes(req.gas)));
            payload.extend(encode_string_field(6, &to));
            payload.extend(encode_bytes_field(7, &u256_bytes(req.value)));
            payload.extend(encode_bytes_field(8, &data[..data.len().min(MAX_DATA_CHUNK)]));
            payload.extend(encode_uint32_field(9, data.len() as u32));
            payload.extend(encode_uint64_field(10, chain_id));
            (MessageType::EthereumSignTxEIP1559, data)
        }
        TypedTransaction::Eip2930(_) => {
            return Err(WalletError::TransportError(
                "EIP-2930 transactions are not supported by the Trezor driver".to_string(),
            ))
        }
    };
    let rest = data.get(MAX_DATA_CHUNK..).map(<[u8]>::to_vec).unwrap_or_default();
    Ok((TrezorMessage::new(msg_type, payload), rest))
}

fn failure_to_error(message: &TrezorMessage) -> WalletError {
    let fields = message.fields().unwrap_or_default();
    let text = fields.string(2).unwrap_or_else(|| "unknown failure".to_string());
    match fields.uint(1) {
        Some(failure_code::ACTION_CANCELLED) | Some(failure_code::PIN_CANCELLED) => WalletError::UserRejected(text),
        Some(code) => WalletError::TransportError(format!("device failure {}: {}", code, text)),
        None => WalletError::TransportError(format!("device failure: {}", text)),
    }
}

/// Send `request`, acknowledging button prompts, and return the first real answer.
fn call_confirmed(transport: &dyn TrezorTransport, request: &TrezorMessage) -> Result<TrezorMessage, WalletError> {
    let mut response = transport.call(request)?;
    for _ in 0..MAX_BUTTON_REQUESTS {
        match response.msg_type {
            MessageType::ButtonRequest => {
                debug!("Trezor waiting for on-device confirmation");
                response = transport.call(&TrezorMessage::empty(MessageType::ButtonAck))?;
            }
            MessageType::Failure => return Err(failure_to_error(&response)),
            _ => return Ok(response),
        }
    }
    Err(WalletError::TransportError("too many button requests".to_string()))
}

fn expect(response: TrezorMessage, expected: MessageType) -> Result<ProtoFields, WalletError> {
    if response.msg_type != expected {
        return Err(WalletError::TransportError(format!(
            "expected {:?}, device answered {:?}",
            expected, response.msg_type
        )));
    }
    response.fields()
}

fn parse_address(fields: &ProtoFields) -> Result<Address, WalletError> {
    if let Some(text) = fields.string(2) {
        return Address::from_str(&text)
            .map_err(|_| WalletError::TransportError(format!("malformed address from device: {}", text)));
    }
    // Firmware before 2.0 sent raw bytes in field 1.
    match fields.bytes(1) {
        Some(raw) if raw.len() == 20 => Ok(Address::from_slice(raw)),
        _ => Err(WalletError::TransportError("EthereumAddress without address".to_string())),
    }
}

/// Uncompressed public key from an `EthereumPublicKey.node`.
fn parse_public_key(fields: &ProtoFields) -> Result<Vec<u8>, WalletError> {
    let node = fields
        .bytes(1)
        .ok_or_else(|| WalletError::TransportError("EthereumPublicKey without node".to_string()))?;
    let node = ProtoFields::parse(node)?;
    let compressed = node
        .bytes(6)
        .ok_or_else(|| WalletError::TransportError("HD node without public key".to_string()))?;
    let key = k256::PublicKey::from_sec1_bytes(compressed)
        .map_err(|e| WalletError::TransportError(format!("invalid public key from device: {}", e)))?;
    Ok(key.to_encoded_point(false).as_bytes().to_vec())
}

/// Trezor hardware wallet
pub struct TrezorWallet {
    device_id: String,
    transport: Arc<dyn TrezorTransport>,
    connected: AtomicBool,
    session: RwLock<Option<TrezorSession>>,
    device_info: RwLock<Option<DeviceInfo>>,
    io_lock: Arc<Mutex<()>>,
}

impl TrezorWallet {
    pub fn new(device_id: impl Into<String>, transport: Arc<dyn TrezorTransport>) -> Self {
        Self {
            device_id: device_id.into(),
            transport,
            connected: AtomicBool::new(false),
            session: RwLock::new(None),
            device_info: RwLock::new(None),
            io_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Current session, if connected.
    pub fn session(&self) -> Option<TrezorSession> {
        self.session.read().clone()
    }

    fn ensure_connected(&self) -> Result<(), WalletError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WalletError::NotConnected(self.device_id.clone()))
        }
    }

    fn touch_session(&self) {
        if let Some(session) = self.session.write().as_mut() {
            session.last_used = Utc::now();
        }
    }

    fn prepare(&self, path: &str) -> Result<Bip44Path, WalletError> {
        self.ensure_connected()?;
        let path = path.parse()?;
        self.touch_session();
        Ok(path)
    }

    async fn call(&self, request: TrezorMessage, expected: MessageType) -> Result<ProtoFields, WalletError> {
        let transport = self.transport.clone();
        run_exclusive(&self.io_lock, move || expect(call_confirmed(transport.as_ref(), &request)?, expected)).await
    }

    fn open_session(device_id: &str, transport: &dyn TrezorTransport) -> Result<(TrezorSession, DeviceInfo), WalletError> {
        transport.connect().map_err(|e| match e {
            WalletError::ConnectionFailed(_) => e,
            other => WalletError::ConnectionFailed(other.to_string()),
        })?;

        let fields = transport
            .call(&TrezorMessage::empty(MessageType::Initialize))
            .and_then(|response| expect(response, MessageType::Features))
            .map_err(|e| WalletError::ConnectionFailed(format!("Trezor handshake failed: {}", e)))?;
        let features = Features::parse(&fields);

        let serial_number = if features.device_id.is_empty() {
            device_id.to_string()
        } else {
            features.device_id.clone()
        };
        let info = DeviceInfo {
            wallet_type: HardwareWalletType::Trezor,
            model: features.model_name(),
            serial_number,
            firmware_version: features.firmware_version(),
            is_locked: !features.unlocked,
            is_initialized: features.initialized,
            label: features.label.clone(),
            supported_apps: vec!["Ethereum".to_string(), "Bitcoin".to_string()],
        };
        let now = Utc::now();
        let session = TrezorSession {
            session_id: Uuid::new_v4().to_string(),
            started_at: now,
            last_used: now,
            features,
        };
        Ok((session, info))
    }
}

#[async_trait]
impl HardwareWallet for TrezorWallet {
    async fn connect(&self) -> Result<(), WalletError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!("Connecting Trezor {}", self.device_id);

        let transport = self.transport.clone();
        let device_id = self.device_id.clone();
        let (session, info) =
            run_exclusive(&self.io_lock, move || Self::open_session(&device_id, transport.as_ref())).await?;

        info!(
            "Trezor {} connected: {} firmware {} (session {})",
            self.device_id, info.model, info.firmware_version, session.session_id
        );
        *self.session.write() = Some(session);
        *self.device_info.write() = Some(info);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WalletError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.write().take();
        self.device_info.write().take();
        let transport = self.transport.clone();
        run_exclusive(&self.io_lock, move || transport.disconnect()).await?;
        info!("Trezor {} disconnected", self.device_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn get_device_info(&self) -> Result<DeviceInfo, WalletError> {
        self.ensure_connected()?;
        self.touch_session();
        self.device_info
            .read()
            .clone()
            .ok_or_else(|| WalletError::NotConnected(self.device_id.clone()))
    }

    async fn get_address(&self, path: &str) -> Result<String, WalletError> {
        let path = self.prepare(path)?;
        let mut payload = encode_bip32_path(&path.to_derivation_path());
        payload.extend(encode_bool_field(2, false));

        let fields = self
            .call(TrezorMessage::new(MessageType::EthereumGetAddress, payload), MessageType::EthereumAddress)
            .await?;
        Ok(checksum_address(&parse_address(&fields)?))
    }

    async fn get_public_key(&self, path: &str) -> Result<Vec<u8>, WalletError> {
        let path = self.prepare(path)?;
        let mut payload = encode_bip32_path(&path.to_derivation_path());
        payload.extend(encode_bool_field(2, false));

        let fields = self
            .call(TrezorMessage::new(MessageType::EthereumGetPublicKey, payload), MessageType::EthereumPublicKey)
            .await?;
        parse_public_key(&fields)
    }

    async fn sign_transaction(
        &self,
        tx: &TypedTransaction,
        path: &str,
    ) -> Result<SignedTransaction, WalletError> {
        let path = self.prepare(path)?;
        let (tx, chain_id) = with_chain_id(tx);
        let (request, rest) = sign_tx_request(&tx, &path, chain_id)?;
        info!("Trezor {} signing transaction on chain {}", self.device_id, chain_id);

        let transport = self.transport.clone();
        let (v, r, s) = run_exclusive(&self.io_lock, move || {
            let mut remaining = rest.as_slice();
            let mut response = call_confirmed(transport.as_ref(), &request)?;
            loop {
                let fields = expect(response, MessageType::EthereumTxRequest)?;
                match fields.uint(1) {
                    Some(requested) if requested > 0 => {
                        let take = (requested as usize).min(remaining.len()).min(MAX_DATA_CHUNK);
                        if take == 0 {
                            return Err(WalletError::TransportError(
                                "device requested more calldata than the transaction has".to_string(),
                            ));
                        }
                        let (chunk, tail) = remaining.split_at(take);
                        remaining = tail;
                        debug!("streaming {} calldata bytes, {} left", chunk.len(), remaining.len());
                        let ack = TrezorMessage::new(MessageType::EthereumTxAck, encode_bytes_field(1, chunk));
                        response = call_confirmed(transport.as_ref(), &ack)?;
                    }
                    _ => {
                        let v = fields.uint(2);
                        let r = fields.bytes(3).map(<[u8]>::to_vec);
                        let s = fields.bytes(4).map(<[u8]>::to_vec);
                        return match (v, r, s) {
                            (Some(v), Some(r), Some(s)) if r.len() <= 32 && s.len() <= 32 => Ok((v, r, s)),
                            _ => Err(WalletError::TransportError(
                                "EthereumTxRequest without a complete signature".to_string(),
                            )),
                        };
                    }
                }
            }
        })
        .await?;

        Ok(SignedTransaction {
            transaction: tx,
            signature: signature_from_parts(&r, &s, eip155_v(parity_from_v(v), chain_id)),
        })
    }

    async fn sign_message(&self, message: &[u8], path: &str) -> Result<Vec<u8>, WalletError> {
        let path = self.prepare(path)?;
        info!("Trezor {} signing message of {} bytes", self.device_id, message.len());
        let mut payload = encode_bip32_path(&path.to_derivation_path());
        payload.extend(encode_bytes_field(2, message));

        let fields = self
            .call(
                TrezorMessage::new(MessageType::EthereumSignMessage, payload),
                MessageType::EthereumMessageSignature,
            )
            .await?;
        let signature = fields
            .bytes(2)
            .filter(|sig| sig.len() == 65)
            .ok_or_else(|| WalletError::TransportError("malformed message signature".to_string()))?;
        Ok(message_signature_bytes(&signature[..32], &signature[32..64], parity_from_v(signature[64] as u64)))
    }

    fn wallet_type(&self) -> HardwareWalletType {
        HardwareWalletType::Trezor
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Eip1559TransactionRequest, TransactionRequest};

    #[test]
    fn test_u256_minimal_bytes() {
        assert_eq!(u256_bytes(None), Vec::<u8>::new());
        assert_eq!(u256_bytes(Some(U256::zero())), Vec::<u8>::new());
        assert_eq!(u256_bytes(Some(U256::from(0x0102u64))), vec![0x01, 0x02]);
    }

    #[test]
    fn test_features_defaults() {
        let features = Features::parse(&ProtoFields::default());
        assert!(features.unlocked);
        assert_eq!(features.model_name(), "Trezor One");
        assert_eq!(features.firmware_version(), "0.0.0");
    }

    #[test]
    fn test_failure_mapping() {
        let mut payload = encode_uint64_field(1, failure_code::ACTION_CANCELLED);
        payload.extend(encode_string_field(2, "Action cancelled by user"));
        let err = failure_to_error(&TrezorMessage::new(MessageType::Failure, payload));
        assert_eq!(err, WalletError::UserRejected("Action cancelled by user".to_string()));

        let payload = encode_uint64_field(1, failure_code::FIRMWARE_ERROR);
        let err = failure_to_error(&TrezorMessage::new(MessageType::Failure, payload));
        assert!(matches!(err, WalletError::TransportError(msg) if msg.contains("99")));
    }

    #[test]
    fn test_sign_request_splits_calldata() {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(Address::repeat_byte(0x11))
            .data(vec![0xAB; 2500])
            .chain_id(1u64)
            .into();
        let (request, rest) = sign_tx_request(&tx, &Bip44Path::ethereum_default(), 1).unwrap();
        assert_eq!(request.msg_type, MessageType::EthereumSignTx);
        assert_eq!(rest.len(), 2500 - MAX_DATA_CHUNK);

        let fields = request.fields().unwrap();
        assert_eq!(fields.bytes(7).map(|d| d.len()), Some(MAX_DATA_CHUNK));
        assert_eq!(fields.uint(8), Some(2500));
        assert_eq!(fields.uint(9), Some(1));
        assert_eq!(fields.repeated_uint(1).len(), 5);
    }

    #[test]
    fn test_sign_request_rejects_access_list_and_ens() {
        let mut req = Eip1559TransactionRequest::new().chain_id(1u64);
        req.access_list = ethers::types::transaction::eip2930::AccessList(vec![
            ethers::types::transaction::eip2930::AccessListItem {
                address: Address::zero(),
                storage_keys: vec![],
            },
        ]);
        let tx: TypedTransaction = req.into();
        assert!(sign_tx_request(&tx, &Bip44Path::ethereum_default(), 1).is_err());

        let tx: TypedTransaction = TransactionRequest::new()
            .to(NameOrAddress::Name("vitalik.eth".to_string()))
            .into();
        assert!(sign_tx_request(&tx, &Bip44Path::ethereum_default(), 1).is_err());
    }
}
