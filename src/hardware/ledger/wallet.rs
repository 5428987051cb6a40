//! Ledger wallet on top of an APDU transport

use super::apdu::{chunked_commands, ApduClass, ApduCommand, ApduInstruction, ApduResponse};
use super::transport::{exchange_command, LedgerTransport};
use crate::core::bip44::Bip44Path;
use crate::core::errors::WalletError;
use crate::hardware::types::{
    checksum_address, eip155_v, message_signature_bytes, parity_from_v, signature_from_parts,
    with_chain_id, DeviceInfo, HardwareWalletType, SignedTransaction,
};
use crate::hardware::{run_exclusive, HardwareWallet};
use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::Address;
use parking_lot::RwLock;
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name the dashboard reports while the Ethereum app is open.
pub const ETHEREUM_APP_NAME: &str = "Ethereum";

/// Running app as reported by the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAppInfo {
    pub name: String,
    pub version: String,
    pub flags: u8,
}

impl LedgerAppInfo {
    /// Parse `format(1) name_len name version_len version flags_len flags`.
    pub fn parse(data: &[u8]) -> Result<Self, WalletError> {
        let malformed = || WalletError::TransportError("malformed app info response".to_string());

        let mut offset = 1;
        let name_len = *data.get(offset).ok_or_else(malformed)? as usize;
        offset += 1;
        let name = data.get(offset..offset + name_len).ok_or_else(malformed)?;
        offset += name_len;
        let version_len = *data.get(offset).ok_or_else(malformed)? as usize;
        offset += 1;
        let version = data.get(offset..offset + version_len).ok_or_else(malformed)?;
        offset += version_len;
        let flags = match data.get(offset) {
            Some(&len) if len > 0 => data.get(offset + 1).copied().unwrap_or(0),
            _ => 0,
        };

        Ok(Self {
            name: String::from_utf8_lossy(name).to_string(),
            version: String::from_utf8_lossy(version).to_string(),
            flags,
        })
    }
}

/// GET_APP_CONFIGURATION answer of the Ethereum app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthAppConfiguration {
    pub flags: u8,
    pub version: String,
}

impl EthAppConfiguration {
    /// Parse `flags major minor patch`.
    pub fn parse(data: &[u8]) -> Result<Self, WalletError> {
        match data {
            [flags, major, minor, patch, ..] => Ok(Self {
                flags: *flags,
                version: format!("{}.{}.{}", major, minor, patch),
            }),
            _ => Err(WalletError::TransportError(format!(
                "app configuration too short: {} bytes",
                data.len()
            ))),
        }
    }

    /// Bit 0 of the flags.
    pub fn blind_signing_enabled(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// Split a GET_ETH_PUBLIC_ADDRESS response into public key and address.
///
/// Layout: `pk_len pk addr_len addr_ascii_hex [chain_code]`. The address is
/// cross-checked against the public key.
pub fn parse_address_response(data: &[u8]) -> Result<(Vec<u8>, Address), WalletError> {
    let malformed = |what: &str| WalletError::TransportError(format!("malformed address response: {}", what));

    let pk_len = *data.first().ok_or_else(|| malformed("empty"))? as usize;
    let public_key = data.get(1..1 + pk_len).ok_or_else(|| malformed("public key truncated"))?;
    let offset = 1 + pk_len;
    let addr_len = *data.get(offset).ok_or_else(|| malformed("address length missing"))? as usize;
    let addr_ascii = data
        .get(offset + 1..offset + 1 + addr_len)
        .ok_or_else(|| malformed("address truncated"))?;

    let addr_hex = std::str::from_utf8(addr_ascii).map_err(|_| malformed("address not ascii"))?;
    let addr_hex = addr_hex.trim_start_matches("0x");
    let raw = hex::decode(addr_hex).map_err(|_| malformed("address not hex"))?;
    if raw.len() != 20 {
        return Err(malformed("address length"));
    }
    let address = Address::from_slice(&raw);

    if public_key.len() == 65 {
        let derived = Address::from_slice(&Keccak256::digest(&public_key[1..])[12..]);
        if derived != address {
            return Err(WalletError::TransportError(
                "device returned an address that does not match its public key".to_string(),
            ));
        }
    }

    Ok((public_key.to_vec(), address))
}

/// Split a signing response `v r s` into its parts.
fn parse_signature_response(data: &[u8]) -> Result<(u8, [u8; 32], [u8; 32]), WalletError> {
    if data.len() < 65 {
        return Err(WalletError::TransportError(format!(
            "signature response too short: {} bytes",
            data.len()
        )));
    }
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&data[1..33]);
    s.copy_from_slice(&data[33..65]);
    Ok((data[0], r, s))
}

/// Recover y-parity from the one-byte `v` the Ethereum app returns.
///
/// For legacy transactions the app returns the low byte of the EIP-155 value,
/// which cannot be decoded without the chain id.
fn transaction_parity(v: u8, chain_id: u64, legacy: bool) -> u8 {
    if legacy {
        let base = (chain_id.wrapping_mul(2).wrapping_add(35) & 0xFF) as u8;
        let delta = v.wrapping_sub(base);
        if delta <= 1 && !matches!(v, 0 | 1 | 27 | 28) {
            return delta;
        }
    }
    parity_from_v(v as u64)
}

/// Ledger hardware wallet
pub struct LedgerWallet {
    device_id: String,
    transport: Arc<dyn LedgerTransport>,
    connected: AtomicBool,
    device_info: RwLock<Option<DeviceInfo>>,
    io_lock: Arc<Mutex<()>>,
}

impl LedgerWallet {
    pub fn new(device_id: impl Into<String>, transport: Arc<dyn LedgerTransport>) -> Self {
        Self {
            device_id: device_id.into(),
            transport,
            connected: AtomicBool::new(false),
            device_info: RwLock::new(None),
            io_lock: Arc::new(Mutex::new(())),
        }
    }

    fn ensure_connected(&self) -> Result<(), WalletError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WalletError::NotConnected(self.device_id.clone()))
        }
    }

    /// Connection check then path validation, both before any device I/O.
    fn prepare(&self, path: &str) -> Result<Bip44Path, WalletError> {
        self.ensure_connected()?;
        path.parse()
    }

    /// Send a payload split over several APDUs and return the last response.
    async fn send_chunked(&self, ins: ApduInstruction, payload: Vec<u8>) -> Result<Vec<u8>, WalletError> {
        let transport = self.transport.clone();
        run_exclusive(&self.io_lock, move || {
            let commands = chunked_commands(ApduClass::Standard, ins, &payload);
            let count = commands.len();
            debug!("sending {} APDU chunk(s) for INS={:02X}", count, ins as u8);
            let mut last = Vec::new();
            for command in &commands {
                last = exchange_command(transport.as_ref(), command)?.into_result()?;
            }
            Ok(last)
        })
        .await
    }

    async fn request_address(&self, path: &Bip44Path) -> Result<(Vec<u8>, Address), WalletError> {
        let command = ApduCommand::new(
            ApduClass::Standard,
            ApduInstruction::GetEthPublicAddress,
            0x00, // no on-screen confirmation
            0x00, // no chain code
            path.to_bytes(),
        );
        let transport = self.transport.clone();
        let data = run_exclusive(&self.io_lock, move || {
            exchange_command(transport.as_ref(), &command)?.into_result()
        })
        .await?;
        parse_address_response(&data)
    }

    fn log_app_configuration(transport: &dyn LedgerTransport) {
        let command = ApduCommand::new(
            ApduClass::Standard,
            ApduInstruction::GetAppConfiguration,
            0x00,
            0x00,
            Vec::new(),
        );
        match exchange_command(transport, &command)
            .and_then(ApduResponse::into_result)
            .and_then(|data| EthAppConfiguration::parse(&data))
        {
            Ok(config) => debug!(
                "Ethereum app configuration: version {}, blind signing {}",
                config.version,
                if config.blind_signing_enabled() { "enabled" } else { "disabled" }
            ),
            Err(e) => warn!("Cannot read Ethereum app configuration: {}", e),
        }
    }

    fn open_session(transport: &dyn LedgerTransport) -> Result<DeviceInfo, WalletError> {
        transport.connect().map_err(|e| match e {
            WalletError::ConnectionFailed(_) => e,
            other => WalletError::ConnectionFailed(other.to_string()),
        })?;

        let probe = ApduCommand::new(ApduClass::Dashboard, ApduInstruction::GetAppAndVersion, 0, 0, Vec::new());
        match exchange_command(transport, &probe).and_then(ApduResponse::into_result) {
            Ok(data) => match LedgerAppInfo::parse(&data) {
                Ok(app) if app.name == ETHEREUM_APP_NAME => {
                    info!("Ledger app: {} v{}", app.name, app.version);
                    Self::log_app_configuration(transport);
                }
                Ok(app) => warn!(
                    "Ledger is running {} v{}, open the {} app before signing",
                    app.name, app.version, ETHEREUM_APP_NAME
                ),
                Err(e) => warn!("Cannot parse Ledger app info: {}", e),
            },
            Err(e) => warn!("Cannot query Ledger app: {}", e),
        }

        transport.device_info()
    }
}

#[async_trait]
impl HardwareWallet for LedgerWallet {
    async fn connect(&self) -> Result<(), WalletError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!("Connecting Ledger {}", self.device_id);

        let transport = self.transport.clone();
        let info = run_exclusive(&self.io_lock, move || Self::open_session(transport.as_ref())).await?;

        *self.device_info.write() = Some(info);
        self.connected.store(true, Ordering::SeqCst);
        info!("Ledger {} connected", self.device_id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WalletError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.device_info.write().take();
        let transport = self.transport.clone();
        run_exclusive(&self.io_lock, move || transport.disconnect()).await?;
        info!("Ledger {} disconnected", self.device_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn get_device_info(&self) -> Result<DeviceInfo, WalletError> {
        self.ensure_connected()?;
        self.device_info
            .read()
            .clone()
            .ok_or_else(|| WalletError::NotConnected(self.device_id.clone()))
    }

    async fn get_address(&self, path: &str) -> Result<String, WalletError> {
        let path = self.prepare(path)?;
        let (_, address) = self.request_address(&path).await?;
        Ok(checksum_address(&address))
    }

    async fn get_public_key(&self, path: &str) -> Result<Vec<u8>, WalletError> {
        let path = self.prepare(path)?;
        let (public_key, _) = self.request_address(&path).await?;
        Ok(public_key)
    }

    async fn sign_transaction(
        &self,
        tx: &TypedTransaction,
        path: &str,
    ) -> Result<SignedTransaction, WalletError> {
        let path = self.prepare(path)?;
        let (tx, chain_id) = with_chain_id(tx);
        let legacy = matches!(tx, TypedTransaction::Legacy(_));
        info!("Ledger {} signing transaction on chain {}", self.device_id, chain_id);

        let mut payload = path.to_bytes();
        payload.extend_from_slice(&tx.rlp());

        let data = self.send_chunked(ApduInstruction::SignTransaction, payload).await?;
        let (v, r, s) = parse_signature_response(&data)?;
        let parity = transaction_parity(v, chain_id, legacy);

        Ok(SignedTransaction {
            transaction: tx,
            signature: signature_from_parts(&r, &s, eip155_v(parity, chain_id)),
        })
    }

    async fn sign_message(&self, message: &[u8], path: &str) -> Result<Vec<u8>, WalletError> {
        let path = self.prepare(path)?;
        info!("Ledger {} signing message of {} bytes", self.device_id, message.len());

        let mut payload = path.to_bytes();
        payload.extend_from_slice(&(message.len() as u32).to_be_bytes());
        payload.extend_from_slice(message);

        let data = self.send_chunked(ApduInstruction::SignPersonalMessage, payload).await?;
        let (v, r, s) = parse_signature_response(&data)?;
        Ok(message_signature_bytes(&r, &s, parity_from_v(v as u64)))
    }

    fn wallet_type(&self) -> HardwareWalletType {
        HardwareWalletType::Ledger
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_info_parsing() {
        let mut data = vec![0x01, 8];
        data.extend_from_slice(b"Ethereum");
        data.push(5);
        data.extend_from_slice(b"1.9.0");
        data.extend_from_slice(&[1, 0x02]);

        let app = LedgerAppInfo::parse(&data).unwrap();
        assert_eq!(app.name, "Ethereum");
        assert_eq!(app.version, "1.9.0");
        assert_eq!(app.flags, 0x02);

        assert!(LedgerAppInfo::parse(&[0x01, 10, b'E']).is_err());
    }

    #[test]
    fn test_app_configuration_parsing() {
        let config = EthAppConfiguration::parse(&[0x03, 1, 10, 3]).unwrap();
        assert_eq!(config.version, "1.10.3");
        assert!(config.blind_signing_enabled());
        assert!(!EthAppConfiguration::parse(&[0x02, 1, 10, 3]).unwrap().blind_signing_enabled());
        assert!(EthAppConfiguration::parse(&[0x02, 1]).is_err());
    }

    #[test]
    fn test_address_response_rejects_truncation() {
        assert!(parse_address_response(&[]).is_err());
        assert!(parse_address_response(&[65, 0x04]).is_err());
    }

    #[test]
    fn test_address_response_without_public_key_check() {
        let mut data = vec![0];
        data.push(40);
        data.extend_from_slice(b"5aaeb6053f3e94c9b9a09f33669435e7ef1beaed");
        let (pk, address) = parse_address_response(&data).unwrap();
        assert!(pk.is_empty());
        assert_eq!(checksum_address(&address), "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed");
    }

    #[test]
    fn test_transaction_parity() {
        // chain 1: EIP-155 base 37
        assert_eq!(transaction_parity(37, 1, true), 0);
        assert_eq!(transaction_parity(38, 1, true), 1);
        // chain 137: 309 & 0xFF = 53
        assert_eq!(transaction_parity(54, 137, true), 1);
        // typed transactions carry the raw parity
        assert_eq!(transaction_parity(1, 1, false), 1);
        assert_eq!(transaction_parity(28, 1, false), 1);
        assert_eq!(transaction_parity(27, 1, true), 0);
    }

    #[test]
    fn test_signature_response_too_short() {
        assert!(parse_signature_response(&[0u8; 64]).is_err());
        let mut data = vec![27u8];
        data.extend_from_slice(&[1u8; 32]);
        data.extend_from_slice(&[2u8; 32]);
        let (v, r, s) = parse_signature_response(&data).unwrap();
        assert_eq!(v, 27);
        assert_eq!(r, [1u8; 32]);
        assert_eq!(s, [2u8; 32]);
    }
}
