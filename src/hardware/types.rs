//! Records shared by every vendor: wallet kind, device snapshot, signed transaction.

use crate::core::errors::WalletError;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported hardware wallet vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareWalletType {
    /// APDU command/response protocol
    Ledger,
    /// Typed message protocol
    Trezor,
}

impl HardwareWalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareWalletType::Ledger => "ledger",
            HardwareWalletType::Trezor => "trezor",
        }
    }
}

impl fmt::Display for HardwareWalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HardwareWalletType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ledger" => Ok(HardwareWalletType::Ledger),
            "trezor" => Ok(HardwareWalletType::Trezor),
            other => Err(WalletError::UnsupportedWalletType(other.to_string())),
        }
    }
}

/// Device information, captured once per connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub wallet_type: HardwareWalletType,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub is_locked: bool,
    pub is_initialized: bool,
    pub label: String,
    pub supported_apps: Vec<String>,
}

/// A transaction together with the signature produced by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedTransaction {
    pub transaction: TypedTransaction,
    pub signature: Signature,
}

impl SignedTransaction {
    /// RLP encoding ready for `eth_sendRawTransaction`.
    pub fn raw(&self) -> Bytes {
        self.transaction.rlp_signed(&self.signature)
    }

    pub fn hash(&self) -> H256 {
        H256::from(keccak256(self.raw()))
    }

    /// Recover the account that produced the signature.
    pub fn signer(&self) -> Result<Address, WalletError> {
        self.signature
            .recover(self.transaction.sighash())
            .map_err(|e| WalletError::TransportError(format!("unrecoverable signature: {}", e)))
    }
}

/// EIP-55 checksummed, `0x`-prefixed address.
pub fn checksum_address(address: &Address) -> String {
    ethers::utils::to_checksum(address, None)
}

/// Chain id assumed when a transaction does not carry one.
pub const DEFAULT_CHAIN_ID: u64 = 1;

/// Clone `tx` with its chain id pinned, so the device signs with replay protection.
pub(crate) fn with_chain_id(tx: &TypedTransaction) -> (TypedTransaction, u64) {
    let mut tx = tx.clone();
    let chain_id = match tx.chain_id() {
        Some(id) => id.as_u64(),
        None => {
            tracing::debug!("transaction has no chain id, assuming {}", DEFAULT_CHAIN_ID);
            tx.set_chain_id(DEFAULT_CHAIN_ID);
            DEFAULT_CHAIN_ID
        }
    };
    (tx, chain_id)
}

/// y-parity carried by a `v` value in any of the conventions devices use:
/// raw parity, 27/28, or EIP-155.
pub(crate) fn parity_from_v(v: u64) -> u8 {
    match v {
        0 | 1 => v as u8,
        27 | 28 => (v - 27) as u8,
        v if v >= 35 => ((v - 35) % 2) as u8,
        other => (other & 1) as u8,
    }
}

/// EIP-155 `v`.
pub(crate) fn eip155_v(parity: u8, chain_id: u64) -> u64 {
    parity as u64 + 35 + 2 * chain_id
}

pub(crate) fn signature_from_parts(r: &[u8], s: &[u8], v: u64) -> Signature {
    Signature {
        r: U256::from_big_endian(r),
        s: U256::from_big_endian(s),
        v,
    }
}

/// 65-byte `r || s || v` with `v` in 27/28 form, as wallets expect for
/// personal message signatures.
pub(crate) fn message_signature_bytes(r: &[u8], s: &[u8], parity: u8) -> Vec<u8> {
    signature_from_parts(r, s, 27 + parity as u64).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_type_parsing() {
        assert_eq!("Ledger".parse::<HardwareWalletType>().unwrap(), HardwareWalletType::Ledger);
        assert_eq!(" trezor ".parse::<HardwareWalletType>().unwrap(), HardwareWalletType::Trezor);
        assert!(matches!(
            "keepkey".parse::<HardwareWalletType>(),
            Err(WalletError::UnsupportedWalletType(v)) if v == "keepkey"
        ));
    }

    #[test]
    fn test_device_info_field_names() {
        let info = DeviceInfo {
            wallet_type: HardwareWalletType::Ledger,
            model: "Nano S Plus".to_string(),
            serial_number: "dev1".to_string(),
            firmware_version: "1.0.3".to_string(),
            is_locked: false,
            is_initialized: true,
            label: "My Ledger".to_string(),
            supported_apps: vec!["Ethereum".to_string()],
        };
        let value = serde_json::to_value(&info).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "firmware_version",
                "is_initialized",
                "is_locked",
                "label",
                "model",
                "serial_number",
                "supported_apps",
                "type"
            ]
        );
        assert_eq!(value["type"], "ledger");
    }

    #[test]
    fn test_parity_conventions() {
        assert_eq!(parity_from_v(0), 0);
        assert_eq!(parity_from_v(1), 1);
        assert_eq!(parity_from_v(27), 0);
        assert_eq!(parity_from_v(28), 1);
        assert_eq!(parity_from_v(37), 0);
        assert_eq!(parity_from_v(38), 1);
        assert_eq!(parity_from_v(eip155_v(1, 137)), 1);
        assert_eq!(eip155_v(0, 1), 37);
    }

    #[test]
    fn test_chain_id_defaults_to_mainnet() {
        let tx: TypedTransaction = ethers::types::TransactionRequest::new().nonce(1).into();
        let (pinned, chain_id) = with_chain_id(&tx);
        assert_eq!(chain_id, DEFAULT_CHAIN_ID);
        assert_eq!(pinned.chain_id().map(|c| c.as_u64()), Some(DEFAULT_CHAIN_ID));

        let tx: TypedTransaction = ethers::types::TransactionRequest::new().chain_id(56u64).into();
        assert_eq!(with_chain_id(&tx).1, 56);
    }

    #[test]
    fn test_message_signature_layout() {
        let bytes = message_signature_bytes(&[0x11; 32], &[0x22; 32], 1);
        assert_eq!(bytes.len(), 65);
        assert_eq!(bytes[0], 0x11);
        assert_eq!(bytes[32], 0x22);
        assert_eq!(bytes[64], 28);
    }

    #[test]
    fn test_checksum_address() {
        let address: Address = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed".parse().unwrap();
        assert_eq!(checksum_address(&address), "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed");
    }
}
