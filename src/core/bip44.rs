//! BIP44 derivation paths
//!
//! Path format: m/44'/coin_type'/account'/change/address_index
//!
//! Every wallet validates its path input here before any device I/O. The
//! parsed form is only used to encode the path for the wire; nothing is cached.

use crate::core::errors::WalletError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Hardened derivation flag.
pub const HARDENED: u32 = 0x8000_0000;

/// BIP44 purpose field.
pub const BIP44_PURPOSE: u32 = 44;

static BIP44_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^m/44'/(\d+)'/(\d+)'/([01])/(\d+)$").expect("Hardcoded regex should always compile")
});

/// BIP44 derivation path structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bip44Path {
    /// Cryptocurrency type (60=ETH, 0=BTC)
    pub coin_type: u32,
    /// Account index
    pub account: u32,
    /// External/internal chain (0=external, 1=internal change)
    pub change: u32,
    /// Address index within the chain
    pub address_index: u32,
}

impl Bip44Path {
    /// Create default Ethereum path: m/44'/60'/0'/0/0
    pub fn ethereum_default() -> Self {
        Self {
            coin_type: 60,
            account: 0,
            change: 0,
            address_index: 0,
        }
    }

    /// Generate complete derivation path indices
    pub fn to_derivation_path(&self) -> Vec<u32> {
        vec![
            HARDENED | BIP44_PURPOSE,
            HARDENED | self.coin_type,
            HARDENED | self.account,
            self.change,
            self.address_index,
        ]
    }

    /// Wire form used by APDU commands: depth byte, then each index big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let indices = self.to_derivation_path();
        let mut bytes = Vec::with_capacity(1 + indices.len() * 4);
        bytes.push(indices.len() as u8);
        for index in indices {
            bytes.extend_from_slice(&index.to_be_bytes());
        }
        bytes
    }
}

impl FromStr for Bip44Path {
    type Err = WalletError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let caps = BIP44_PATTERN.captures(path).ok_or_else(|| {
            WalletError::InvalidDerivationPath(format!(
                "invalid BIP44 derivation path format: {}",
                path
            ))
        })?;

        // Indices at or above 2^31 would alias the hardened range.
        let field = |i: usize| -> Result<u32, WalletError> {
            match caps[i].parse::<u32>() {
                Ok(value) if value < HARDENED => Ok(value),
                _ => Err(WalletError::InvalidDerivationPath(format!(
                    "index {} out of range in {}",
                    &caps[i], path
                ))),
            }
        };

        Ok(Self {
            coin_type: field(1)?,
            account: field(2)?,
            change: field(3)?,
            address_index: field(4)?,
        })
    }
}

impl fmt::Display for Bip44Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/44'/{}'/{}'/{}/{}",
            self.coin_type, self.account, self.change, self.address_index
        )
    }
}

/// Validates a BIP44 derivation path.
pub fn validate_derivation_path(path: &str) -> Result<(), WalletError> {
    path.parse::<Bip44Path>().map(|_| ())
}
