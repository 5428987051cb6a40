//! Software stand-in for a device secure element.
//!
//! The synthetic Ledger and Trezor transports use this to answer requests the
//! way a real device would: a per-device seed, one secp256k1 key per
//! derivation path, recoverable signatures over the digest the device signs.
//! Keys are derived with keccak over seed and path indices, not BIP32, so
//! addresses do not match a real device holding the same seed.

use crate::core::errors::WalletError;
use ethers::types::Address;
use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};
use std::time::Duration;

/// Keys and signatures for one synthetic device.
#[derive(Clone)]
pub struct SoftwareSecureElement {
    seed: [u8; 32],
}

/// Recoverable ECDSA signature as produced on-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    /// y-parity of R, 0 or 1
    pub parity: u8,
}

pub(crate) fn keccak(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

impl SoftwareSecureElement {
    /// Seed derived from the device identifier so every run sees the same keys.
    pub fn for_device(device_id: &str) -> Self {
        Self {
            seed: keccak(format!("simulated-secure-element/{}", device_id).as_bytes()),
        }
    }

    fn signing_key(&self, path: &[u32]) -> Result<SigningKey, WalletError> {
        let mut material = self.seed.to_vec();
        for index in path {
            material.extend_from_slice(&index.to_be_bytes());
        }
        let mut candidate = keccak(&material);
        // A digest outside the curve order is astronomically unlikely; rehash if it happens.
        for _ in 0..8 {
            if let Ok(key) = SigningKey::from_slice(&candidate) {
                return Ok(key);
            }
            candidate = keccak(&candidate);
        }
        Err(WalletError::TransportError("secure element failed to derive key".to_string()))
    }

    /// Uncompressed SEC1 public key (65 bytes, leading 0x04).
    pub fn public_key(&self, path: &[u32]) -> Result<Vec<u8>, WalletError> {
        let key = self.signing_key(path)?;
        Ok(key.verifying_key().to_encoded_point(false).as_bytes().to_vec())
    }

    /// Compressed SEC1 public key (33 bytes).
    pub fn compressed_public_key(&self, path: &[u32]) -> Result<Vec<u8>, WalletError> {
        let key = self.signing_key(path)?;
        Ok(key.verifying_key().to_encoded_point(true).as_bytes().to_vec())
    }

    pub fn address(&self, path: &[u32]) -> Result<Address, WalletError> {
        let public_key = self.public_key(path)?;
        Ok(Address::from_slice(&keccak(&public_key[1..])[12..]))
    }

    pub fn sign_digest(&self, path: &[u32], digest: &[u8; 32]) -> Result<RawSignature, WalletError> {
        let key = self.signing_key(path)?;
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(digest)
            .map_err(|e| WalletError::TransportError(format!("secure element signing failed: {}", e)))?;
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(RawSignature {
            r,
            s,
            parity: recovery_id.to_byte() & 1,
        })
    }
}

/// Knobs shared by the synthetic transports.
#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    /// Added to every connect and every exchange.
    pub latency: Option<Duration>,
    /// Answer signing requests with the vendor's "denied by user" status.
    pub reject_signing: bool,
    /// Fail `connect` as if the device were unplugged.
    pub fail_connect: bool,
}

impl SimulationOptions {
    pub(crate) fn pause(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bip44::Bip44Path;

    fn path(index: u32) -> Vec<u32> {
        Bip44Path { address_index: index, ..Bip44Path::ethereum_default() }.to_derivation_path()
    }

    #[test]
    fn test_keys_are_deterministic() {
        let a = SoftwareSecureElement::for_device("dev1");
        let b = SoftwareSecureElement::for_device("dev1");
        assert_eq!(a.address(&path(0)).unwrap(), b.address(&path(0)).unwrap());
        assert_ne!(a.address(&path(0)).unwrap(), a.address(&path(1)).unwrap());

        let other = SoftwareSecureElement::for_device("dev2");
        assert_ne!(a.address(&path(0)).unwrap(), other.address(&path(0)).unwrap());
    }

    #[test]
    fn test_public_key_shapes() {
        let se = SoftwareSecureElement::for_device("dev1");
        let full = se.public_key(&path(0)).unwrap();
        let compressed = se.compressed_public_key(&path(0)).unwrap();
        assert_eq!(full.len(), 65);
        assert_eq!(full[0], 0x04);
        assert_eq!(compressed.len(), 33);
        assert_eq!(&full[1..33], &compressed[1..]);
    }

    #[test]
    fn test_signature_recovers_to_address() {
        let se = SoftwareSecureElement::for_device("dev1");
        let digest = keccak(b"payload");
        let raw = se.sign_digest(&path(0), &digest).unwrap();

        let signature = ethers::types::Signature {
            r: ethers::types::U256::from_big_endian(&raw.r),
            s: ethers::types::U256::from_big_endian(&raw.s),
            v: 27 + raw.parity as u64,
        };
        let recovered = signature.recover(ethers::types::H256::from(digest)).unwrap();
        assert_eq!(recovered, se.address(&path(0)).unwrap());
    }
}
