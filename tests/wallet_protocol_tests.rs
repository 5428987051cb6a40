//! Vendor driver tests against the synthetic devices
//!
//! Covers transaction shapes that exercise chunking on both protocols.

use defi_hardware_wallet::core::errors::WalletError;
use defi_hardware_wallet::hardware::ledger::{LedgerWallet, SimulatedLedger};
use defi_hardware_wallet::hardware::trezor::{SimulatedTrezor, TrezorWallet};
use defi_hardware_wallet::hardware::{HardwareWallet, HardwareWalletType};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, Signature, TransactionRequest, U256};
use ethers::utils::keccak256;
use std::sync::Arc;
use std::time::Duration;

const PATH: &str = "m/44'/60'/0'/0/3";

async fn ledger(id: &str) -> (Arc<SimulatedLedger>, LedgerWallet) {
    let device = Arc::new(SimulatedLedger::new(id));
    let wallet = LedgerWallet::new(id, device.clone());
    wallet.connect().await.unwrap();
    (device, wallet)
}

async fn trezor(id: &str) -> (Arc<SimulatedTrezor>, TrezorWallet) {
    let device = Arc::new(SimulatedTrezor::new(id));
    let wallet = TrezorWallet::new(id, device.clone());
    wallet.connect().await.unwrap();
    (device, wallet)
}

fn contract_call(data_len: usize) -> TypedTransaction {
    TransactionRequest::new()
        .to(Address::repeat_byte(0x11))
        .value(U256::zero())
        .gas(500_000u64)
        .gas_price(30_000_000_000u64)
        .nonce(1u64)
        .data(Bytes::from((0..data_len).map(|i| (i % 251) as u8).collect::<Vec<u8>>()))
        .into()
}

fn eip1559(chain_id: u64) -> TypedTransaction {
    Eip1559TransactionRequest::new()
        .to(Address::repeat_byte(0x22))
        .value(U256::from(5u64) * U256::exp10(17))
        .gas(21_000u64)
        .max_fee_per_gas(40_000_000_000u64)
        .max_priority_fee_per_gas(1_500_000_000u64)
        .nonce(12u64)
        .chain_id(chain_id)
        .into()
}

fn address_of(public_key: &[u8]) -> Address {
    Address::from_slice(&keccak256(&public_key[1..])[12..])
}

#[tokio::test]
async fn test_public_key_matches_address() {
    let (_, ledger) = ledger("pk-ledger").await;
    let (_, trezor) = trezor("pk-trezor").await;

    for wallet in [&ledger as &dyn HardwareWallet, &trezor as &dyn HardwareWallet] {
        let key = wallet.get_public_key(PATH).await.unwrap();
        assert_eq!(key.len(), 65);
        assert_eq!(key[0], 0x04);
        let address: Address = wallet.get_address(PATH).await.unwrap().parse().unwrap();
        assert_eq!(address_of(&key), address, "{}", wallet.wallet_type());
    }
}

#[tokio::test]
async fn test_addresses_are_checksummed() {
    let (_, wallet) = trezor("checksum").await;
    let address = wallet.get_address(PATH).await.unwrap();
    assert!(address.starts_with("0x"));
    assert_eq!(address.len(), 42);
    let parsed: Address = address.parse().unwrap();
    assert_eq!(address, ethers::utils::to_checksum(&parsed, None));
}

#[tokio::test]
async fn test_ledger_signs_large_calldata() {
    let (device, wallet) = ledger("big-ledger").await;
    let before = device.exchange_count();

    let signed = wallet.sign_transaction(&contract_call(2_000), PATH).await.unwrap();
    let address: Address = wallet.get_address(PATH).await.unwrap().parse().unwrap();
    assert_eq!(signed.signer().unwrap(), address);

    // Path plus RLP does not fit one APDU.
    assert!(device.exchange_count() - before > 2);
}

#[tokio::test]
async fn test_ledger_signs_eip1559() {
    let (_, wallet) = ledger("ledger-1559").await;
    let tx = eip1559(137);

    let signed = wallet.sign_transaction(&tx, PATH).await.unwrap();
    let address: Address = wallet.get_address(PATH).await.unwrap().parse().unwrap();
    assert_eq!(signed.signer().unwrap(), address);
    assert_eq!(signed.raw()[0], 0x02);
}

#[tokio::test]
async fn test_trezor_streams_calldata_over_1024_bytes() {
    let (device, wallet) = trezor("big-trezor").await;
    let before = device.call_count();

    let signed = wallet.sign_transaction(&contract_call(3_000), PATH).await.unwrap();
    let address: Address = wallet.get_address(PATH).await.unwrap().parse().unwrap();
    assert_eq!(signed.signer().unwrap(), address);

    // Initial request carries 1024 bytes; the remaining 1976 need two acks.
    assert!(device.call_count() - before >= 3);
}

#[tokio::test]
async fn test_trezor_signs_eip1559() {
    let (_, wallet) = trezor("trezor-1559").await;

    let signed = wallet.sign_transaction(&eip1559(10), PATH).await.unwrap();
    let address: Address = wallet.get_address(PATH).await.unwrap().parse().unwrap();
    assert_eq!(signed.signer().unwrap(), address);
    assert_eq!(signed.transaction.chain_id().map(|c| c.as_u64()), Some(10));
}

#[tokio::test]
async fn test_missing_chain_id_defaults_to_mainnet() {
    let (_, wallet) = ledger("no-chain").await;
    let tx = contract_call(0);
    assert!(tx.chain_id().is_none());

    let signed = wallet.sign_transaction(&tx, PATH).await.unwrap();
    assert_eq!(signed.transaction.chain_id().map(|c| c.as_u64()), Some(1));
    assert!(signed.signature.v == 37 || signed.signature.v == 38);
}

#[tokio::test]
async fn test_vendors_sign_the_same_digest() {
    // Synthetic keys depend only on device id and path, so one id on both
    // vendors yields the same account.
    let (_, ledger) = ledger("shared").await;
    let (_, trezor) = trezor("shared").await;
    assert_eq!(ledger.get_address(PATH).await.unwrap(), trezor.get_address(PATH).await.unwrap());

    let message = b"same account";
    let a = ledger.sign_message(message, PATH).await.unwrap();
    let b = trezor.sign_message(message, PATH).await.unwrap();
    let a = Signature::try_from(&a[..]).unwrap().recover(&message[..]).unwrap();
    let b = Signature::try_from(&b[..]).unwrap().recover(&message[..]).unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_long_message_is_chunked() {
    let (device, wallet) = ledger("long-msg").await;
    let before = device.exchange_count();
    let message = vec![b'a'; 700];

    let bytes = wallet.sign_message(&message, PATH).await.unwrap();
    let address: Address = wallet.get_address(PATH).await.unwrap().parse().unwrap();
    let signature = Signature::try_from(&bytes[..]).unwrap();
    assert_eq!(signature.recover(message.as_slice()).unwrap(), address);
    assert!(device.exchange_count() - before >= 3);
}

#[tokio::test]
async fn test_typed_data_falls_back_to_personal_sign() {
    let (_, wallet) = trezor("typed").await;
    let payload = br#"{"types":{},"primaryType":"Mail","domain":{},"message":{}}"#;

    let typed = wallet.sign_typed_data(payload, PATH).await.unwrap();
    let personal = wallet.sign_message(payload, PATH).await.unwrap();
    assert_eq!(typed, personal);
}

#[tokio::test]
async fn test_trezor_rejects_ens_recipient() {
    let (_, wallet) = trezor("ens").await;
    let mut request = TransactionRequest::new().value(1u64).gas(21_000u64).gas_price(1u64).nonce(0u64);
    request.to = Some(ethers::types::NameOrAddress::Name("vitalik.eth".to_string()));

    let err = wallet.sign_transaction(&request.into(), PATH).await.unwrap_err();
    assert!(matches!(err, WalletError::TransportError(_)));
}

#[tokio::test]
async fn test_ledger_signing_needs_ethereum_app() {
    let device = Arc::new(SimulatedLedger::new("btc").with_open_app("Bitcoin"));
    let wallet = LedgerWallet::new("btc", device.clone());
    wallet.connect().await.unwrap();

    let err = wallet.sign_message(b"hello", PATH).await.unwrap_err();
    assert!(matches!(err, WalletError::TransportError(_)));
}

#[tokio::test]
async fn test_trezor_session_lifecycle() {
    let (_, wallet) = trezor("session").await;
    let session = wallet.session().unwrap();
    assert_eq!(session.features.model_name(), "Model T");
    assert_eq!(session.features.firmware_version(), "2.5.3");

    tokio::time::sleep(Duration::from_millis(20)).await;
    wallet.get_address(PATH).await.unwrap();
    let after_address = wallet.session().unwrap();
    assert!(after_address.last_used > session.last_used);
    assert_eq!(after_address.session_id, session.session_id);
    assert_eq!(after_address.started_at, session.started_at);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let info = wallet.get_device_info().unwrap();
    assert_eq!(info.wallet_type, HardwareWalletType::Trezor);
    assert_eq!(info.label, "My Trezor");
    assert!(wallet.session().unwrap().last_used > after_address.last_used);

    wallet.disconnect().await.unwrap();
    assert!(wallet.session().is_none());
    assert!(!wallet.is_connected());
    // Disconnecting twice is a no-op on the wallet itself.
    wallet.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_ledger_connect_reads_app_configuration() {
    let device = Arc::new(SimulatedLedger::new("eth-app"));
    LedgerWallet::new("eth-app", device.clone()).connect().await.unwrap();
    // App-and-version, then the Ethereum app configuration.
    assert_eq!(device.exchange_count(), 2);

    let device = Arc::new(SimulatedLedger::new("btc-app").with_open_app("Bitcoin"));
    LedgerWallet::new("btc-app", device.clone()).connect().await.unwrap();
    assert_eq!(device.exchange_count(), 1);
}

#[tokio::test]
async fn test_supported_chains() {
    let (_, wallet) = ledger("chains").await;
    let chains = wallet.get_supported_chains();
    for chain in ["ethereum", "polygon", "bsc", "arbitrum", "optimism"] {
        assert!(chains.iter().any(|c| c == chain));
    }
}
