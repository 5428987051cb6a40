//! Ledger integration
//!
//! The Ethereum app's APDU protocol ([`apdu`]) over a pluggable
//! [`transport::LedgerTransport`]: USB HID with the `ledger` feature, or the
//! synthetic device in [`simulator`].

pub mod apdu;
pub mod hid;
pub mod simulator;
pub mod transport;
pub mod wallet;

pub use simulator::SimulatedLedger;
pub use transport::LedgerTransport;
pub use wallet::LedgerWallet;
