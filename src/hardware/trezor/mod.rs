//! Trezor integration
//!
//! Protobuf messages ([`messages`]) exchanged over a pluggable
//! [`transport::TrezorTransport`]: USB HID with the `trezor` feature, or the
//! synthetic device in [`simulator`].

pub mod hid;
pub mod messages;
pub mod simulator;
pub mod transport;
pub mod wallet;

pub use simulator::SimulatedTrezor;
pub use transport::TrezorTransport;
pub use wallet::TrezorWallet;
