// BLE OTA core
//
// Sector framing, the CRC16 command handshake and the lock-step session
// state machine for ESP-style BLE firmware updates. The BLE stack is
// abstracted behind `transport::Transport`; the btleplug implementation is
// behind the `btle` feature.

#[macro_use]
pub mod logging;

pub mod ble_common;
pub mod checksums;
pub mod command;
pub mod config;
pub mod error;
pub mod framer;
pub mod scanner;
pub mod session;
pub mod transport;

pub use config::OtaConfig;
pub use error::{OtaError, OtaResult};
pub use framer::FirmwareImage;
pub use scanner::PeripheralIdentity;
pub use session::{Phase, Session, SessionHandle, SessionSnapshot};
pub use transport::{event_channel, Transport, TransportEvent};
