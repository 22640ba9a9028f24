use thiserror::Error;
use uuid::Uuid;

use crate::command::CommandId;
use crate::session::Phase;

/// Errors raised by the OTA core and its transports.
///
/// Foreign errors (btleplug, io, toml) are flattened into their message so
/// the error can be cloned into published session snapshots.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("checksum mismatch: packet carries {carried:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { carried: u16, computed: u16 },

    #[error("device refused {0} command")]
    CommandRefused(CommandId),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("timed out in {0} phase")]
    Timeout(Phase),

    #[error("command not allowed in {0} phase")]
    NotReady(Phase),

    #[error("firmware image is empty")]
    EmptyImage,

    #[error("firmware image of {len} bytes exceeds the addressable {max} bytes")]
    ImageTooLarge { len: usize, max: usize },

    #[error("invalid frame layout: {0}")]
    InvalidLayout(String),

    #[error("characteristic {0} not found on peripheral")]
    MissingCharacteristic(Uuid),

    #[error("BLE adapter error: {0}")]
    Adapter(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("session task has stopped")]
    SessionClosed,
}

pub type OtaResult<T> = Result<T, OtaError>;
