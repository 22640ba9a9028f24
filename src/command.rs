// src/command.rs
//
// Fixed-length control packets exchanged on the command characteristic.
//
// Layout (20 bytes):
//   [idLo, idHi, payload (16 bytes, zero padded), crcLo, crcHi]
// The CRC16 covers bytes 0..18.
//
// Acks reuse the layout: id = ACK, payload = [ackedLo, ackedHi, statusLo,
// statusHi, 0...].

use serde::Serialize;
use std::fmt;

use crate::checksums::{crc16, read_u16_le};
use crate::error::{OtaError, OtaResult};

pub const CONTROL_PACKET_LEN: usize = 20;
pub const CONTROL_PAYLOAD_LEN: usize = 16;

/// Command id + acked id + status.
pub const MIN_ACK_LEN: usize = 6;

/// Bytes a sector ack must carry: sector + status.
pub const MIN_SECTOR_ACK_LEN: usize = 4;

const CRC_OFFSET: usize = CONTROL_PACKET_LEN - 2;

pub type ControlPacket = [u8; CONTROL_PACKET_LEN];

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandId {
    Start,
    End,
    Ack,
    /// Unrecognised id, kept verbatim for logging.
    Other(u16),
}

impl CommandId {
    pub const fn code(self) -> u16 {
        match self {
            CommandId::Start => 0x0001,
            CommandId::End => 0x0002,
            CommandId::Ack => 0x0003,
            CommandId::Other(code) => code,
        }
    }

    pub const fn from_code(code: u16) -> Self {
        match code {
            0x0001 => CommandId::Start,
            0x0002 => CommandId::End,
            0x0003 => CommandId::Ack,
            other => CommandId::Other(other),
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandId::Start => write!(f, "START"),
            CommandId::End => write!(f, "END"),
            CommandId::Ack => write!(f, "ACK"),
            CommandId::Other(code) => write!(f, "{:#06x}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accept,
    Refuse,
    Other(u16),
}

impl AckStatus {
    pub const fn code(self) -> u16 {
        match self {
            AckStatus::Accept => 0x0000,
            AckStatus::Refuse => 0x0001,
            AckStatus::Other(code) => code,
        }
    }

    pub const fn from_code(code: u16) -> Self {
        match code {
            0x0000 => AckStatus::Accept,
            0x0001 => AckStatus::Refuse,
            other => AckStatus::Other(other),
        }
    }
}

/// Decoded acknowledgement from the command characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Echoed command id; ACK for well-formed acknowledgements.
    pub command: CommandId,
    /// Command being acknowledged.
    pub acked: CommandId,
    pub status: AckStatus,
}

/// Per-sector result the device reports on the data characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorAckStatus {
    Success,
    CrcError,
    SectorIndexError,
    PayloadLengthError,
    Other(u16),
}

impl SectorAckStatus {
    pub const fn from_code(code: u16) -> Self {
        match code {
            0x0000 => SectorAckStatus::Success,
            0x0001 => SectorAckStatus::CrcError,
            0x0002 => SectorAckStatus::SectorIndexError,
            0x0003 => SectorAckStatus::PayloadLengthError,
            other => SectorAckStatus::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorAck {
    pub sector: u16,
    pub status: SectorAckStatus,
}

// ============================================================================
// Encoding
// ============================================================================

/// Build a control packet. Payloads longer than 16 bytes are rejected.
pub fn encode_command(id: CommandId, payload: &[u8]) -> OtaResult<ControlPacket> {
    if payload.len() > CONTROL_PAYLOAD_LEN {
        return Err(OtaError::MalformedPacket(format!(
            "command payload of {} bytes exceeds {}",
            payload.len(),
            CONTROL_PAYLOAD_LEN
        )));
    }
    Ok(fill_packet(id, payload))
}

/// START carries the image length as a little-endian u32.
pub fn encode_start(image_len: u32) -> ControlPacket {
    fill_packet(CommandId::Start, &image_len.to_le_bytes())
}

pub fn encode_end() -> ControlPacket {
    fill_packet(CommandId::End, &[])
}

/// The packet a device sends to acknowledge `acked`.
pub fn encode_ack(acked: CommandId, status: AckStatus) -> ControlPacket {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&acked.code().to_le_bytes());
    payload[2..].copy_from_slice(&status.code().to_le_bytes());
    fill_packet(CommandId::Ack, &payload)
}

// `payload` is at most CONTROL_PAYLOAD_LEN bytes.
fn fill_packet(id: CommandId, payload: &[u8]) -> ControlPacket {
    let mut packet = [0u8; CONTROL_PACKET_LEN];
    packet[..2].copy_from_slice(&id.code().to_le_bytes());
    packet[2..2 + payload.len()].copy_from_slice(payload);
    let crc = crc16(&packet, 0, CRC_OFFSET);
    packet[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    packet
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode the three little-endian fields of an ack. The trailing CRC, if
/// any, is not checked.
pub fn decode_ack(bytes: &[u8]) -> OtaResult<Ack> {
    if bytes.len() < MIN_ACK_LEN {
        return Err(OtaError::MalformedPacket(format!(
            "ack of {} bytes, need at least {}",
            bytes.len(),
            MIN_ACK_LEN
        )));
    }
    let field = |offset| read_u16_le(bytes, offset).unwrap_or_default();
    Ok(Ack {
        command: CommandId::from_code(field(0)),
        acked: CommandId::from_code(field(2)),
        status: AckStatus::from_code(field(4)),
    })
}

/// Check that `bytes` is a complete control packet with a valid CRC.
pub fn verify_control_packet(bytes: &[u8]) -> OtaResult<()> {
    if bytes.len() != CONTROL_PACKET_LEN {
        return Err(OtaError::MalformedPacket(format!(
            "control packet of {} bytes, expected {}",
            bytes.len(),
            CONTROL_PACKET_LEN
        )));
    }
    let carried = read_u16_le(bytes, CRC_OFFSET).unwrap_or_default();
    let computed = crc16(bytes, 0, CRC_OFFSET);
    if carried != computed {
        return Err(OtaError::ChecksumMismatch { carried, computed });
    }
    Ok(())
}

/// [`decode_ack`] on a full packet whose CRC has been verified.
pub fn decode_ack_checked(bytes: &[u8]) -> OtaResult<Ack> {
    if bytes.len() < MIN_ACK_LEN {
        return decode_ack(bytes);
    }
    verify_control_packet(bytes)?;
    decode_ack(bytes)
}

pub fn decode_sector_ack(bytes: &[u8]) -> OtaResult<SectorAck> {
    match (read_u16_le(bytes, 0), read_u16_le(bytes, 2)) {
        (Some(sector), Some(status)) => Ok(SectorAck {
            sector,
            status: SectorAckStatus::from_code(status),
        }),
        _ => Err(OtaError::MalformedPacket(format!(
            "sector ack of {} bytes, need at least {}",
            bytes.len(),
            MIN_SECTOR_ACK_LEN
        ))),
    }
}
