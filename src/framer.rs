// src/framer.rs
//
// Splits a firmware image into sectors and each sector into transport-sized
// frames.
//
// Wire layout of one frame on the data characteristic:
//
//   [addrLo, addrHi, seq, payload... (, crcLo, crcHi)]
//
// `seq` restarts at 0 for every sector. Only the last frame of a sector
// carries the CRC16 of the whole sector.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::checksums::crc16_all;
use crate::error::{OtaError, OtaResult};

// ============================================================================
// Constants
// ============================================================================

/// Sector size: the unit covered by one CRC.
pub const DEFAULT_SECTOR_SIZE: usize = 4096;

/// Payload bytes per frame when the link does not allow more.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Upper bound on payload bytes per frame regardless of the negotiated MTU.
pub const MAX_CHUNK_SIZE: usize = 512;

/// Address (2) + sequence (1).
pub const FRAME_HEADER_LEN: usize = 3;

/// Trailing sector CRC on the last frame of a sector.
pub const SECTOR_CRC_LEN: usize = 2;

/// Worst-case bytes a frame adds on top of its payload.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + SECTOR_CRC_LEN;

/// The sequence number is a single byte.
const MAX_FRAMES_PER_SECTOR: usize = 256;

const MAX_SECTOR_SIZE: usize = 65_536;

/// Number of distinct values the 16-bit address field can hold.
const ADDRESS_SPACE: usize = u16::MAX as usize + 1;

// ============================================================================
// Types
// ============================================================================

/// Meaning of the 2-byte address field at the start of every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorAddressing {
    /// Byte offset of the sector start, truncated to 16 bits. Caps the image
    /// at 64 KiB for 4 KiB sectors.
    #[default]
    ByteOffset,
    /// Zero-based sector index.
    SectorIndex,
}

impl SectorAddressing {
    fn address(self, sector_index: usize, sector_size: usize) -> u16 {
        match self {
            SectorAddressing::ByteOffset => (sector_index * sector_size) as u16,
            SectorAddressing::SectorIndex => sector_index as u16,
        }
    }
}

/// Validated sector/chunk geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    sector_size: usize,
    chunk_size: usize,
    addressing: SectorAddressing,
}

impl FrameLayout {
    pub fn new(
        sector_size: usize,
        chunk_size: usize,
        addressing: SectorAddressing,
    ) -> OtaResult<Self> {
        if sector_size == 0 || sector_size > MAX_SECTOR_SIZE {
            return Err(OtaError::InvalidLayout(format!(
                "sector size {} outside 1..={}",
                sector_size, MAX_SECTOR_SIZE
            )));
        }
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(OtaError::InvalidLayout(format!(
                "chunk size {} outside 1..={}",
                chunk_size, MAX_CHUNK_SIZE
            )));
        }
        let frames_per_sector = sector_size.div_ceil(chunk_size);
        if frames_per_sector > MAX_FRAMES_PER_SECTOR {
            return Err(OtaError::InvalidLayout(format!(
                "{} frames per sector overflow the 8-bit sequence number (chunk size {} too small for {}-byte sectors)",
                frames_per_sector, chunk_size, sector_size
            )));
        }
        Ok(Self {
            sector_size,
            chunk_size,
            addressing,
        })
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn addressing(&self) -> SectorAddressing {
        self.addressing
    }

    /// Largest image whose sectors all get a distinct address.
    pub fn max_image_len(&self) -> usize {
        match self.addressing {
            SectorAddressing::ByteOffset => {
                ((ADDRESS_SPACE - 1) / self.sector_size + 1) * self.sector_size
            }
            SectorAddressing::SectorIndex => ADDRESS_SPACE * self.sector_size,
        }
    }

    /// Reject images this layout cannot address.
    pub fn check_image(&self, len: usize) -> OtaResult<()> {
        if len == 0 {
            return Err(OtaError::EmptyImage);
        }
        let max = self.max_image_len();
        if len > max {
            return Err(OtaError::ImageTooLarge { len, max });
        }
        Ok(())
    }

    pub fn sector_count(&self, image_len: usize) -> usize {
        image_len.div_ceil(self.sector_size)
    }

    /// Frames `build_frames` yields for an image of `image_len` bytes,
    /// without building them.
    pub fn frame_count(&self, image_len: usize) -> usize {
        let full_sectors = image_len / self.sector_size;
        let tail = image_len % self.sector_size;
        full_sectors * self.sector_size.div_ceil(self.chunk_size)
            + tail.div_ceil(self.chunk_size)
    }
}

/// One ready-to-send unit on the data characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Zero-based sector this frame belongs to.
    pub sector: usize,
    /// Value of the address field.
    pub address: u16,
    /// Position within the sector.
    pub sequence: u8,
    pub payload: Vec<u8>,
    /// CRC16 of the whole sector, present on the sector's last frame only.
    pub sector_crc: Option<u16>,
}

impl Frame {
    pub fn is_sector_end(&self) -> bool {
        self.sector_crc.is_some()
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN
            + self.payload.len()
            + if self.sector_crc.is_some() { SECTOR_CRC_LEN } else { 0 }
    }

    /// Serialise to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.extend_from_slice(&self.address.to_le_bytes());
        bytes.push(self.sequence);
        bytes.extend_from_slice(&self.payload);
        if let Some(crc) = self.sector_crc {
            bytes.extend_from_slice(&crc.to_le_bytes());
        }
        bytes
    }
}

/// Immutable firmware image shared between the caller and the session.
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Arc<[u8]>,
}

impl FirmwareImage {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex SHA-256 of the image, logged so a flashed image can be matched
    /// against a build artefact.
    pub fn sha256_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Build the full, ordered frame sequence for `image`.
///
/// Pure and deterministic: the same image and layout always produce the
/// same frames, so a transfer can be resumed or retried by frame index.
/// Addresses wrap silently here; use [`FrameLayout::check_image`] first to
/// refuse images the address field cannot represent.
pub fn build_frames(image: &[u8], layout: &FrameLayout) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(layout.frame_count(image.len()));

    for (sector_index, sector) in image.chunks(layout.sector_size).enumerate() {
        let address = layout.addressing.address(sector_index, layout.sector_size);
        let sector_crc = crc16_all(sector);
        let last = sector.len().div_ceil(layout.chunk_size) - 1;

        for (sequence, chunk) in sector.chunks(layout.chunk_size).enumerate() {
            frames.push(Frame {
                sector: sector_index,
                address,
                sequence: sequence as u8,
                payload: chunk.to_vec(),
                sector_crc: (sequence == last).then_some(sector_crc),
            });
        }
    }

    frames
}
