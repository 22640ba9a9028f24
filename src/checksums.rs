// src/checksums.rs
//
// CRC16 used to protect firmware sectors and control packets.
// Polynomial 0x1021, init 0x0000, MSB-first, no reflection, no final XOR
// (the XMODEM flavour of CRC-16/CCITT).

/// Polynomial shared by sector and command CRCs.
pub const CRC16_POLYNOMIAL: u16 = 0x1021;

/// MSB-first CRC-16 over `data`, starting from `init`.
///
/// Exposed so callers can fold a CRC across several slices without
/// concatenating them.
pub fn crc16_update(init: u16, data: &[u8]) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC16_POLYNOMIAL;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// CRC-16 of `length` bytes of `data` starting at `offset`.
///
/// # Panics
/// When `offset + length` runs past the end of `data`. Callers own the
/// range check.
pub fn crc16(data: &[u8], offset: usize, length: usize) -> u16 {
    crc16_update(0x0000, &data[offset..offset + length])
}

/// CRC-16 of the whole slice.
pub fn crc16_all(data: &[u8]) -> u16 {
    crc16_update(0x0000, data)
}

/// Read a little-endian u16 at `offset`, if the slice is long enough.
pub(crate) fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}
