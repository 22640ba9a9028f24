// Shared GATT identifiers and UUID helpers
//
// The OTA service follows the Espressif BLE OTA layout: one service with a
// firmware receive (data) characteristic and a command characteristic.
// The firmware version comes from the standard Device Information
// "Firmware Revision String" characteristic.

use uuid::Uuid;

// ============================================================================
// Well-known UUIDs
// ============================================================================

/// OTA GATT service
pub const OTA_SERVICE_UUID: Uuid = uuid_from_u16(0x8018);

/// Firmware receive characteristic (frames are written here)
pub const OTA_DATA_CHAR_UUID: Uuid = uuid_from_u16(0x8020);

/// Command characteristic (START/END writes, ACK notifications)
pub const OTA_COMMAND_CHAR_UUID: Uuid = uuid_from_u16(0x8022);

/// Device Information: Firmware Revision String
pub const FIRMWARE_VERSION_CHAR_UUID: Uuid = uuid_from_u16(0x2A26);

/// Bluetooth SIG base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

// ============================================================================
// Helpers
// ============================================================================

/// Expand a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Short display form used in log lines: `0x8020` for SIG-based UUIDs,
/// the full hyphenated form otherwise.
pub fn short_uuid(uuid: &Uuid) -> String {
    let value = uuid.as_u128();
    let mask = !(0xFFFF_u128 << 96);
    if value & mask == BLUETOOTH_BASE_UUID && value >> 112 == 0 {
        format!("{:#06x}", (value >> 96) as u16)
    } else {
        uuid.to_string()
    }
}
