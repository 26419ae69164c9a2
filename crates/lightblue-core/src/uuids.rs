//! GATT identifiers used by Bean peripherals

use uuid::Uuid;

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Bean GATT serial transport service, also the Bean advertisement marker
pub const SERIAL_TRANSPORT_SERVICE_UUID: Uuid =
    Uuid::from_u128(0xA495FF10_C5B1_4B44_B512_1370F02D74DE);

/// Serial transport characteristic (write + notify)
pub const SERIAL_TRANSPORT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xA495FF11_C5B1_4B44_B512_1370F02D74DE);

/// Over-the-air firmware download service
pub const OAD_SERVICE_UUID: Uuid = Uuid::from_u128(0xF000FFC0_0451_4000_B000_000000000000);
pub const OAD_IDENTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xF000FFC1_0451_4000_B000_000000000000);
pub const OAD_BLOCK_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xF000FFC2_0451_4000_B000_000000000000);

pub const BATTERY_SERVICE_UUID: Uuid = sig_uuid(0x180F);
pub const BATTERY_LEVEL_CHARACTERISTIC_UUID: Uuid = sig_uuid(0x2A19);

pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid = sig_uuid(0x180A);
pub const MANUFACTURER_NAME_CHARACTERISTIC_UUID: Uuid = sig_uuid(0x2A29);
pub const MODEL_NUMBER_CHARACTERISTIC_UUID: Uuid = sig_uuid(0x2A24);
pub const HARDWARE_REVISION_CHARACTERISTIC_UUID: Uuid = sig_uuid(0x2A27);
pub const FIRMWARE_REVISION_CHARACTERISTIC_UUID: Uuid = sig_uuid(0x2A26);
pub const SOFTWARE_REVISION_CHARACTERISTIC_UUID: Uuid = sig_uuid(0x2A28);

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

// ----------------------------------------------------------------------------
// Normalization
// ----------------------------------------------------------------------------

/// Expand a 16-bit SIG-assigned number onto the Bluetooth base UUID
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Normalize the textual UUID forms radios report into a canonical [`Uuid`]
///
/// Accepts 16-bit and 32-bit short forms as well as undashed and dashed
/// 128-bit forms, case-insensitively.
pub fn normalize_uuid(raw: &str) -> Option<Uuid> {
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();

    match compact.len() {
        4 | 8 => u32::from_str_radix(&compact, 16)
            .ok()
            .map(|short| Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))),
        32 => Uuid::parse_str(&compact).ok(),
        _ => None,
    }
}
