use packed_struct::prelude::*;

use common::PROVISIONING_SERVICE_UUID;

// Legacy advertising PDU payload limit
pub const MAX_ADVERTISING_LEN: usize = 31;

// AD types
const AD_FLAGS: u8 = 0x01;
const AD_COMPLETE_128_BIT_UUIDS: u8 = 0x07;
const AD_SHORTENED_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_APPEARANCE: u8 = 0x19;

/// Generic computer
pub const APPEARANCE: u16 = 0x0080;

// Flags AD structure (1 byte):
// Bits      | Definition
// 0..=2     | Reserved
// 3         | Simultaneous LE and BR/EDR (host)
// 4         | Simultaneous LE and BR/EDR (controller)
// 5         | BR/EDR not supported
// 6         | LE general discoverable
// 7         | LE limited discoverable
#[derive(PackedStruct, Default, Debug, PartialEq, Clone)]
#[packed_struct(bit_numbering = "msb0", size = "1")]
pub struct AdvertisingFlags {
    #[packed_field(bits = "0..=2")]
    pub _reserved: ReservedZero<packed_bits::Bits<3>>,
    #[packed_field(bits = "3")]
    pub le_bredr_host: bool,
    #[packed_field(bits = "4")]
    pub le_bredr_controller: bool,
    #[packed_field(bits = "5")]
    pub bredr_unsupported: bool,
    #[packed_field(bits = "6")]
    pub general_discoverable: bool,
    #[packed_field(bits = "7")]
    pub limited_discoverable: bool,
}

impl AdvertisingFlags {
    pub fn provisioning() -> Self {
        Self {
            general_discoverable: true,
            bredr_unsupported: true,
            ..Default::default()
        }
    }

    pub fn pack_flags(&self) -> Result<[u8; 1], PackingError> {
        self.pack()
    }
}

fn push_structure(payload: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    payload.push(data.len() as u8 + 1);
    payload.push(ad_type);
    payload.extend_from_slice(data);
}

/// Flags, appearance and device name. A name that does not fit is cut at a
/// character boundary and sent as a shortened name.
pub fn advertising_payload(device_name: &str) -> Result<Vec<u8>, PackingError> {
    let mut payload = Vec::with_capacity(MAX_ADVERTISING_LEN);
    push_structure(&mut payload, AD_FLAGS, &AdvertisingFlags::provisioning().pack_flags()?);
    push_structure(&mut payload, AD_APPEARANCE, &APPEARANCE.to_le_bytes());

    let room = MAX_ADVERTISING_LEN - payload.len() - 2;
    if device_name.len() <= room {
        push_structure(&mut payload, AD_COMPLETE_NAME, device_name.as_bytes());
    } else {
        let mut end = room;
        while !device_name.is_char_boundary(end) {
            end -= 1;
        }
        push_structure(&mut payload, AD_SHORTENED_NAME, device_name[..end].as_bytes());
    }
    Ok(payload)
}

/// Scan response carrying the provisioning service UUID
pub fn scan_response_payload() -> Vec<u8> {
    let mut payload = Vec::with_capacity(18);
    push_structure(
        &mut payload,
        AD_COMPLETE_128_BIT_UUIDS,
        &PROVISIONING_SERVICE_UUID.to_le_bytes(),
    );
    payload
}
