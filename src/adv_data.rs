//! Advertising payload assembly: LTV records and in-place patching.

use std::collections::HashMap;

use itertools::Itertools;
use num_traits::clamp;

use crate::uuid::Uuid;

pub type ManfId = u16;

// Advertising data types.
pub const FLAGS_AD_TYPE: u8 = 0x01;
const COMPLETE_LIST_16_BIT_SERVICE_UUIDS: u8 = 0x03;
const COMPLETE_LIST_32_BIT_SERVICE_UUIDS: u8 = 0x05;
const COMPLETE_LIST_128_BIT_SERVICE_UUIDS: u8 = 0x07;
const SHORTENED_LOCAL_NAME: u8 = 0x08;
const COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const TX_POWER_LEVEL: u8 = 0x0A;
const SERVICE_DATA_16_BIT_UUID: u8 = 0x16;
const SERVICE_DATA_32_BIT_UUID: u8 = 0x20;
const SERVICE_DATA_128_BIT_UUID: u8 = 0x21;
const MANUFACTURER_SPECIFIC_DATA: u8 = 0xFF;

// Flags AD values.
pub const LIMITED_DISCOVERABLE: u8 = 0x01;
pub const GENERAL_DISCOVERABLE: u8 = 0x02;

// Device name length before switching to the shortened form.
const DEVICE_NAME_MAX: usize = 26;

const LEGACY_ADV_DATA_LEN_MAX: usize = 31;
const EXT_ADV_DATA_LEN_MAX: usize = 254;

/// Service data LTV announcing a Broadcast Audio stream; such sets suppress
/// most RPA rotations.
const BROADCAST_AUDIO_ANNOUNCEMENT: [u8; 4] = [0x03, 0x16, 0x51, 0x18];

/// Appends one `[length][ad_type][payload]` record, clamping the payload to
/// the largest encodable length.
pub fn append_adv_data(dest: &mut Vec<u8>, ad_type: u8, ad_payload: &[u8]) {
    let len = clamp(ad_payload.len(), 0, 254);
    dest.push((len + 1) as u8);
    dest.push(ad_type);
    dest.extend(&ad_payload[..len]);
}

/// Builds the Flags AD for a connectable set. Limited discoverable when the
/// set carries an advertising timeout, general otherwise.
pub fn flags_ad(limited: bool) -> [u8; 3] {
    [2, FLAGS_AD_TYPE, if limited { LIMITED_DISCOVERABLE } else { GENERAL_DISCOVERABLE }]
}

/// Rewrites the value of every TX Power Level record in `data` with the power
/// the controller actually selected.
pub fn patch_tx_power(data: &mut [u8], tx_power: i8) {
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i + 1] == TX_POWER_LEVEL {
            data[i + 2] = tx_power as u8;
        }
        i += data[i] as usize + 1;
    }
}

/// Whether the payload leads with a Broadcast Audio Announcement service data
/// record.
pub fn has_broadcast_audio_announcement(data: &[u8]) -> bool {
    data.len() > 3 && data[..4] == BROADCAST_AUDIO_ANNOUNCEMENT
}

/// Builder for raw advertising payloads from structured fields.
#[derive(Debug, Default, Clone)]
pub struct AdvertiseData {
    /// Service UUIDs identifying the GATT services on this device.
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer id mapped to manufacturer-specific data.
    pub manufacturer_data: HashMap<ManfId, Vec<u8>>,
    /// Service UUID (string form) mapped to its service data.
    pub service_data: HashMap<String, Vec<u8>>,
    /// Whether a TX Power Level record is included; the value is filled by
    /// the lower layers once the controller reports the selected power.
    pub include_tx_power_level: bool,
    /// Whether the device name is included.
    pub include_device_name: bool,
}

impl AdvertiseData {
    fn append_service_uuids(dest: &mut Vec<u8>, uuids: &[Uuid]) {
        let mut uuid16_bytes = Vec::<u8>::new();
        let mut uuid32_bytes = Vec::<u8>::new();
        let mut uuid128_bytes = Vec::<u8>::new();

        // Group UUIDs by their shortest binary form so each list is emitted
        // as a single record.
        for uuid in uuids {
            let uuid_slice = uuid.get_shortest_slice();
            let id: Vec<u8> = uuid_slice.iter().rev().cloned().collect();
            match id.len() {
                2 => uuid16_bytes.extend(id),
                4 => uuid32_bytes.extend(id),
                16 => uuid128_bytes.extend(id),
                _ => (),
            }
        }

        let ad_types = [
            COMPLETE_LIST_16_BIT_SERVICE_UUIDS,
            COMPLETE_LIST_32_BIT_SERVICE_UUIDS,
            COMPLETE_LIST_128_BIT_SERVICE_UUIDS,
        ];
        let bytes_list = [uuid16_bytes, uuid32_bytes, uuid128_bytes];
        for (ad_type, bytes) in
            ad_types.iter().zip(bytes_list.iter()).filter(|(_, bytes)| !bytes.is_empty())
        {
            append_adv_data(dest, *ad_type, bytes);
        }
    }

    fn append_service_data(dest: &mut Vec<u8>, service_data: &HashMap<String, Vec<u8>>) {
        for (uuid, data) in service_data
            .iter()
            .sorted()
            .filter_map(|(s, d)| Uuid::from_string(s).map(|s| (s, d)))
        {
            let uuid_slice = uuid.get_shortest_slice();
            let concated: Vec<u8> = uuid_slice.iter().rev().chain(data).cloned().collect();
            match uuid_slice.len() {
                2 => append_adv_data(dest, SERVICE_DATA_16_BIT_UUID, &concated),
                4 => append_adv_data(dest, SERVICE_DATA_32_BIT_UUID, &concated),
                16 => append_adv_data(dest, SERVICE_DATA_128_BIT_UUID, &concated),
                _ => (),
            }
        }
    }

    fn append_device_name(dest: &mut Vec<u8>, device_name: &str) {
        if device_name.is_empty() {
            return;
        }

        let (ad_type, name) = if device_name.len() > DEVICE_NAME_MAX {
            (SHORTENED_LOCAL_NAME, [&device_name.as_bytes()[..DEVICE_NAME_MAX], &[0]].concat())
        } else {
            (COMPLETE_LOCAL_NAME, [device_name.as_bytes(), &[0]].concat())
        };
        append_adv_data(dest, ad_type, &name);
    }

    fn append_manufacturer_data(dest: &mut Vec<u8>, manufacturer_data: &HashMap<ManfId, Vec<u8>>) {
        for (m, data) in manufacturer_data.iter().sorted() {
            let concated = [&m.to_le_bytes()[..], data].concat();
            append_adv_data(dest, MANUFACTURER_SPECIFIC_DATA, &concated);
        }
    }

    /// Creates the raw payload from this builder.
    pub fn make_with(&self, device_name: &str) -> Vec<u8> {
        let mut bytes = Vec::<u8>::new();
        if self.include_device_name {
            AdvertiseData::append_device_name(&mut bytes, device_name);
        }
        if self.include_tx_power_level {
            // Lower layers fill in the selected power.
            append_adv_data(&mut bytes, TX_POWER_LEVEL, &[0]);
        }
        AdvertiseData::append_manufacturer_data(&mut bytes, &self.manufacturer_data);
        AdvertiseData::append_service_uuids(&mut bytes, &self.service_uuids);
        AdvertiseData::append_service_data(&mut bytes, &self.service_data);
        bytes
    }

    /// Validates the raw payload length for one set-data command.
    pub fn validate_raw_data(is_legacy: bool, bytes: &[u8]) -> bool {
        bytes.len() <= if is_legacy { LEGACY_ADV_DATA_LEN_MAX } else { EXT_ADV_DATA_LEN_MAX }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_ad_data_clamped() {
        let mut bytes = Vec::<u8>::new();
        let mut ans = Vec::<u8>::new();
        ans.push(255);
        ans.push(102);
        ans.extend(Vec::<u8>::from_iter(0..254));

        let payload = Vec::<u8>::from_iter(0..255);
        append_adv_data(&mut bytes, 102, &payload);
        assert_eq!(bytes, ans);
    }

    #[test]
    fn test_append_ad_data_multiple() {
        let mut bytes = Vec::<u8>::new();

        let payload = vec![0u8, 1, 2, 3, 4];
        append_adv_data(&mut bytes, 100, &payload);
        append_adv_data(&mut bytes, 101, &[0]);
        assert_eq!(bytes, vec![6u8, 100, 0, 1, 2, 3, 4, 2, 101, 0]);
    }

    #[test]
    fn test_flags_ad() {
        assert_eq!(flags_ad(false), [2, 0x01, GENERAL_DISCOVERABLE]);
        assert_eq!(flags_ad(true), [2, 0x01, LIMITED_DISCOVERABLE]);
    }

    #[test]
    fn test_patch_tx_power() {
        let mut bytes = Vec::<u8>::new();
        append_adv_data(&mut bytes, 0xFF, &[0xAA, 0xBB]);
        append_adv_data(&mut bytes, TX_POWER_LEVEL, &[0]);
        append_adv_data(&mut bytes, 0x09, b"x");
        patch_tx_power(&mut bytes, -10);
        assert_eq!(bytes[6], (-10i8) as u8);
        // Records around the TX power one are untouched.
        assert_eq!(&bytes[..4], &[3, 0xFF, 0xAA, 0xBB]);
        assert_eq!(&bytes[7..], &[2, 0x09, b'x']);
    }

    #[test]
    fn test_broadcast_audio_announcement_detection() {
        assert!(has_broadcast_audio_announcement(&[0x03, 0x16, 0x51, 0x18, 0x00]));
        assert!(!has_broadcast_audio_announcement(&[0x03, 0x16, 0x52, 0x18]));
        assert!(!has_broadcast_audio_announcement(&[0x03, 0x16]));
    }

    #[test]
    fn test_append_service_uuids() {
        let uuid_16 = Uuid::from_string("0000fef3-0000-1000-8000-00805f9b34fb").unwrap();
        let uuid_32 = Uuid::from_string("00112233-0000-1000-8000-00805f9b34fb").unwrap();
        let uuid_128 = Uuid::from_string("00010203-0405-0607-0809-0a0b0c0d0e0f").unwrap();

        let data = AdvertiseData {
            service_uuids: vec![uuid_16, uuid_32, uuid_128],
            ..Default::default()
        };
        let bytes = data.make_with("");

        let exp_16: Vec<u8> = vec![3, 0x3, 0xf3, 0xfe];
        let exp_32: Vec<u8> = vec![5, 0x5, 0x33, 0x22, 0x11, 0x0];
        let exp_128: Vec<u8> = vec![
            17, 0x7, 0xf, 0xe, 0xd, 0xc, 0xb, 0xa, 0x9, 0x8, 0x7, 0x6, 0x5, 0x4, 0x3, 0x2, 0x1, 0x0,
        ];
        let exp_bytes: Vec<u8> =
            [exp_16.as_slice(), exp_32.as_slice(), exp_128.as_slice()].concat();
        assert_eq!(bytes, exp_bytes);
    }

    #[test]
    fn test_append_service_data_bad_id_skipped() {
        let mut service_data = HashMap::new();
        service_data.insert("fef3".to_string(), vec![1, 2, 3]);
        let data = AdvertiseData { service_data, ..Default::default() };
        assert!(data.make_with("").is_empty());
    }

    #[test]
    fn test_append_device_name() {
        let data = AdvertiseData { include_device_name: true, ..Default::default() };
        let bytes = data.make_with("abc");
        assert_eq!(bytes, vec![5, 0x9, 0x61, 0x62, 0x63, 0x0]);

        let bytes = data.make_with("abcdefghijklmnopqrstuvwxyz7890");
        assert_eq!(
            bytes,
            vec![
                28, 0x8, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x6b, 0x6c,
                0x6d, 0x6e, 0x6f, 0x70, 0x71, 0x72, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a,
                0x0,
            ]
        );
    }

    #[test]
    fn test_append_manufacturer_data() {
        let data = AdvertiseData {
            manufacturer_data: HashMap::from([(0x0123u16, vec![0, 1, 2])]),
            ..Default::default()
        };
        assert_eq!(data.make_with(""), vec![6, 0xff, 0x23, 0x01, 0x0, 0x1, 0x2]);
    }

    #[test]
    fn test_validate_raw_data() {
        assert!(AdvertiseData::validate_raw_data(true, &vec![0; 31]));
        assert!(!AdvertiseData::validate_raw_data(true, &vec![0; 32]));
        assert!(AdvertiseData::validate_raw_data(false, &vec![0; 254]));
        assert!(!AdvertiseData::validate_raw_data(false, &vec![0; 255]));
    }
}
