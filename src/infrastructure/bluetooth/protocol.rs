//! GAN Cube Protocol
//!
//! GATT layout of the three cube generations, the static key table and the
//! advertisement heuristics used to recognise a cube.

use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

use crate::domain::models::{Generation, MacAddress};
use crate::domain::settings::KeyConfig;
use crate::error::ConfigurationError;

/// Service and characteristic UUIDs of one protocol generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationProfile {
    pub generation: Generation,
    pub service: Uuid,
    /// Write target for outbound commands.
    pub command_char: Uuid,
    /// Notification source for cube state.
    pub state_char: Uuid,
    /// Minimum notification length; shorter payloads are rejected.
    pub frame_len: usize,
}

pub const GEN2_PROFILE: GenerationProfile = GenerationProfile {
    generation: Generation::Gen2,
    service: Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dc4179),
    command_char: Uuid::from_u128(0x28be4a4a_cd67_11e9_a32f_2a2ae2dbcce4),
    state_char: Uuid::from_u128(0x28be4cb6_cd67_11e9_a32f_2a2ae2dbcce4),
    frame_len: 20,
};

pub const GEN3_PROFILE: GenerationProfile = GenerationProfile {
    generation: Generation::Gen3,
    service: Uuid::from_u128(0x8653000a_43e6_47b7_9cb0_5fc21d4ae340),
    command_char: Uuid::from_u128(0x8653000c_43e6_47b7_9cb0_5fc21d4ae340),
    state_char: Uuid::from_u128(0x8653000b_43e6_47b7_9cb0_5fc21d4ae340),
    frame_len: 16,
};

pub const GEN4_PROFILE: GenerationProfile = GenerationProfile {
    generation: Generation::Gen4,
    service: Uuid::from_u128(0x00000010_0000_fff7_fff6_fff5fff4fff0),
    command_char: Uuid::from_u128(0x0000fff5_0000_1000_8000_00805f9b34fb),
    state_char: Uuid::from_u128(0x0000fff6_0000_1000_8000_00805f9b34fb),
    frame_len: 20,
};

pub const PROFILES: [GenerationProfile; 3] = [GEN2_PROFILE, GEN3_PROFILE, GEN4_PROFILE];

pub fn profile_for(generation: Generation) -> &'static GenerationProfile {
    match generation {
        Generation::Gen2 => &GEN2_PROFILE,
        Generation::Gen3 => &GEN3_PROFILE,
        Generation::Gen4 => &GEN4_PROFILE,
    }
}

/// Picks the generation whose service appears among `services`.
pub fn detect_generation<'a>(
    services: impl IntoIterator<Item = &'a Uuid>,
) -> Option<&'static GenerationProfile> {
    let services: Vec<&Uuid> = services.into_iter().collect();
    PROFILES
        .iter()
        .find(|profile| services.iter().any(|uuid| **uuid == profile.service))
}

/// Gen4 models that carry a gyroscope.
pub const GYRO_MODELS: &[&str] = &["GAN12uiMaglev", "GAN14uiFreeplay"];

pub fn is_gyro_model(name: &str) -> bool {
    GYRO_MODELS.contains(&name)
}

/// Fixed bytes the cube expects after a reset opcode.
pub const RESET_SEQUENCE: [u8; 11] = [
    0x05, 0x39, 0x77, 0x00, 0x00, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB,
];

/// Base key and IV before salting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub name: String,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl KeyMaterial {
    fn builtin(name: &str, key: [u8; 16], iv: [u8; 16]) -> Self {
        Self {
            name: name.to_string(),
            key: key.to_vec(),
            iv: iv.to_vec(),
        }
    }

    pub fn from_config(config: &KeyConfig) -> Result<Self, ConfigurationError> {
        let key = parse_hex(&config.key_hex).map_err(|reason| ConfigurationError::MalformedKey {
            name: config.name.clone(),
            reason: format!("key: {reason}"),
        })?;
        let iv = parse_hex(&config.iv_hex).map_err(|reason| ConfigurationError::MalformedKey {
            name: config.name.clone(),
            reason: format!("iv: {reason}"),
        })?;
        Ok(Self {
            name: config.name.clone(),
            key,
            iv,
        })
    }
}

pub const GAN_KEY_NAME: &str = "GAN";
pub const MOYU_KEY_NAME: &str = "MoYu AI 2023";

/// Built-in key table, one entry per vendor sub-family.
pub fn builtin_keys() -> Vec<KeyMaterial> {
    vec![
        KeyMaterial::builtin(
            GAN_KEY_NAME,
            [
                0x01, 0x02, 0x42, 0x28, 0x31, 0x91, 0x16, 0x07, 0x20, 0x05, 0x18, 0x54, 0x42, 0x11,
                0x12, 0x53,
            ],
            [
                0x11, 0x03, 0x32, 0x28, 0x21, 0x01, 0x76, 0x27, 0x20, 0x95, 0x78, 0x14, 0x32, 0x12,
                0x02, 0x43,
            ],
        ),
        KeyMaterial::builtin(
            MOYU_KEY_NAME,
            [
                0x05, 0x12, 0x02, 0x45, 0x02, 0x01, 0x29, 0x56, 0x12, 0x78, 0x12, 0x76, 0x81, 0x01,
                0x08, 0x03,
            ],
            [
                0x01, 0x44, 0x28, 0x06, 0x86, 0x21, 0x22, 0x28, 0x51, 0x05, 0x08, 0x31, 0x82, 0x02,
                0x21, 0x06,
            ],
        ),
    ]
}

/// Keys to try for a peripheral, most likely first: the family suggested by
/// the advertised name, the rest of the built-in table, then configured
/// extras. Malformed extras are logged and skipped.
pub fn key_candidates(device_name: Option<&str>, extra: &[KeyConfig]) -> Vec<KeyMaterial> {
    let mut keys = builtin_keys();
    let preferred = match device_name {
        Some(name) if name.starts_with("AiCube") => MOYU_KEY_NAME,
        _ => GAN_KEY_NAME,
    };
    if let Some(pos) = keys.iter().position(|k| k.name == preferred) {
        let key = keys.remove(pos);
        keys.insert(0, key);
    }

    for config in extra {
        match KeyMaterial::from_config(config) {
            Ok(key) => keys.push(key),
            Err(e) => warn!("Skipping configured key: {}", e),
        }
    }
    keys
}

/// Decodes hex with optional `:`, `-`, `,` or whitespace separators.
fn parse_hex(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, ':' | '-' | ','))
        .collect();
    hex::decode(digits)
}

/// Company identifiers GAN cubes advertise under all end in `0x01`.
pub fn is_cube_company_id(company_id: u16) -> bool {
    company_id & 0xFF == 0x01
}

/// Recovers the cube's hardware address from manufacturer data: bytes 3..9
/// of the payload, in reverse order.
pub fn mac_from_manufacturer_data(data: &HashMap<u16, Vec<u8>>) -> Option<MacAddress> {
    let mut company_ids: Vec<&u16> = data.keys().filter(|id| is_cube_company_id(**id)).collect();
    company_ids.sort();

    company_ids.into_iter().find_map(|id| {
        let payload = data.get(id)?;
        let slice = payload.get(3..9)?;
        let mut bytes = [0u8; 6];
        for (dst, src) in bytes.iter_mut().zip(slice.iter().rev()) {
            *dst = *src;
        }
        Some(MacAddress(bytes))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_generation_by_service() {
        let services = [
            Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb),
            GEN3_PROFILE.service,
        ];
        let profile = detect_generation(&services).unwrap();
        assert_eq!(profile.generation, Generation::Gen3);
        assert_eq!(profile.frame_len, 16);

        let unrelated = [Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb)];
        assert!(detect_generation(&unrelated).is_none());
    }

    #[test]
    fn test_uuid_text_matches_vendor_layout() {
        assert_eq!(
            GEN2_PROFILE.service.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dc4179"
        );
        assert_eq!(
            GEN4_PROFILE.state_char.to_string(),
            "0000fff6-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_key_preference_by_name() {
        let gan = key_candidates(Some("GAN12ui-1234"), &[]);
        assert_eq!(gan[0].name, GAN_KEY_NAME);
        assert_eq!(gan.len(), 2);

        let moyu = key_candidates(Some("AiCube-ABCD"), &[]);
        assert_eq!(moyu[0].name, MOYU_KEY_NAME);
        assert_eq!(moyu[1].name, GAN_KEY_NAME);
    }

    #[test]
    fn test_extra_keys_appended_and_malformed_skipped() {
        let extra = vec![
            KeyConfig {
                name: "lab".to_string(),
                key_hex: "00112233445566778899aabbccddeeff".to_string(),
                iv_hex: "00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff".to_string(),
            },
            KeyConfig {
                name: "broken".to_string(),
                key_hex: "0g".to_string(),
                iv_hex: "00".to_string(),
            },
        ];
        let keys = key_candidates(None, &extra);
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[2].name, "lab");
        assert_eq!(keys[2].key[15], 0xFF);
        assert_eq!(keys[2].iv[1], 0x11);
    }

    #[test]
    fn test_malformed_key_hex_reports_key_name() {
        let config = KeyConfig {
            name: "odd".to_string(),
            key_hex: "0011223".to_string(),
            iv_hex: "00, 11, 22".to_string(),
        };
        let err = KeyMaterial::from_config(&config).unwrap_err();
        assert!(matches!(
            &err,
            ConfigurationError::MalformedKey { name, reason } if name == "odd" && reason.starts_with("key:")
        ));
        assert_eq!(parse_hex("00, 11, 22").unwrap(), vec![0x00, 0x11, 0x22]);
        assert_eq!(parse_hex("AB-cd").unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_mac_from_manufacturer_data() {
        let mut data = HashMap::new();
        data.insert(0x004C, vec![0xFF; 12]);
        data.insert(0x3A01, vec![0x00, 0x00, 0x00, 0x87, 0x18, 0x0D, 0x1A, 0xCA, 0xD3]);
        let mac = mac_from_manufacturer_data(&data).unwrap();
        assert_eq!(mac.to_string(), "D3:CA:1A:0D:18:87");
    }

    #[test]
    fn test_mac_from_short_manufacturer_data() {
        let mut data = HashMap::new();
        data.insert(0x0001, vec![0x01, 0x02, 0x03]);
        assert!(mac_from_manufacturer_data(&data).is_none());
    }
}
