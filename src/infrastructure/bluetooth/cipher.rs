//! Payload encryption.
//!
//! Every notification and command is AES-128-CBC encrypted as two
//! independent single-block chains: one over the first 16 bytes and, for
//! longer payloads, one over the last 16 bytes. On a 20 byte frame the two
//! blocks overlap, so the order of the two passes matters.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::ProtocolError;

pub const BLOCK_LEN: usize = 16;
pub const SALT_LEN: usize = 6;

/// Salted key and IV for one connection. Never reused across reconnects.
pub struct CubeCipher {
    aes: Aes128,
    iv: [u8; BLOCK_LEN],
}

impl std::fmt::Debug for CubeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubeCipher").finish_non_exhaustive()
    }
}

impl CubeCipher {
    /// Checks lengths only. A well-formed but wrong key is accepted here and
    /// only shows up as implausible decoded data later.
    pub fn new(key: &[u8], iv: &[u8], salt: &[u8]) -> Result<Self, ProtocolError> {
        let mut key = fixed::<BLOCK_LEN>("key", key)?;
        let mut iv = fixed::<BLOCK_LEN>("iv", iv)?;
        let salt = fixed::<SALT_LEN>("salt", salt)?;

        apply_salt(&mut key, &salt);
        apply_salt(&mut iv, &salt);

        Ok(Self {
            aes: Aes128::new(GenericArray::from_slice(&key)),
            iv,
        })
    }

    pub fn encrypt(&self, payload: &mut [u8]) -> Result<(), ProtocolError> {
        check_len(payload)?;
        self.encrypt_block(&mut payload[..BLOCK_LEN]);
        if payload.len() > BLOCK_LEN {
            let tail = payload.len() - BLOCK_LEN;
            self.encrypt_block(&mut payload[tail..]);
        }
        Ok(())
    }

    /// Undoes [`CubeCipher::encrypt`]: tail block first, then head block.
    pub fn decrypt(&self, payload: &mut [u8]) -> Result<(), ProtocolError> {
        check_len(payload)?;
        if payload.len() > BLOCK_LEN {
            let tail = payload.len() - BLOCK_LEN;
            self.decrypt_block(&mut payload[tail..]);
        }
        self.decrypt_block(&mut payload[..BLOCK_LEN]);
        Ok(())
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        for (b, v) in block.iter_mut().zip(self.iv.iter()) {
            *b ^= v;
        }
        self.aes.encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        self.aes.decrypt_block(GenericArray::from_mut_slice(block));
        for (b, v) in block.iter_mut().zip(self.iv.iter()) {
            *b ^= v;
        }
    }
}

/// `bytes[i] = (bytes[i] + salt[i]) % 255` over the first six bytes.
fn apply_salt(bytes: &mut [u8; BLOCK_LEN], salt: &[u8; SALT_LEN]) {
    for (b, s) in bytes.iter_mut().zip(salt.iter()) {
        *b = ((*b as u16 + *s as u16) % 255) as u8;
    }
}

fn fixed<const N: usize>(what: &'static str, bytes: &[u8]) -> Result<[u8; N], ProtocolError> {
    bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidKeyMaterial {
            what,
            expected: N,
            actual: bytes.len(),
        })
}

fn check_len(payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() < BLOCK_LEN {
        return Err(ProtocolError::PayloadTooShort {
            len: payload.len(),
            min: BLOCK_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; 16] = [
        0x01, 0x02, 0x42, 0x28, 0x31, 0x91, 0x16, 0x07, 0x20, 0x05, 0x18, 0x54, 0x42, 0x11, 0x12,
        0x53,
    ];
    const IV: [u8; 16] = [
        0x11, 0x03, 0x32, 0x28, 0x21, 0x01, 0x76, 0x27, 0x20, 0x95, 0x78, 0x14, 0x32, 0x12, 0x02,
        0x43,
    ];
    const SALT: [u8; 6] = [0x87, 0x18, 0x0D, 0x1A, 0xCA, 0xD3];

    #[test]
    fn test_short_key_is_rejected() {
        let err = CubeCipher::new(&KEY[..15], &IV, &SALT).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidKeyMaterial {
                what: "key",
                expected: 16,
                actual: 15
            }
        );
        assert!(CubeCipher::new(&KEY, &IV, &SALT[..5]).is_err());
        assert!(CubeCipher::new(&KEY, &[0u8; 17], &SALT).is_err());
    }

    #[test]
    fn test_salt_wraps_modulo_255() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xF0;
        bytes[1] = 0xFE;
        bytes[6] = 0x99;
        apply_salt(&mut bytes, &[0x20, 0x01, 0, 0, 0, 0]);
        assert_eq!(bytes[0], ((0xF0u16 + 0x20) % 255) as u8);
        assert_eq!(bytes[1], 0);
        assert_eq!(bytes[6], 0x99);
    }

    #[test]
    fn test_payload_too_short() {
        let cipher = CubeCipher::new(&KEY, &IV, &SALT).unwrap();
        let mut payload = [0u8; 15];
        assert_eq!(
            cipher.encrypt(&mut payload),
            Err(ProtocolError::PayloadTooShort { len: 15, min: 16 })
        );
    }

    #[test]
    fn test_encrypt_changes_both_regions() {
        let cipher = CubeCipher::new(&KEY, &IV, &SALT).unwrap();
        let plain = [0u8; 20];
        let mut payload = plain;
        cipher.encrypt(&mut payload).unwrap();
        assert_ne!(payload[..4], plain[..4]);
        assert_ne!(payload[16..], plain[16..]);
    }

    #[test]
    fn test_different_salt_gives_different_ciphertext() {
        let a = CubeCipher::new(&KEY, &IV, &SALT).unwrap();
        let b = CubeCipher::new(&KEY, &IV, &[0u8; 6]).unwrap();
        let mut pa = [7u8; 16];
        let mut pb = [7u8; 16];
        a.encrypt(&mut pa).unwrap();
        b.encrypt(&mut pb).unwrap();
        assert_ne!(pa, pb);
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(
            payload in prop::collection::vec(any::<u8>(), 16..=48),
            salt in prop::array::uniform6(any::<u8>()),
        ) {
            let cipher = CubeCipher::new(&KEY, &IV, &salt).unwrap();
            let mut buf = payload.clone();
            cipher.encrypt(&mut buf).unwrap();
            cipher.decrypt(&mut buf).unwrap();
            prop_assert_eq!(buf, payload);
        }
    }
}
