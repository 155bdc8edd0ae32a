//! Encrypted Advertising Data pipeline.
//!
//! Payloads are sealed with AES-128-CCM (Bluetooth variant: 13-byte nonce,
//! 4-byte MIC, associated data `0xEA`) and framed as an Encrypted Data AD
//! structure carrying `randomizer ‖ ciphertext ‖ MIC`. The 5-byte randomizer
//! is per-PDU salt taken from the controller's LE Rand output and pairs with
//! the 8-byte initialization vector to form the nonce.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U4};
use ccm::Ccm;
use itertools::Itertools;
use thiserror::Error;

/// AD type of an Encrypted Data structure.
pub const AD_TYPE_ENCRYPTED_DATA: u8 = 0x31;

/// Associated data prescribed for encrypted advertising payloads.
const ENC_ADV_AAD: [u8; 1] = [0xEA];

pub const RANDOMIZER_LEN: usize = 5;
pub const INIT_VECTOR_LEN: usize = 8;
pub const SESSION_KEY_LEN: usize = 16;
/// A user-supplied key blob is the session key followed by the IV.
pub const ENC_KEY_MATERIAL_LEN: usize = SESSION_KEY_LEN + INIT_VECTOR_LEN;
pub const MIC_LEN: usize = 4;

type Aes128CcmBluetooth = Ccm<Aes128, U4, U13>;

/// Key material for sealing encrypted advertising payloads.
#[derive(Debug, Clone, Copy)]
pub struct KeyMaterial {
    pub session_key: [u8; SESSION_KEY_LEN],
    pub init_vector: [u8; INIT_VECTOR_LEN],
}

impl KeyMaterial {
    /// Splits a 24-byte user-supplied blob into key and IV.
    pub fn from_user_blob(blob: &[u8]) -> Option<KeyMaterial> {
        if blob.len() != ENC_KEY_MATERIAL_LEN {
            return None;
        }
        let mut session_key = [0u8; SESSION_KEY_LEN];
        let mut init_vector = [0u8; INIT_VECTOR_LEN];
        session_key.copy_from_slice(&blob[..SESSION_KEY_LEN]);
        init_vector.copy_from_slice(&blob[SESSION_KEY_LEN..]);
        Some(KeyMaterial { session_key, init_vector })
    }
}

/// Source of shared key material when the advertiser did not supply its own.
pub trait EncKeyMaterialProvider: Send {
    fn read_enc_key_material(&self) -> KeyMaterial;
}

#[derive(Debug, Error)]
pub enum EncDataError {
    #[error("AES-CCM seal failed")]
    SealFailed,
    #[error("AES-CCM open failed")]
    OpenFailed,
}

/// Converts the controller's LE Rand output into the stored randomizer form.
/// The first five random bytes are kept, byte-reversed; both the nonce and
/// the on-air AD payload reverse them back to wire order.
pub fn randomizer_from_le_rand(rand: &[u8; 8]) -> [u8; RANDOMIZER_LEN] {
    let mut randomizer = [0u8; RANDOMIZER_LEN];
    randomizer.copy_from_slice(&rand[..RANDOMIZER_LEN]);
    randomizer.reverse();
    randomizer
}

/// Builds the 13-byte CCM nonce: reversed randomizer followed by reversed IV.
pub fn build_nonce(randomizer: &[u8; RANDOMIZER_LEN], iv: &[u8; INIT_VECTOR_LEN]) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    for (i, b) in randomizer.iter().rev().enumerate() {
        nonce[i] = *b;
    }
    for (i, b) in iv.iter().rev().enumerate() {
        nonce[RANDOMIZER_LEN + i] = *b;
    }
    nonce
}

/// Seals `payload`, returning ciphertext with the 4-byte MIC appended.
pub fn encrypt_adv_data(
    key: &[u8; SESSION_KEY_LEN],
    iv: &[u8; INIT_VECTOR_LEN],
    randomizer: &[u8; RANDOMIZER_LEN],
    payload: &[u8],
) -> Result<Vec<u8>, EncDataError> {
    let cipher = Aes128CcmBluetooth::new(GenericArray::from_slice(key));
    let nonce = build_nonce(randomizer, iv);
    cipher
        .encrypt(GenericArray::from_slice(&nonce), Payload { msg: payload, aad: &ENC_ADV_AAD })
        .map_err(|_| EncDataError::SealFailed)
}

/// Opens `sealed` (ciphertext ‖ MIC), returning the plaintext.
pub fn decrypt_adv_data(
    key: &[u8; SESSION_KEY_LEN],
    iv: &[u8; INIT_VECTOR_LEN],
    randomizer: &[u8; RANDOMIZER_LEN],
    sealed: &[u8],
) -> Result<Vec<u8>, EncDataError> {
    let cipher = Aes128CcmBluetooth::new(GenericArray::from_slice(key));
    let nonce = build_nonce(randomizer, iv);
    cipher
        .decrypt(GenericArray::from_slice(&nonce), Payload { msg: sealed, aad: &ENC_ADV_AAD })
        .map_err(|_| EncDataError::OpenFailed)
}

/// Seals `payload` and frames the complete Encrypted Data LTV:
/// `[len][0x31][randomizer (wire order, 5)][ciphertext][MIC (4)]`.
pub fn build_encrypted_ad(
    key: &[u8; SESSION_KEY_LEN],
    iv: &[u8; INIT_VECTOR_LEN],
    randomizer: &[u8; RANDOMIZER_LEN],
    payload: &[u8],
) -> Result<Vec<u8>, EncDataError> {
    let sealed = encrypt_adv_data(key, iv, randomizer, payload)?;
    let mut ad = Vec::with_capacity(2 + RANDOMIZER_LEN + sealed.len());
    ad.push((1 + RANDOMIZER_LEN + sealed.len()) as u8);
    ad.push(AD_TYPE_ENCRYPTED_DATA);
    ad.extend(randomizer.iter().rev());
    ad.extend_from_slice(&sealed);
    Ok(ad)
}

/// Uppercase hex rendering for the gated key-material debug dumps.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x11; 16];
    const IV: [u8; 8] = [0x22; 8];
    const RANDOMIZER: [u8; 5] = [0x33; 5];

    #[test]
    fn test_nonce_byte_order() {
        let randomizer = [0x01, 0x02, 0x03, 0x04, 0x05];
        let iv = [0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11];
        let nonce = build_nonce(&randomizer, &iv);
        assert_eq!(&nonce[..5], &[0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&nonce[5..], &[0x11, 0x10, 0x0F, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn test_randomizer_from_le_rand_takes_first_five_reversed() {
        let rand = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(randomizer_from_le_rand(&rand), [0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_seal_output_length() {
        let sealed = encrypt_adv_data(&KEY, &IV, &RANDOMIZER, &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(sealed.len(), 3 + MIC_LEN);
    }

    #[test]
    fn test_round_trip() {
        let plaintext = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x42];
        let sealed = encrypt_adv_data(&KEY, &IV, &RANDOMIZER, &plaintext).unwrap();
        let opened = decrypt_adv_data(&KEY, &IV, &RANDOMIZER, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_open_rejects_tampered_mic() {
        let mut sealed = encrypt_adv_data(&KEY, &IV, &RANDOMIZER, &[1, 2, 3]).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt_adv_data(&KEY, &IV, &RANDOMIZER, &sealed).is_err());
    }

    #[test]
    fn test_encrypted_ad_framing() {
        let ad = build_encrypted_ad(&KEY, &IV, &RANDOMIZER, &[0x01, 0x02, 0x03]).unwrap();
        // 2 header bytes + 5 randomizer + 3 ciphertext + 4 MIC.
        assert_eq!(ad.len(), 15);
        assert_eq!(ad[0], 13);
        assert_eq!(ad[1], AD_TYPE_ENCRYPTED_DATA);
        assert_eq!(&ad[2..7], &[0x33; 5]);
    }

    #[test]
    fn test_encrypted_ad_randomizer_matches_nonce_prefix() {
        let randomizer = [0x01, 0x02, 0x03, 0x04, 0x05];
        let ad = build_encrypted_ad(&KEY, &IV, &randomizer, &[0xAA]).unwrap();
        let nonce = build_nonce(&randomizer, &IV);
        assert_eq!(&ad[2..7], &nonce[..5]);
    }

    #[test]
    fn test_key_material_from_user_blob() {
        let mut blob = vec![0xAB; 16];
        blob.extend(vec![0xCD; 8]);
        let km = KeyMaterial::from_user_blob(&blob).unwrap();
        assert_eq!(km.session_key, [0xAB; 16]);
        assert_eq!(km.init_vector, [0xCD; 8]);
        assert!(KeyMaterial::from_user_blob(&blob[..23]).is_none());
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x0A, 0xFF, 0x00]), "0AFF00");
    }
}
