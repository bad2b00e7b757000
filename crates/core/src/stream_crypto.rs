// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Block cipher in counter mode and an incremental MAC, the two primitives
//! the envelope codec composes into convergent encryption.

use aes::Aes256;
use cipher::{BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::CryptoError;

const CIPHER_KEY_LEN: usize = 32;
const MAC_KEY_LEN: usize = 64;
const BLOCK_LEN: usize = 16;
const NONCE_LEN: usize = 12;
pub const MAC_TAG_LEN: usize = 20;

/// Maximum octets a single (key, nonce) pair may encrypt: 2^68, i.e. 2^32
/// sixteen-octet blocks, before the big-endian block-index counter would
/// wrap around.
const MAX_OCTETS_PER_NONCE: u128 = (1u128 << 32) * BLOCK_LEN as u128;

/// AES-256 in counter mode, keyed with a 32-octet key and a 16-octet
/// initial counter (12-octet nonce || 4-octet big-endian block index).
///
/// Encryption and decryption are the same operation: the cipher produces a
/// keystream from the counter and XORs it with the input.
pub struct CounterModeCipher {
    cipher: Aes256,
    counter: [u8; BLOCK_LEN],
    octets_processed: u128,
}

impl CounterModeCipher {
    /// Construct a cipher keyed with `key` (must be 32 octets) and an
    /// initial counter built from `nonce` (must be 12 octets) with a
    /// zero block index.
    pub fn new(key: &[u8], nonce: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != CIPHER_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: CIPHER_KEY_LEN,
                got: key.len(),
            });
        }
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_LEN,
                got: nonce.len(),
            });
        }
        let cipher = Aes256::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKeyLength { expected: CIPHER_KEY_LEN, got: key.len() })?;
        let mut counter = [0u8; BLOCK_LEN];
        counter[..NONCE_LEN].copy_from_slice(nonce);
        Ok(Self {
            cipher,
            counter,
            octets_processed: 0,
        })
    }

    fn block_index(&self) -> u32 {
        let mut idx = [0u8; 4];
        idx.copy_from_slice(&self.counter[NONCE_LEN..]);
        u32::from_be_bytes(idx)
    }

    fn set_block_index(&mut self, idx: u32) {
        self.counter[NONCE_LEN..].copy_from_slice(&idx.to_be_bytes());
    }

    /// Apply the keystream to `data` in place (encrypting plaintext or
    /// decrypting ciphertext — the operation is identical either way).
    pub fn apply_keystream(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        let projected = self.octets_processed + data.len() as u128;
        if projected > MAX_OCTETS_PER_NONCE {
            return Err(CryptoError::CryptoLimitExceeded);
        }

        for chunk in data.chunks_mut(BLOCK_LEN) {
            let mut block = cipher::generic_array::GenericArray::clone_from_slice(&self.counter);
            self.cipher.encrypt_block(&mut block);
            for (byte, ks) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= ks;
            }
            let next = self.block_index().checked_add(1).ok_or(CryptoError::CryptoLimitExceeded)?;
            self.set_block_index(next);
        }
        self.octets_processed = projected;
        Ok(())
    }
}

/// Incremental HMAC-SHA1 over a 64-octet secret key, producing a 20-octet
/// tag. `update` may be called any number of times; `finalize` consumes
/// the state.
pub struct IncrementalMac {
    inner: Hmac<Sha1>,
}

impl IncrementalMac {
    pub fn new(mac_key: &[u8]) -> Result<Self, CryptoError> {
        if mac_key.len() != MAC_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: MAC_KEY_LEN,
                got: mac_key.len(),
            });
        }
        let inner = Hmac::<Sha1>::new_from_slice(mac_key)
            .map_err(|_| CryptoError::InvalidKeyLength { expected: MAC_KEY_LEN, got: mac_key.len() })?;
        Ok(Self { inner })
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> [u8; MAC_TAG_LEN] {
        let tag = self.inner.finalize().into_bytes();
        let mut out = [0u8; MAC_TAG_LEN];
        out.copy_from_slice(&tag);
        out
    }
}

/// Convenience one-shot MAC over a single buffer.
pub fn mac_oneshot(mac_key: &[u8], data: &[u8]) -> Result<[u8; MAC_TAG_LEN], CryptoError> {
    let mut mac = IncrementalMac::new(mac_key)?;
    mac.update(data);
    Ok(mac.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key32() -> [u8; 32] {
        [0x11; 32]
    }

    fn key64() -> [u8; 64] {
        [0x22; 64]
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let nonce = [0x05u8; NONCE_LEN];
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();

        let mut enc = CounterModeCipher::new(&key32(), &nonce).unwrap();
        let mut ciphertext = plaintext.clone();
        enc.apply_keystream(&mut ciphertext).unwrap();
        assert_ne!(ciphertext, plaintext);

        let mut dec = CounterModeCipher::new(&key32(), &nonce).unwrap();
        let mut recovered = ciphertext.clone();
        dec.apply_keystream(&mut recovered).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn empty_input_is_noop() {
        let mut cipher = CounterModeCipher::new(&key32(), &[0u8; NONCE_LEN]).unwrap();
        let mut data: Vec<u8> = Vec::new();
        cipher.apply_keystream(&mut data).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn rejects_bad_key_length() {
        let err = CounterModeCipher::new(&[0u8; 31], &[0u8; NONCE_LEN]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidKeyLength { expected: 32, got: 31 });
    }

    #[test]
    fn rejects_bad_nonce_length() {
        let err = CounterModeCipher::new(&key32(), &[0u8; 11]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidNonceLength { expected: 12, got: 11 });
    }

    #[test]
    fn exactly_one_block_consumes_index_zero_only() {
        let mut cipher = CounterModeCipher::new(&key32(), &[7u8; NONCE_LEN]).unwrap();
        let mut data = vec![0u8; BLOCK_LEN];
        cipher.apply_keystream(&mut data).unwrap();
        assert_eq!(cipher.block_index(), 1);
    }

    #[test]
    fn refuses_past_counter_limit() {
        let mut cipher = CounterModeCipher::new(&key32(), &[0u8; NONCE_LEN]).unwrap();
        cipher.octets_processed = MAX_OCTETS_PER_NONCE - BLOCK_LEN as u128;
        let mut one_more_block = vec![0u8; BLOCK_LEN * 2];
        let err = cipher.apply_keystream(&mut one_more_block).unwrap_err();
        assert_eq!(err, CryptoError::CryptoLimitExceeded);
    }

    #[test]
    fn mac_is_deterministic_and_key_sensitive() {
        let tag_a = mac_oneshot(&key64(), b"hello world").unwrap();
        let tag_b = mac_oneshot(&key64(), b"hello world").unwrap();
        assert_eq!(tag_a, tag_b);

        let mut other_key = key64();
        other_key[0] ^= 0xFF;
        let tag_c = mac_oneshot(&other_key, b"hello world").unwrap();
        assert_ne!(tag_a, tag_c);
    }

    #[test]
    fn mac_incremental_matches_oneshot() {
        let mut incremental = IncrementalMac::new(&key64()).unwrap();
        incremental.update(b"hello ");
        incremental.update(b"world");
        let tag_incremental = incremental.finalize();

        let tag_oneshot = mac_oneshot(&key64(), b"hello world").unwrap();
        assert_eq!(tag_incremental, tag_oneshot);
    }

    #[test]
    fn mac_rejects_bad_key_length() {
        let err = IncrementalMac::new(&[0u8; 63]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidKeyLength { expected: 64, got: 63 });
    }
}
