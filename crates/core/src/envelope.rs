// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Envelope codec: header magic, deterministic nonce derivation, and the
//! encrypt/decrypt pipeline over a buffered plaintext.
//!
//! The envelope is deliberately not an AEAD — see the module-level note on
//! [`decrypt`] for the threat model this accepts.

use crate::error::CryptoError;
use crate::keyfile::{KeyEntry, KeyFile};
use crate::stream_crypto::{mac_oneshot, CounterModeCipher};

/// Fixed 10-octet literal that opens every envelope.
pub const MAGIC: &[u8; 10] = b"\0GITCRYPT\0";
const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` under `entry`, returning `magic || nonce || ciphertext`.
///
/// The nonce is `first_12(HMAC(mac_key, plaintext))`: a deterministic
/// function of the whole plaintext, so the same plaintext under the same
/// key always produces byte-identical output (convergent encryption).
pub fn encrypt(plaintext: &[u8], entry: &KeyEntry) -> Result<Vec<u8>, CryptoError> {
    let tag = mac_oneshot(entry.mac_key(), plaintext)?;
    let nonce = &tag[..NONCE_LEN];

    let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + plaintext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(nonce);

    let mut body = plaintext.to_vec();
    let mut cipher = CounterModeCipher::new(entry.cipher_key(), nonce)?;
    cipher.apply_keystream(&mut body)?;
    out.extend_from_slice(&body);

    Ok(out)
}

/// Outcome of attempting to decrypt an envelope.
pub enum DecryptOutcome {
    /// The input did not start with the magic tag; returned verbatim.
    PassThrough(Vec<u8>),
    /// The input was a valid envelope, decrypted under the given key.
    Decrypted(Vec<u8>),
}

/// Decrypt `input` using whichever entry in `key_file` the caller selects.
///
/// If `input` does not begin with [`MAGIC`], it is returned unchanged via
/// [`DecryptOutcome::PassThrough`] — this lets a driver check out files
/// that were never encrypted, or that were checked out while the relevant
/// key was not installed.
///
/// This envelope carries no separate integrity tag on the ciphertext body:
/// an adversary with write access to the object store holding the
/// ciphertext can forge a payload that decrypts to attacker-chosen
/// plaintext. Integrity here rests entirely on the host version-control
/// system's content-addressed storage, not on this codec.
pub fn decrypt(input: &[u8], key_file: &KeyFile) -> Result<DecryptOutcome, CryptoError> {
    if !input.starts_with(MAGIC) {
        return Ok(DecryptOutcome::PassThrough(input.to_vec()));
    }

    let rest = &input[MAGIC.len()..];
    if rest.len() < NONCE_LEN {
        return Err(CryptoError::InvalidNonceLength { expected: NONCE_LEN, got: rest.len() });
    }
    let nonce = &rest[..NONCE_LEN];
    let ciphertext = &rest[NONCE_LEN..];

    let entry = key_file.latest().map_err(|_| CryptoError::KeyUnavailable)?;
    let mut body = ciphertext.to_vec();
    let mut cipher = CounterModeCipher::new(entry.cipher_key(), nonce)?;
    cipher.apply_keystream(&mut body)?;

    Ok(DecryptOutcome::Decrypted(body))
}
