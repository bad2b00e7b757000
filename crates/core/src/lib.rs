// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Transparent file-encryption core for version-controlled working trees.
//!
//! This crate implements the cryptographic envelope, key-file format, and
//! filter-driver operations that let a host version-control system store
//! certain paths encrypted at rest while presenting plaintext in the
//! working tree, without requiring a trust relationship with the object
//! store itself.
//!
//! ```rust
//! use cryptattic_core::keyfile::KeyEntry;
//! use cryptattic_core::envelope::{encrypt, decrypt, DecryptOutcome};
//! use cryptattic_core::keyfile::KeyFile;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let entry = KeyEntry::generate(0);
//! let envelope = encrypt(b"hello", &entry)?;
//!
//! let mut key_file = KeyFile::new();
//! key_file.add(entry)?;
//!
//! match decrypt(&envelope, &key_file)? {
//!     DecryptOutcome::Decrypted(plaintext) => assert_eq!(plaintext, b"hello"),
//!     DecryptOutcome::PassThrough(_) => unreachable!(),
//! }
//! # Ok(())
//! # }
//! ```

pub mod attributes;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod keyfile;
pub mod process;
pub mod repo;
pub mod secret;
pub mod stream_crypto;

pub use error::GitCryptError;
