// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! The `clean` / `smudge` / `diff` filter operations the host VCS invokes
//! on checkin and checkout.

use std::io::{Read, Write};
use std::path::Path;

use crate::envelope::{self, DecryptOutcome};
use crate::error::FilterError;
use crate::keyfile::{KeyEntry, KeyFile};

/// Read plaintext from `input`, write the encrypted envelope to `output`.
///
/// Succeeds on arbitrary binary content, including empty input — an empty
/// plaintext still produces a valid envelope of header, nonce, and zero
/// ciphertext octets.
pub fn clean<R: Read, W: Write>(mut input: R, mut output: W, entry: &KeyEntry) -> Result<(), FilterError> {
    let mut plaintext = Vec::new();
    input.read_to_end(&mut plaintext).map_err(FilterError::ReadFailed)?;

    let envelope = envelope::encrypt(&plaintext, entry)?;
    output.write_all(&envelope).map_err(FilterError::WriteFailed)?;
    output.flush().map_err(FilterError::WriteFailed)?;
    Ok(())
}

/// Read an envelope from `input`, write plaintext to `output`.
///
/// If the input does not begin with the magic tag, it is written back
/// unchanged (fall-through) rather than treated as an error — this lets a
/// file that was never encrypted, or was checked out before its key was
/// installed, round-trip cleanly. If the magic is present but no matching
/// key is installed, this fails with [`FilterError::KeyUnavailable`].
pub fn smudge<R: Read, W: Write>(mut input: R, mut output: W, key_file: &KeyFile) -> Result<(), FilterError> {
    let mut ciphertext = Vec::new();
    input.read_to_end(&mut ciphertext).map_err(FilterError::ReadFailed)?;

    if ciphertext.starts_with(envelope::MAGIC) && !key_file.is_filled() {
        return Err(FilterError::KeyUnavailable);
    }

    let plaintext = match envelope::decrypt(&ciphertext, key_file)? {
        DecryptOutcome::PassThrough(bytes) => bytes,
        DecryptOutcome::Decrypted(bytes) => bytes,
    };

    output.write_all(&plaintext).map_err(FilterError::WriteFailed)?;
    output.flush().map_err(FilterError::WriteFailed)?;
    Ok(())
}

/// Open `path`; if it begins with the magic tag and the key is available,
/// write plaintext to `output`, otherwise write the file verbatim. Used to
/// produce human-readable diffs of encrypted files without altering the
/// working tree.
pub fn diff<W: Write>(path: &Path, mut output: W, key_file: &KeyFile) -> Result<(), FilterError> {
    let contents = std::fs::read(path).map_err(FilterError::ReadFailed)?;

    if contents.starts_with(envelope::MAGIC) && !key_file.is_filled() {
        output.write_all(&contents).map_err(FilterError::WriteFailed)?;
        return Ok(());
    }

    let out = match envelope::decrypt(&contents, key_file)? {
        DecryptOutcome::PassThrough(bytes) => bytes,
        DecryptOutcome::Decrypted(bytes) => bytes,
    };
    output.write_all(&out).map_err(FilterError::WriteFailed)?;
    output.flush().map_err(FilterError::WriteFailed)?;
    Ok(())
}
