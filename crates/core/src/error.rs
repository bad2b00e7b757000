// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Unified error hierarchy for the crate.

use thiserror::Error;

/// Top-level unified error type for crate operations.
#[derive(Error, Debug)]
pub enum GitCryptError {
    #[error("cryptographic operation failed")]
    Crypto(#[from] CryptoError),

    #[error("key file error")]
    KeyFile(#[from] KeyFileError),

    #[error("filter driver error")]
    Filter(#[from] FilterError),

    #[error("repository lifecycle error")]
    Repo(#[from] RepoError),

    #[error("host VCS error")]
    HostVcs(#[from] HostVcsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the stream-crypto and envelope layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },

    #[error("input exceeds the safe counter-mode length for a single (key, nonce) pair")]
    CryptoLimitExceeded,

    #[error("key unavailable: no installed key matches this envelope")]
    KeyUnavailable,
}

/// Errors from parsing or serializing a key file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyFileError {
    #[error("malformed key file: {0}")]
    Malformed(String),

    #[error("incompatible key file: {0}")]
    Incompatible(String),

    #[error("invalid key name: {0}")]
    InvalidKeyName(String),
}

/// Errors surfaced by the `clean`/`smudge`/`diff` filter operations.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("key unavailable for this envelope")]
    KeyUnavailable,

    #[error("failed to read standard input")]
    ReadFailed(#[source] std::io::Error),

    #[error("failed to write standard output")]
    WriteFailed(#[source] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors from the repository lifecycle operations (`init`, `unlock`, `lock`, …).
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("key '{0}' is already initialized")]
    AlreadyInitialized(String),

    #[error("key '{0}' is not initialized")]
    NotInitialized(String),

    #[error("working directory has staged or unstaged modifications")]
    WorkingDirectoryDirty,

    #[error(transparent)]
    KeyFile(#[from] KeyFileError),

    #[error(transparent)]
    HostVcs(#[from] HostVcsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from invoking the host VCS as a child process.
#[derive(Error, Debug)]
pub enum HostVcsError {
    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with status {status}")]
    NonZeroExit { command: String, status: i32 },

    #[error("protocol violation from '{command}': {detail}")]
    ProtocolViolation { command: String, detail: String },

    #[error("'{command}' produced output that could not be decoded: {detail}")]
    BadOutput { command: String, detail: String },
}
