// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Key entries and key files: parsing, generation, and serialization of the
//! on-disk key material, in both the current tagged-field format and the
//! legacy 96-octet flat format.

use std::collections::BTreeMap;

use rand_core::RngCore;
use zeroize::Zeroize;

use crate::codec::{load_u32_be, store_u32_be, wipe};
use crate::error::KeyFileError;

const PREAMBLE: &[u8; 12] = b"\0GITCRYPTKEY";
const CURRENT_FORMAT_VERSION: u32 = 2;
const MAX_FIELD_LEN: u32 = 1 << 20;
const LEGACY_LEN: usize = 32 + 64;

const CIPHER_KEY_LEN: usize = 32;
const MAC_KEY_LEN: usize = 64;

const FIELD_HEADER_NAME: u32 = 1;
const FIELD_ENTRY_VERSION: u32 = 1;
const FIELD_ENTRY_CIPHER_KEY: u32 = 3;
const FIELD_ENTRY_MAC_KEY: u32 = 5;

/// A single versioned key entry: the symmetric material for one generation
/// of a key.
///
/// Both octet strings are wiped on drop; nothing about a partially
/// constructed entry is ever observable outside this module.
#[derive(Clone)]
pub struct KeyEntry {
    pub version: u32,
    cipher_key: [u8; CIPHER_KEY_LEN],
    mac_key: [u8; MAC_KEY_LEN],
}

impl KeyEntry {
    pub fn new(version: u32, cipher_key: [u8; CIPHER_KEY_LEN], mac_key: [u8; MAC_KEY_LEN]) -> Self {
        Self { version, cipher_key, mac_key }
    }

    /// Generate a fresh entry at `version` with cryptographically random
    /// key material.
    pub fn generate(version: u32) -> Self {
        let mut cipher_key = [0u8; CIPHER_KEY_LEN];
        let mut mac_key = [0u8; MAC_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut cipher_key);
        rand::thread_rng().fill_bytes(&mut mac_key);
        Self { version, cipher_key, mac_key }
    }

    pub fn cipher_key(&self) -> &[u8; CIPHER_KEY_LEN] {
        &self.cipher_key
    }

    pub fn mac_key(&self) -> &[u8; MAC_KEY_LEN] {
        &self.mac_key
    }
}

impl PartialEq for KeyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && crate::codec::constant_time_eq(&self.cipher_key, &other.cipher_key)
            && crate::codec::constant_time_eq(&self.mac_key, &other.mac_key)
    }
}

impl Drop for KeyEntry {
    fn drop(&mut self) {
        wipe(&mut self.cipher_key);
        wipe(&mut self.mac_key);
    }
}

/// Outcome of decoding one unrecognized tagged field: the odd/even
/// forward-compatibility discipline shared by the key-file header and
/// every entry.
enum FieldOutcome {
    SkippableUnknown,
    CriticalUnknown(u32),
}

fn classify_unknown(field_id: u32) -> FieldOutcome {
    if field_id % 2 == 1 {
        FieldOutcome::CriticalUnknown(field_id)
    } else {
        FieldOutcome::SkippableUnknown
    }
}

/// Cursor over a tagged-field record stream: `(field_id:u32 BE,
/// field_len:u32 BE, payload)` repeated until a record with `field_id ==
/// 0` is seen.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read the next field. Returns `Ok(None)` at the bare 4-octet
    /// `field_id == 0` terminator (which carries no length or payload).
    fn next_field(&mut self) -> Result<Option<(u32, &'a [u8])>, KeyFileError> {
        if self.pos + 4 > self.buf.len() {
            return Err(KeyFileError::Malformed("truncated field header".into()));
        }
        let field_id = load_u32_be(&self.buf[self.pos..]);
        self.pos += 4;

        if field_id == 0 {
            return Ok(None);
        }

        if self.pos + 4 > self.buf.len() {
            return Err(KeyFileError::Malformed("truncated field header".into()));
        }
        let field_len = load_u32_be(&self.buf[self.pos..]);
        self.pos += 4;

        if field_len > MAX_FIELD_LEN {
            return Err(KeyFileError::Malformed("field length exceeds maximum".into()));
        }
        let field_len = field_len as usize;
        if self.pos + field_len > self.buf.len() {
            return Err(KeyFileError::Malformed("truncated field payload".into()));
        }
        let payload = &self.buf[self.pos..self.pos + field_len];
        self.pos += field_len;
        Ok(Some((field_id, payload)))
    }
}

fn write_field(out: &mut Vec<u8>, field_id: u32, payload: &[u8]) {
    let mut id_buf = [0u8; 4];
    let mut len_buf = [0u8; 4];
    store_u32_be(field_id, &mut id_buf);
    store_u32_be(payload.len() as u32, &mut len_buf);
    out.extend_from_slice(&id_buf);
    out.extend_from_slice(&len_buf);
    out.extend_from_slice(payload);
}

fn write_terminator(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0u8; 4]);
}

fn validate_key_name(name: &str) -> Result<(), KeyFileError> {
    if name.is_empty() {
        return Err(KeyFileError::InvalidKeyName("name must not be empty".into()));
    }
    if name.len() > 128 {
        return Err(KeyFileError::InvalidKeyName("name exceeds 128 octets".into()));
    }
    for byte in name.bytes() {
        if byte <= 0x1F || byte == 0x7F || byte == b'/' || byte == b'\\' || byte == b':' {
            return Err(KeyFileError::InvalidKeyName(format!(
                "name contains disallowed octet 0x{byte:02x}"
            )));
        }
    }
    Ok(())
}

/// A key file: an optional name and a set of versioned entries.
#[derive(Clone, Default)]
pub struct KeyFile {
    name: Option<String>,
    entries: BTreeMap<u32, KeyEntry>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(name: String) -> Result<Self, KeyFileError> {
        validate_key_name(&name)?;
        Ok(Self { name: Some(name), entries: BTreeMap::new() })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True once at least one entry is present.
    pub fn is_filled(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Insert `entry` by version. Replacing an existing version is an error.
    pub fn add(&mut self, entry: KeyEntry) -> Result<(), KeyFileError> {
        if self.entries.contains_key(&entry.version) {
            return Err(KeyFileError::Malformed(format!(
                "key file already has an entry at version {}",
                entry.version
            )));
        }
        self.entries.insert(entry.version, entry);
        Ok(())
    }

    pub fn latest(&self) -> Result<&KeyEntry, KeyFileError> {
        self.entries
            .values()
            .max_by_key(|e| e.version)
            .ok_or_else(|| KeyFileError::Malformed("key file has no entries".into()))
    }

    pub fn get(&self, version: u32) -> Option<&KeyEntry> {
        self.entries.get(&version)
    }

    pub fn entries(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.values()
    }

    /// Wipe all entry secrets and clear the map.
    pub fn destroy(&mut self) {
        self.entries.clear();
        if let Some(name) = self.name.as_mut() {
            name.zeroize();
        }
        self.name = None;
    }

    /// Build a freshly generated key file containing a single entry at the
    /// current format version.
    pub fn generate(name: Option<String>) -> Result<Self, KeyFileError> {
        if let Some(n) = &name {
            validate_key_name(n)?;
        }
        let mut file = Self { name, entries: BTreeMap::new() };
        file.add(KeyEntry::generate(0)).expect("empty key file never has a version collision");
        Ok(file)
    }

    /// Serialize in the current tagged-field format. Entries are emitted
    /// in descending version order after the header.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(PREAMBLE);
        let mut version_buf = [0u8; 4];
        store_u32_be(CURRENT_FORMAT_VERSION, &mut version_buf);
        out.extend_from_slice(&version_buf);

        if let Some(name) = &self.name {
            write_field(&mut out, FIELD_HEADER_NAME, name.as_bytes());
        }
        write_terminator(&mut out);

        let mut versions: Vec<u32> = self.entries.keys().copied().collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        for version in versions {
            let entry = &self.entries[&version];
            let mut version_field = [0u8; 4];
            store_u32_be(entry.version, &mut version_field);
            write_field(&mut out, FIELD_ENTRY_VERSION, &version_field);
            write_field(&mut out, FIELD_ENTRY_CIPHER_KEY, &entry.cipher_key);
            write_field(&mut out, FIELD_ENTRY_MAC_KEY, &entry.mac_key);
            write_terminator(&mut out);
        }
        out
    }

    /// Parse an octet stream, trying the current tagged-field format first
    /// and falling back to the legacy 96-octet layout.
    pub fn parse(buf: &[u8]) -> Result<Self, KeyFileError> {
        if buf.starts_with(PREAMBLE) {
            Self::parse_current(buf)
        } else {
            Self::parse_legacy(buf)
        }
    }

    fn parse_current(buf: &[u8]) -> Result<Self, KeyFileError> {
        if buf.len() < PREAMBLE.len() + 4 {
            return Err(KeyFileError::Malformed("truncated preamble".into()));
        }
        let version = load_u32_be(&buf[PREAMBLE.len()..]);
        if version != CURRENT_FORMAT_VERSION {
            return Err(KeyFileError::Incompatible(format!(
                "unsupported key file format version {version}"
            )));
        }

        let mut reader = FieldReader::new(&buf[PREAMBLE.len() + 4..]);
        let mut name = None;
        loop {
            match reader.next_field()? {
                None => break,
                Some((FIELD_HEADER_NAME, payload)) => {
                    let parsed = std::str::from_utf8(payload)
                        .map_err(|_| KeyFileError::Malformed("key name is not valid UTF-8".into()))?;
                    validate_key_name(parsed)?;
                    name = Some(parsed.to_string());
                }
                Some((field_id, _)) => match classify_unknown(field_id) {
                    FieldOutcome::CriticalUnknown(id) => {
                        return Err(KeyFileError::Incompatible(format!(
                            "unknown critical header field {id}"
                        )));
                    }
                    FieldOutcome::SkippableUnknown => {}
                },
            }
        }

        let mut file = Self { name, entries: BTreeMap::new() };

        let remaining = &buf[PREAMBLE.len() + 4 + reader.pos..];
        let mut pos = 0usize;
        while pos < remaining.len() {
            let (entry, consumed) = Self::parse_entry(&remaining[pos..])?;
            file.add(entry)?;
            pos += consumed;
        }

        Ok(file)
    }

    fn parse_entry(buf: &[u8]) -> Result<(KeyEntry, usize), KeyFileError> {
        let mut reader = FieldReader::new(buf);
        let mut version: Option<u32> = None;
        let mut cipher_key: Option<[u8; CIPHER_KEY_LEN]> = None;
        let mut mac_key: Option<[u8; MAC_KEY_LEN]> = None;

        loop {
            match reader.next_field()? {
                None => break,
                Some((FIELD_ENTRY_VERSION, payload)) => {
                    if payload.len() != 4 {
                        return Err(KeyFileError::Malformed("entry version must be 4 octets".into()));
                    }
                    version = Some(load_u32_be(payload));
                }
                Some((FIELD_ENTRY_CIPHER_KEY, payload)) => {
                    if payload.len() != CIPHER_KEY_LEN {
                        return Err(KeyFileError::Malformed("cipher key must be 32 octets".into()));
                    }
                    let mut key = [0u8; CIPHER_KEY_LEN];
                    key.copy_from_slice(payload);
                    cipher_key = Some(key);
                }
                Some((FIELD_ENTRY_MAC_KEY, payload)) => {
                    if payload.len() != MAC_KEY_LEN {
                        return Err(KeyFileError::Malformed("MAC key must be 64 octets".into()));
                    }
                    let mut key = [0u8; MAC_KEY_LEN];
                    key.copy_from_slice(payload);
                    mac_key = Some(key);
                }
                Some((field_id, _)) => match classify_unknown(field_id) {
                    FieldOutcome::CriticalUnknown(id) => {
                        return Err(KeyFileError::Incompatible(format!(
                            "unknown critical entry field {id}"
                        )));
                    }
                    FieldOutcome::SkippableUnknown => {}
                },
            }
        }

        let version = version.ok_or_else(|| KeyFileError::Malformed("entry missing version field".into()))?;
        let cipher_key = cipher_key.ok_or_else(|| KeyFileError::Malformed("entry missing cipher key".into()))?;
        let mac_key = mac_key.ok_or_else(|| KeyFileError::Malformed("entry missing MAC key".into()))?;

        Ok((KeyEntry::new(version, cipher_key, mac_key), reader.pos))
    }

    fn parse_legacy(buf: &[u8]) -> Result<Self, KeyFileError> {
        if buf.len() != LEGACY_LEN {
            return Err(KeyFileError::Malformed(format!(
                "not a recognized key file (expected {LEGACY_LEN} octets for legacy format, got {})",
                buf.len()
            )));
        }
        let mut cipher_key = [0u8; CIPHER_KEY_LEN];
        let mut mac_key = [0u8; MAC_KEY_LEN];
        cipher_key.copy_from_slice(&buf[..CIPHER_KEY_LEN]);
        mac_key.copy_from_slice(&buf[CIPHER_KEY_LEN..]);

        let mut file = Self::new();
        file.add(KeyEntry::new(0, cipher_key, mac_key))?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_filled_single_entry_file() {
        let file = KeyFile::generate(None).unwrap();
        assert!(file.is_filled());
        assert_eq!(file.latest().unwrap().version, 0);
    }

    #[test]
    fn roundtrip_named_multi_version_file() {
        let mut file = KeyFile::with_name("team-A".to_string()).unwrap();
        file.add(KeyEntry::generate(1)).unwrap();
        file.add(KeyEntry::generate(2)).unwrap();

        let bytes = file.serialize();
        let parsed = KeyFile::parse(&bytes).unwrap();

        assert_eq!(parsed.name(), Some("team-A"));
        assert_eq!(parsed.latest().unwrap().version, 2);
        assert_eq!(
            parsed.get(1).unwrap().cipher_key(),
            file.get(1).unwrap().cipher_key()
        );
    }

    #[test]
    fn adding_duplicate_version_is_rejected() {
        let mut file = KeyFile::new();
        file.add(KeyEntry::generate(1)).unwrap();
        let err = file.add(KeyEntry::generate(1)).unwrap_err();
        assert!(matches!(err, KeyFileError::Malformed(_)));
    }

    #[test]
    fn legacy_96_octet_file_parses_as_version_zero() {
        let mut buf = vec![0u8; LEGACY_LEN];
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let file = KeyFile::parse(&buf).unwrap();
        let entry = file.latest().unwrap();
        assert_eq!(entry.version, 0);
        assert_eq!(entry.cipher_key(), &buf[0..32]);
        assert_eq!(entry.mac_key(), &buf[32..96]);
    }

    #[test]
    fn truncated_entry_is_malformed_not_partial() {
        let file = KeyFile::generate(None).unwrap();
        let mut bytes = file.serialize();
        bytes.truncate(bytes.len() - 5);
        let err = KeyFile::parse(&bytes).unwrap_err();
        assert!(matches!(err, KeyFileError::Malformed(_)));
    }

    #[test]
    fn unknown_even_header_field_is_skipped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        let mut version_buf = [0u8; 4];
        store_u32_be(CURRENT_FORMAT_VERSION, &mut version_buf);
        bytes.extend_from_slice(&version_buf);
        write_field(&mut bytes, 100, b"ignore me");
        write_terminator(&mut bytes);

        let file = KeyFile::parse(&bytes).unwrap();
        assert!(!file.is_filled());
        assert_eq!(file.name(), None);
    }

    #[test]
    fn unknown_odd_header_field_is_incompatible() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        let mut version_buf = [0u8; 4];
        store_u32_be(CURRENT_FORMAT_VERSION, &mut version_buf);
        bytes.extend_from_slice(&version_buf);
        write_field(&mut bytes, 101, b"must understand me");
        write_terminator(&mut bytes);

        let err = KeyFile::parse(&bytes).unwrap_err();
        assert!(matches!(err, KeyFileError::Incompatible(_)));
    }

    #[test]
    fn rejects_oversized_field_length() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(PREAMBLE);
        let mut version_buf = [0u8; 4];
        store_u32_be(CURRENT_FORMAT_VERSION, &mut version_buf);
        bytes.extend_from_slice(&version_buf);
        let mut id_buf = [0u8; 4];
        let mut len_buf = [0u8; 4];
        store_u32_be(2, &mut id_buf);
        store_u32_be(MAX_FIELD_LEN + 1, &mut len_buf);
        bytes.extend_from_slice(&id_buf);
        bytes.extend_from_slice(&len_buf);

        let err = KeyFile::parse(&bytes).unwrap_err();
        assert!(matches!(err, KeyFileError::Malformed(_)));
    }

    #[test]
    fn key_name_validation_rejects_path_separators() {
        assert!(validate_key_name("team/A").is_err());
        assert!(validate_key_name("team\\A").is_err());
        assert!(validate_key_name("team:A").is_err());
        assert!(validate_key_name("").is_err());
        assert!(validate_key_name(&"x".repeat(129)).is_err());
        assert!(validate_key_name("team-A").is_ok());
    }

    #[test]
    fn destroy_clears_entries_and_name() {
        let mut file = KeyFile::with_name("x".to_string()).unwrap();
        file.add(KeyEntry::generate(0)).unwrap();
        file.destroy();
        assert!(!file.is_filled());
        assert_eq!(file.name(), None);
    }
}
