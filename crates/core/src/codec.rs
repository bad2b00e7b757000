// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Big-endian integer codec and secret-handling primitives.
//!
//! Kept deliberately small and dependency-light: every other module that
//! touches key material or wire-format integers goes through here so the
//! constant-time and wipe-on-drop disciplines are enforced in one place.

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Store a `u32` into `buf` as big-endian bytes.
///
/// # Panics
/// Panics if `buf` is shorter than 4 bytes.
pub fn store_u32_be(value: u32, buf: &mut [u8]) {
    buf[..4].copy_from_slice(&value.to_be_bytes());
}

/// Load a big-endian `u32` from the first 4 bytes of `buf`.
///
/// # Panics
/// Panics if `buf` is shorter than 4 bytes.
pub fn load_u32_be(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    u32::from_be_bytes(bytes)
}

/// Compare two equal-length byte strings in constant time.
///
/// Returns `false` immediately (in O(1), without comparing) if the lengths
/// differ — callers that need the stronger guarantee of a fixed comparison
/// time regardless of length should pad to a known size first. For buffers
/// of the same length, the comparison's running time depends only on that
/// length, never on the position of the first mismatching byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Overwrite every byte of `buf` with zero in a way the compiler cannot
/// optimize away, even though the buffer is about to be dropped or go out
/// of scope.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_be_roundtrip() {
        let mut buf = [0u8; 4];
        store_u32_be(0xDEADBEEF, &mut buf);
        assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(load_u32_be(&buf), 0xDEADBEEF);
    }

    #[test]
    fn u32_be_zero() {
        let mut buf = [0xFFu8; 4];
        store_u32_be(0, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
        assert_eq!(load_u32_be(&buf), 0);
    }

    #[test]
    fn constant_time_eq_equal() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
    }

    #[test]
    fn constant_time_eq_mismatch_anywhere() {
        assert!(!constant_time_eq(b"abcdef", b"zbcdef"));
        assert!(!constant_time_eq(b"abcdef", b"abcdez"));
        assert!(!constant_time_eq(b"abcdef", b"abzdef"));
    }

    #[test]
    fn constant_time_eq_length_mismatch() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"a"));
    }

    #[test]
    fn wipe_zeroes_buffer() {
        let mut buf = [0x42u8; 32];
        wipe(&mut buf);
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn wipe_empty_buffer_is_noop() {
        let mut buf: [u8; 0] = [];
        wipe(&mut buf);
        assert_eq!(buf.len(), 0);
    }
}
