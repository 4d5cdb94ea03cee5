// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The opaque work item the host hands the driver, and the nonce-range
//! cursor used only in `RANGE` mode.

use std::fmt;

pub const MIDSTATE_LEN: usize = 32;
pub const TAIL_LEN: usize = 12;

/// Precomputed SHA-256 midstate plus the final 12 bytes of the block
/// header. The driver never interprets these bytes; it only copies them
/// into wire payloads and matches them back against result lines.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Work {
    pub midstate: [u8; MIDSTATE_LEN],
    pub tail: [u8; TAIL_LEN],
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("midstate", &hex::encode(self.midstate))
            .field("tail", &hex::encode(self.tail))
            .finish()
    }
}

impl Work {
    pub fn new(midstate: [u8; MIDSTATE_LEN], tail: [u8; TAIL_LEN]) -> Self {
        Self { midstate, tail }
    }
}

/// A host-local handle for a bulk-queue work item. Never placed on the
/// wire: the wire match key is always `(midstate, tail)` per `spec.md`
/// §4.5. Exists only so the driver and its tests can refer to a specific
/// queue entry without re-comparing 44 bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkId(pub u64);

/// The nonce-range window currently outstanding for the one-job RANGE
/// protocol. The search space is split into fifths by the caller
/// (`bitforce-driver`); this type only tracks the current cursor and the
/// most recently issued window so returned nonces can be validated
/// against it (invariant (v)).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NonceWindow {
    /// Next unissued nonce.
    cursor: u32,
    /// `[base, base + nonces]` most recently sent to the device.
    last_issued: Option<(u32, u32)>,
}

impl NonceWindow {
    pub fn new() -> Self {
        Self {
            cursor: 0,
            last_issued: None,
        }
    }

    /// Issues the next `[base, base + nonces]` window and advances the
    /// cursor by `nonces + 1`, per `spec.md` §4.4's job preparation step.
    pub fn issue(&mut self, nonces: u32) -> (u32, u32) {
        let base = self.cursor;
        let window = (base, base.wrapping_add(nonces));
        self.last_issued = Some(window);
        self.cursor = self.cursor.wrapping_add(nonces).wrapping_add(1);
        window
    }

    /// Invariant (v): a returned nonce must lie in the most recently
    /// issued window.
    pub fn validate(&self, nonce: u32) -> bool {
        match self.last_issued {
            Some((base, end)) if base <= end => (base..=end).contains(&nonce),
            // wrapped window: treat as invalid, demote (never observed in
            // practice since the fifth-of-space split keeps windows well
            // inside u32 range, but guards against a malformed split).
            Some(_) => false,
            None => false,
        }
    }
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal hex encode/decode used for logging and wire parsing. Kept
/// in-crate rather than pulling in the `hex` crate for two tiny
/// functions used only on fixed-size arrays and short strings.
pub mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut s = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn decode_into(s: &str, out: &mut [u8]) -> Option<()> {
        if s.len() != out.len() * 2 {
            return None;
        }
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            out[i] = ((hi << 4) | lo) as u8;
        }
        Some(())
    }

    pub fn decode_u32(s: &str) -> Option<u32> {
        u32::from_str_radix(s, 16).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_window_advances_by_count_plus_one() {
        let mut w = NonceWindow::new();
        let (base, end) = w.issue(99);
        assert_eq!((base, end), (0, 99));
        let (base2, _) = w.issue(99);
        assert_eq!(base2, 100);
    }

    #[test]
    fn nonce_window_validates_last_window_only() {
        let mut w = NonceWindow::new();
        w.issue(10);
        assert!(w.validate(0));
        assert!(w.validate(10));
        assert!(!w.validate(11));
        w.issue(10);
        assert!(!w.validate(5));
        assert!(w.validate(15));
    }

    #[test]
    fn hex_roundtrip() {
        let mut out = [0u8; 4];
        hex::decode_into("deadbeef", &mut out).unwrap();
        assert_eq!(hex::encode(out), "deadbeef");
    }
}
