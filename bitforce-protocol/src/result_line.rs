// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsers for the two result-line shapes the device can send: the
//! one-job `NONCE-FOUND:` line and the bulk-queue result line.

use crate::work::{hex, MIDSTATE_LEN, TAIL_LEN};

/// One line of a `ZOX` `COUNT:N` batch: hex midstate/tail, an optional
/// chip index (present only when the board negotiated protocol-parallel),
/// a decimal nonce count and that many hex nonces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueResultLine {
    pub midstate: [u8; MIDSTATE_LEN],
    pub tail: [u8; TAIL_LEN],
    pub chip_index: Option<u8>,
    pub nonces: Vec<u32>,
}

/// Parses one `ZOX` result line. `parallel` must reflect whether the
/// board negotiated protocol-parallel at probe time: the wire format is
/// ambiguous in isolation (a chip-index field and a nonce-count field are
/// both plain hex/decimal tokens), so the caller supplies the context
/// instead of guessing from the line's shape.
pub fn parse_queue_result_line(line: &str, parallel: bool) -> Option<QueueResultLine> {
    let mut parts = line.trim().split(',');

    let midstate_hex = parts.next()?;
    let tail_hex = parts.next()?;
    let mut midstate = [0u8; MIDSTATE_LEN];
    hex::decode_into(midstate_hex, &mut midstate)?;
    let mut tail = [0u8; TAIL_LEN];
    hex::decode_into(tail_hex, &mut tail)?;

    let chip_index = if parallel {
        Some(u8::from_str_radix(parts.next()?, 16).ok()?)
    } else {
        None
    };

    let nonce_count: usize = parts.next()?.parse().ok()?;
    let mut nonces = Vec::with_capacity(nonce_count);
    for _ in 0..nonce_count {
        nonces.push(hex::decode_u32(parts.next()?)?);
    }

    Some(QueueResultLine {
        midstate,
        tail,
        chip_index,
        nonces,
    })
}

/// Parses a one-job `NONCE-FOUND:<hex>(,<hex>)*` line.
pub fn parse_nonce_found(line: &str) -> Option<Vec<u32>> {
    let rest = line.trim().strip_prefix("NONCE-FOUND:")?;
    rest.split(',').map(|h| hex::decode_u32(h.trim())).collect()
}

/// Parses a `COUNT:N` prefix line, returning `N`.
pub fn parse_count_prefix(line: &str) -> Option<usize> {
    line.trim().strip_prefix("COUNT:")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(b: u8) -> (String, [u8; MIDSTATE_LEN], [u8; TAIL_LEN]) {
        let midstate = [b; MIDSTATE_LEN];
        let tail = [b.wrapping_add(1); TAIL_LEN];
        (format!("{}{}", hex::encode(midstate), hex::encode(tail)), midstate, tail)
    }

    #[test]
    fn parses_non_parallel_result_with_nonce() {
        let (_, midstate, tail) = mk(0);
        let line = format!("{},{},1,00000001", hex::encode(midstate), hex::encode(tail));
        let parsed = parse_queue_result_line(&line, false).unwrap();
        assert_eq!(parsed.midstate, midstate);
        assert_eq!(parsed.tail, tail);
        assert_eq!(parsed.chip_index, None);
        assert_eq!(parsed.nonces, vec![1]);
    }

    #[test]
    fn parses_non_parallel_result_with_no_nonce() {
        let (_, midstate, tail) = mk(1);
        let line = format!("{},{},0", hex::encode(midstate), hex::encode(tail));
        let parsed = parse_queue_result_line(&line, false).unwrap();
        assert!(parsed.nonces.is_empty());
    }

    #[test]
    fn parses_parallel_result_with_chip_index() {
        let (_, midstate, tail) = mk(2);
        let line = format!("{},{},3,2,cafebabe,deadbeef", hex::encode(midstate), hex::encode(tail));
        let parsed = parse_queue_result_line(&line, true).unwrap();
        assert_eq!(parsed.chip_index, Some(3));
        assert_eq!(parsed.nonces, vec![0xcafebabe, 0xdeadbeef]);
    }

    #[test]
    fn nonce_found_parses_multiple() {
        let nonces = parse_nonce_found("NONCE-FOUND:DEADBEEF,CAFEBABE").unwrap();
        assert_eq!(nonces, vec![0xDEADBEEF, 0xCAFEBABE]);
    }

    #[test]
    fn count_prefix() {
        assert_eq!(parse_count_prefix("COUNT:2"), Some(2));
        assert_eq!(parse_count_prefix("NO-NONCE"), None);
    }
}
