// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/response framing: the 3-byte command primitives and XLINK
//! addressing from `spec.md` §4.2.

use crate::error::{DriverError, Result};
use crate::transport::{require_open, Transport};
use crate::work::hex;

/// Longest line we'll ever read back. Config dumps are the longest
/// legitimate response; this is generous headroom above any observed
/// reply.
const MAX_LINE: usize = 4096;

/// Wraps `payload` in the XLINK envelope `'@', len, proc_id` when
/// `proc_id != 0`. Returns the unwrapped payload unchanged for `proc_id
/// == 0` (the board's own command channel needs no addressing).
pub fn wrap_xlink(proc_id: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if proc_id == 0 {
        return Ok(payload.to_vec());
    }
    if payload.len() > u8::MAX as usize {
        return Err(DriverError::InvalidArgument(payload.len()));
    }
    let mut buf = Vec::with_capacity(payload.len() + 3);
    buf.push(b'@');
    buf.push(payload.len() as u8);
    buf.push(proc_id);
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn send(t: &mut dyn Transport, proc_id: u8, data: &[u8]) -> Result<()> {
    require_open(t)?;
    let wrapped = wrap_xlink(proc_id, data)?;
    let n = t.write_all(&wrapped)?;
    if n != wrapped.len() {
        return Err(DriverError::UnexpectedResponse(
            "short write on command channel".into(),
        ));
    }
    Ok(())
}

fn read_line(t: &mut dyn Transport) -> Result<String> {
    require_open(t)?;
    let mut buf = [0u8; MAX_LINE];
    let n = t.read_line(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf[..n])
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

/// Reads one response line without sending anything first. Used by
/// multi-line exchanges such as the `ZCX` config dump, where only the
/// first line is a true request/response pair.
pub fn read_response_line(t: &mut dyn Transport) -> Result<String> {
    read_line(t)
}

/// Sends a 3-byte command and reads one response line.
pub fn cmd_text(t: &mut dyn Transport, proc_id: u8, cmd: &[u8; 3]) -> Result<String> {
    send(t, proc_id, cmd)?;
    read_line(t)
}

/// Sends a raw byte buffer (logged as hex, unlike `cmd_text`'s ASCII
/// command) and reads one response line.
pub fn cmd_bin(t: &mut dyn Transport, proc_id: u8, raw: &[u8]) -> Result<String> {
    log::trace!("cmd_bin -> {}", hex::encode(raw));
    send(t, proc_id, raw)?;
    read_line(t)
}

/// Sends `cmd`, reads a line; if that line begins with "OK" (case
/// insensitive) sends `payload` and reads a second line, otherwise
/// returns the first line untouched.
pub fn cmd_with_payload(
    t: &mut dyn Transport,
    proc_id: u8,
    cmd: &[u8; 3],
    payload: &[u8],
) -> Result<String> {
    let first = cmd_text(t, proc_id, cmd)?;
    if is_ok_prefix(&first) {
        send(t, proc_id, payload)?;
        read_line(t)
    } else {
        Ok(first)
    }
}

fn is_ok_prefix(line: &str) -> bool {
    line.len() >= 2 && line.as_bytes()[..2].eq_ignore_ascii_case(b"OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xlink_wrap_roundtrips_through_a_stripping_peer() {
        let direct = b"ZGX".to_vec();
        let wrapped = wrap_xlink(7, &direct).unwrap();
        assert_eq!(wrapped[0], b'@');
        assert_eq!(wrapped[1], 3);
        assert_eq!(wrapped[2], 7);
        assert_eq!(&wrapped[3..], &direct[..]);
    }

    #[test]
    fn xlink_wrap_is_noop_for_proc_zero() {
        assert_eq!(wrap_xlink(0, b"ZGX").unwrap(), b"ZGX".to_vec());
    }

    #[test]
    fn xlink_wrap_rejects_oversized_payload() {
        let payload = vec![0u8; 256];
        assert!(matches!(
            wrap_xlink(1, &payload),
            Err(DriverError::InvalidArgument(256))
        ));
    }

    #[test]
    fn ok_prefix_is_case_insensitive() {
        assert!(is_ok_prefix("OK:QUEUED 3"));
        assert!(is_ok_prefix("ok"));
        assert!(!is_ok_prefix("ERR:QUEUE"));
        assert!(!is_ok_prefix("O"));
    }
}
