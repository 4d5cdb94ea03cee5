// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory [`Transport`] used by `bitforce-driver`'s unit tests
//! (and by anything scripting scenarios without real hardware). Plays the
//! same role the teacher's `Ecp5Impl` trait plays for the FPGA core: a
//! narrow seam the rest of the driver is written against, so tests never
//! need real hardware.

use std::collections::VecDeque;

use crate::error::{DriverError, Result};
use crate::transport::Transport;

/// One scripted reply to a `read_line` call.
#[derive(Clone, Debug)]
pub enum ScriptedReply {
    Line(String),
    /// A timeout: `read_line` returns an empty line.
    Timeout,
}

pub struct MockTransport {
    open: bool,
    /// Every byte buffer passed to `write_all`, in order.
    pub writes: Vec<Vec<u8>>,
    replies: VecDeque<ScriptedReply>,
    /// When set, the next `open`/`write_all` call fails instead of
    /// succeeding, simulating a hardware fault.
    pub fail_next_write: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            open: false,
            writes: Vec::new(),
            replies: VecDeque::new(),
            fail_next_write: false,
        }
    }

    /// Queues a line to be returned by a future `read_line` call.
    pub fn push_line(&mut self, line: impl Into<String>) -> &mut Self {
        self.replies.push_back(ScriptedReply::Line(line.into()));
        self
    }

    pub fn push_timeout(&mut self) -> &mut Self {
        self.replies.push_back(ScriptedReply::Timeout);
        self
    }

    pub fn last_write(&self) -> Option<&[u8]> {
        self.writes.last().map(|v| v.as_slice())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_line(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(DriverError::TransportClosed);
        }
        match self.replies.pop_front() {
            Some(ScriptedReply::Line(line)) => {
                let bytes = line.as_bytes();
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Some(ScriptedReply::Timeout) | None => Ok(0),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(DriverError::TransportClosed);
        }
        if self.fail_next_write {
            self.fail_next_write = false;
            return Ok(0);
        }
        self.writes.push(data.to_vec());
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_replies_are_returned_in_order() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_line("OK").push_line("NO-NONCE");
        let mut buf = [0u8; 64];
        let n = t.read_line(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"OK");
        let n = t.read_line(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"NO-NONCE");
    }

    #[test]
    fn closed_transport_refuses_io() {
        let mut t = MockTransport::new();
        let mut buf = [0u8; 8];
        assert!(matches!(
            t.read_line(&mut buf),
            Err(DriverError::TransportClosed)
        ));
    }
}
