// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The capability set every physical transport implements.
//!
//! Kept as a narrow trait rather than a class hierarchy: `Serial` and `Pci`
//! variants each implement `Transport` directly, and everything above this
//! layer is written against `&mut dyn Transport` so it can be exercised over
//! an in-memory fake (see [`crate::mock`]).

use crate::error::{DriverError, Result};

pub trait Transport: Send {
    /// Opens the underlying device. Returns `Ok(())` on success; the caller
    /// must not call `read_line`/`write_all` before `open` succeeds.
    fn open(&mut self) -> Result<()>;

    /// Closes the underlying device. Idempotent.
    fn close(&mut self);

    /// True once `open` has succeeded and `close` has not since been called.
    fn is_open(&self) -> bool;

    /// Reads one newline-terminated line into `buf`, not including the
    /// newline. Returns the number of bytes written. A timeout or closed
    /// transport yields `Ok(0)` (an empty line), matching the C
    /// implementation's "leave buf[0]='\0'" contract instead of erroring,
    /// since an empty line is itself meaningful protocol state (busy/no
    /// response) rather than a fault.
    fn read_line(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes `data` in full. Returns `Ok(data.len())` on success; any
    /// short or failed write is reported as `Ok(0)` for the same reason
    /// `read_line` reports a timeout as an empty line — the caller
    /// distinguishes "nothing happened" from "the transport is broken"
    /// via `is_open`/explicit reopen, not via the return value here.
    fn write_all(&mut self, data: &[u8]) -> Result<usize>;
}

/// Guard used by every caller of `read_line`/`write_all` to enforce
/// invariant (i) from the data model: no I/O is attempted while closed.
pub fn require_open(t: &dyn Transport) -> Result<()> {
    if t.is_open() {
        Ok(())
    } else {
        Err(DriverError::TransportClosed)
    }
}
