// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire framing, the shared data model and the error taxonomy used by
//! every BitForce transport and driver personality.
//!
//! This crate has no opinion on *how* bytes reach the device ([`Transport`]
//! is implemented elsewhere, in `bitforce-transport`) or on *which*
//! driver personality is in use (`bitforce-driver`); it only defines the
//! shapes both agree on.

pub mod error;
pub mod framing;
pub mod result_line;
pub mod style;
pub mod transport;
pub mod work;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use error::{DriverError, Result};
pub use style::{Capabilities, Style};
pub use transport::Transport;
pub use work::{NonceWindow, Work, WorkId};
