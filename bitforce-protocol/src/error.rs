// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy shared by transport, framing and both driver personalities.
//!
//! Mirrors the closed set of error kinds named in the driver's error design:
//! every comms fault, protocol demotion and thermal/queue anomaly the device
//! can report maps to exactly one variant here, so driver code never needs a
//! catch-all `Other(String)`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("transport is closed")]
    TransportClosed,

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(String),

    #[error("device reported busy")]
    DeviceBusy,

    #[error("device queue is full")]
    DeviceQueueFull,

    #[error("device does not support this protocol")]
    ProtocolUnsupported,

    #[error("thermal reading was garbled")]
    ThermalThrottle,

    #[error("device exceeded the long timeout and is presumed overheated")]
    Overheat,

    #[error("queue reconciliation found a mismatch")]
    SanityMismatch,

    #[error("command payload of {0} bytes exceeds the 255-byte XLINK length field")]
    InvalidArgument(usize),
}

pub type Result<T> = std::result::Result<T, DriverError>;
