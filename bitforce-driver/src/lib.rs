// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Probe/enumeration, the two mining state machines, adaptive timing and
//! the device control surface (`spec.md` §4.3-§4.6).

pub mod async_driver;
pub mod clock;
pub mod control;
pub mod device;
pub mod probe;
pub mod queue_driver;
pub mod timing;

pub use async_driver::{AsyncDriver, PollOutcome, Protocol, StartOutcome};
pub use clock::{Clock, FakeClock, SystemClock};
pub use device::{Device, DeviceInner, DeviceStats, FanMode, Processor, TempVolts};
pub use probe::{probe, BoardInfo, ProbeResult};
pub use queue_driver::{build_queue_payload, QueueDriver, QueueResult};
