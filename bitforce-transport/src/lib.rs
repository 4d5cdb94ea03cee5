// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Concrete [`bitforce_protocol::Transport`] implementations: a
//! byte-at-a-time serial/VCOM variant and a framed memory-mapped PCI
//! variant. Both are drop-in `Box<dyn Transport>`s; nothing above this
//! crate needs to know which one is in use.

pub mod pci;
pub mod serial;

pub use pci::{MmapBars, PciBars, PciTransport};
pub use serial::SerialTransport;
