// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-mapped PCI transport.
//!
//! Framing: a rolling one-byte tag lives in the high byte of a status word
//! at BAR2; the low 16 bits of that word are a payload length (clamped to
//! `MAX_FRAME`), the payload itself lives in BAR1, and outgoing payloads
//! are staged to BAR0 before the tag/length word is written back to BAR2
//! to kick the transfer off.
//!
//! The three BARs are accessed through [`PciBars`] rather than directly
//! through `memmap2`, so the framing/line-splitting logic can be unit
//! tested without a real device (see `FakeBars` in the test module).

use std::collections::VecDeque;
#[cfg(target_os = "linux")]
use std::fs::OpenOptions;

use bitfield::bitfield;

use bitforce_protocol::error::{DriverError, Result};
use bitforce_protocol::transport::Transport;

/// Largest payload block the device will ever report in one frame; a
/// reported length above this is clamped down rather than trusted.
pub const MAX_FRAME: usize = 0x1000;

bitfield! {
    /// Device -> host direction of the BAR2 status word: the rolling tag
    /// the device just staged a frame under, and that frame's length.
    pub struct StatusWord(u32);
    pub tag, _: 31, 24;
    pub len, _: 15, 0;
}

bitfield! {
    /// Host -> device direction of the BAR2 status word, written to kick
    /// off a transfer staged in BAR0.
    pub struct CommandWord(u32);
    pub tag, set_tag: 23, 16;
    pub len, set_len: 15, 0;
}

/// Raw access to the three BARs backing the framed protocol. `bar2` is a
/// single status/command word; `bar1` and `bar0` are `MAX_FRAME`-byte
/// payload windows.
pub trait PciBars: Send {
    fn read_bar2_status(&mut self) -> u32;
    fn write_bar2_cmd(&mut self, value: u32);
    fn read_bar1(&mut self, len: usize) -> Vec<u8>;
    fn write_bar0(&mut self, data: &[u8]);
}

/// `memmap2`-backed `PciBars` over the three `/sys/bus/pci/devices/.../resourceN`
/// files the kernel exposes for a PCI BAR.
pub struct MmapBars {
    bar0: memmap2::MmapMut,
    bar1: memmap2::MmapMut,
    bar2: memmap2::MmapMut,
}

impl MmapBars {
    /// Opens the three BARs under a PCI device's sysfs directory (e.g.
    /// `/sys/bus/pci/devices/0000:01:00.0`). Only the Linux sysfs layout is
    /// known, so other targets get a clear error instead of guessing a path
    /// convention that doesn't exist there.
    pub fn open(sysfs_device_dir: &str) -> Result<Self> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                Self::open_linux(sysfs_device_dir)
            } else {
                let _ = sysfs_device_dir;
                log::warn!("memory-mapped PCI transport is only supported on Linux");
                Err(DriverError::TransportClosed)
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn open_linux(sysfs_device_dir: &str) -> Result<Self> {
        let map = |n: u8| -> Result<memmap2::MmapMut> {
            let path = format!("{sysfs_device_dir}/resource{n}");
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| {
                    log::warn!("failed to open PCI resource {path}: {e}");
                    DriverError::TransportClosed
                })?;
            // Safety: the kernel resource file is a fixed-size MMIO window
            // for the lifetime of the open file descriptor.
            unsafe { memmap2::MmapMut::map_mut(&file) }.map_err(|e| {
                log::warn!("failed to mmap PCI resource {path}: {e}");
                DriverError::TransportClosed
            })
        };
        Ok(Self {
            bar0: map(0)?,
            bar1: map(1)?,
            bar2: map(2)?,
        })
    }
}

impl PciBars for MmapBars {
    fn read_bar2_status(&mut self) -> u32 {
        u32::from_le_bytes(self.bar2[2..6].try_into().unwrap())
    }

    fn write_bar2_cmd(&mut self, value: u32) {
        self.bar2[0..4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_bar1(&mut self, len: usize) -> Vec<u8> {
        self.bar1[..len.min(self.bar1.len())].to_vec()
    }

    fn write_bar0(&mut self, data: &[u8]) {
        let n = data.len().min(self.bar0.len());
        self.bar0[..n].copy_from_slice(&data[..n]);
    }
}

pub struct PciTransport<B: PciBars> {
    bars: B,
    open: bool,
    last_tag: u8,
    /// Lines already split out of a previously read block but not yet
    /// delivered to the caller.
    buffered_lines: VecDeque<Vec<u8>>,
}

impl<B: PciBars> PciTransport<B> {
    pub fn new(bars: B) -> Self {
        Self {
            bars,
            open: false,
            last_tag: 0,
            buffered_lines: VecDeque::new(),
        }
    }

    fn next_tag(&mut self) -> u8 {
        // Skip zero: a zero tag is indistinguishable from "no frame sent
        // yet" in the status word's high byte.
        self.last_tag = self.last_tag.wrapping_add(1);
        if self.last_tag == 0 {
            self.last_tag = 1;
        }
        self.last_tag
    }

    fn pull_frame(&mut self) -> Result<()> {
        let status = StatusWord(self.bars.read_bar2_status());
        let tag = status.tag() as u8;
        if tag != self.last_tag {
            return Ok(());
        }
        let len = (status.len() as usize).min(MAX_FRAME);
        let block = self.bars.read_bar1(len);
        for line in block.split(|&b| b == b'\n') {
            if !line.is_empty() {
                self.buffered_lines.push_back(line.to_vec());
            }
        }
        Ok(())
    }
}

impl<B: PciBars> Transport for PciTransport<B> {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.buffered_lines.clear();
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_line(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(DriverError::TransportClosed);
        }
        if self.buffered_lines.is_empty() {
            self.pull_frame()?;
        }
        match self.buffered_lines.pop_front() {
            Some(line) => {
                let n = line.len().min(buf.len());
                buf[..n].copy_from_slice(&line[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(DriverError::TransportClosed);
        }
        if data.len() > MAX_FRAME {
            log::warn!("PCI write of {} bytes exceeds MAX_FRAME", data.len());
            return Ok(0);
        }
        self.bars.write_bar0(data);
        let tag = self.next_tag();
        let mut cmd = CommandWord(0);
        cmd.set_tag(tag as u32);
        cmd.set_len(data.len() as u32);
        self.bars.write_bar2_cmd(cmd.0);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBars {
        status: u32,
        bar1: Vec<u8>,
        last_bar0_write: Vec<u8>,
        last_cmd: u32,
    }

    impl FakeBars {
        fn new() -> Self {
            Self {
                status: 0,
                bar1: Vec::new(),
                last_bar0_write: Vec::new(),
                last_cmd: 0,
            }
        }

        /// Simulates the device having staged a frame tagged `tag`
        /// containing `payload` in BAR1.
        fn stage_frame(&mut self, tag: u8, payload: &[u8]) {
            self.bar1 = payload.to_vec();
            self.status = ((tag as u32) << 24) | (payload.len() as u32);
        }
    }

    impl PciBars for FakeBars {
        fn read_bar2_status(&mut self) -> u32 {
            self.status
        }
        fn write_bar2_cmd(&mut self, value: u32) {
            self.last_cmd = value;
        }
        fn read_bar1(&mut self, len: usize) -> Vec<u8> {
            self.bar1[..len.min(self.bar1.len())].to_vec()
        }
        fn write_bar0(&mut self, data: &[u8]) {
            self.last_bar0_write = data.to_vec();
        }
    }

    #[test]
    fn write_all_stages_payload_and_increments_tag_skipping_zero() {
        let mut t = PciTransport::new(FakeBars::new());
        t.open().unwrap();
        t.last_tag = 0xff;
        let n = t.write_all(b"ZGX").unwrap();
        assert_eq!(n, 3);
        assert_eq!(t.bars.last_bar0_write, b"ZGX".to_vec());
        // 0xff + 1 wraps to 0, which is skipped.
        assert_eq!(t.last_tag, 1);
        assert_eq!(t.bars.last_cmd, (1u32 << 16) | 3);
    }

    #[test]
    fn read_line_waits_for_matching_tag_then_splits_on_newline() {
        let mut t = PciTransport::new(FakeBars::new());
        t.open().unwrap();
        t.last_tag = 4;
        t.bars.stage_frame(3, b"garbage"); // stale tag, ignored
        let mut buf = [0u8; 64];
        assert_eq!(t.read_line(&mut buf).unwrap(), 0);

        t.bars.stage_frame(4, b"OK\nNO-NONCE\n");
        let n = t.read_line(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"OK");
        let n = t.read_line(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"NO-NONCE");
    }

    #[test]
    fn read_line_clamps_oversized_length_field() {
        let mut t = PciTransport::new(FakeBars::new());
        t.open().unwrap();
        t.last_tag = 1;
        // Claim a length far beyond MAX_FRAME; BAR1 itself is short, so
        // the clamp is exercised through `len.min(self.bar1.len())` in
        // `read_bar1`, matching the spec's "clamped to 0x1000" rule at
        // the transport boundary.
        t.bars.status = (1u32 << 24) | 0xFFFF;
        t.bars.bar1 = b"OK\n".to_vec();
        let mut buf = [0u8; 64];
        let n = t.read_line(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"OK");
    }
}
