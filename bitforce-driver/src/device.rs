// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The shared device model (`spec.md` §3): one physical board-group behind
//! a transport, the mutex discipline of §5, and the read-lock-free stats
//! snapshot from §4.7.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitforce_protocol::{Capabilities, Style, Transport};

use crate::timing::{AsyncTiming, QueueTiming};

/// Fan speed, last value successfully applied by a `Z{0..5,9}X` command
/// (§4.6's supplement so re-init can restore it).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FanMode {
    Auto,
    Manual(u8),
}

impl Default for FanMode {
    fn default() -> Self {
        FanMode::Auto
    }
}

/// Temperature/voltage readings, grouped because they're always updated
/// together and read together by the stats surface.
#[derive(Clone, Copy, Debug, Default)]
pub struct TempVolts {
    pub temps: [Option<f32>; 2],
    pub millivolts: [u32; 8],
    pub millivolts_len: usize,
}

impl TempVolts {
    pub fn voltages(&self) -> &[u32] {
        &self.millivolts[..self.millivolts_len]
    }

    pub fn set_millivolts(&mut self, values: &[u32]) {
        let n = values.len().min(self.millivolts.len());
        self.millivolts[..n].copy_from_slice(&values[..n]);
        self.millivolts_len = n;
    }
}

/// Read-lock-free snapshot handed to the stats/RPC surface (`spec.md` §6,
/// §5's "one deliberate exception"). Never requires the device mutex.
pub struct DeviceStats {
    sleep_ms: AtomicU64,
    hardware_errors: AtomicU32,
    temp_volts: Mutex<TempVolts>,
    avg_wait_millis: AtomicU64,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self {
            sleep_ms: AtomicU64::new(0),
            hardware_errors: AtomicU32::new(0),
            temp_volts: Mutex::new(TempVolts::default()),
            avg_wait_millis: AtomicU64::new(0),
        }
    }

    pub fn set_sleep_ms(&self, ms: u64) {
        self.sleep_ms.store(ms, Ordering::Relaxed);
    }

    pub fn sleep_ms(&self) -> u64 {
        self.sleep_ms.load(Ordering::Relaxed)
    }

    /// `avg_wait` only applies to the one-job driver; stored as
    /// milliseconds×1000 to keep the field lock-free without a float atomic.
    pub fn set_avg_wait(&self, avg_wait_ms: f64) {
        self.avg_wait_millis
            .store((avg_wait_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn avg_wait_ms(&self) -> f64 {
        self.avg_wait_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn record_hardware_error(&self) {
        self.hardware_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hardware_errors(&self) -> u32 {
        self.hardware_errors.load(Ordering::Relaxed)
    }

    pub fn set_temp_volts(&self, tv: TempVolts) {
        *self.temp_volts.lock().unwrap() = tv;
    }

    pub fn temp_volts(&self) -> TempVolts {
        *self.temp_volts.lock().unwrap()
    }
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything mutated under the device mutex. Owned exclusively by the
/// board-handler `Processor`; invariant (iv) of `spec.md` §3 forbids any
/// other processor view from touching this state.
pub struct DeviceInner {
    pub transport: Box<dyn Transport>,
    pub style: Style,
    pub identity: String,
    pub capabilities: Capabilities,
    pub fan_mode: FanMode,
    pub async_timing: AsyncTiming,
    pub queue_timing: QueueTiming,
}

impl DeviceInner {
    pub fn new(
        transport: Box<dyn Transport>,
        style: Style,
        identity: String,
        capabilities: Capabilities,
        sleep_ms_default: u64,
    ) -> Self {
        Self {
            transport,
            style,
            identity,
            capabilities,
            fan_mode: FanMode::default(),
            async_timing: AsyncTiming::new(sleep_ms_default),
            queue_timing: QueueTiming::new(100),
        }
    }
}

/// One physical board-group: the device mutex plus the lock-free stats
/// snapshot that sits beside it (`spec.md` §3, §5).
pub struct Device {
    pub inner: Mutex<DeviceInner>,
    pub stats: DeviceStats,
}

impl Device {
    pub fn new(inner: DeviceInner) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(inner),
            stats: DeviceStats::new(),
        })
    }
}

/// A logical compute unit on a `Device` (`spec.md` §3). Processors beyond
/// the first ("board handler") never drive transport or queue mutation
/// (invariant (iv)): they only mirror results and temperature for their
/// chip index.
pub struct Processor {
    pub device: Arc<Device>,
    pub chip_index: u8,
    pub is_board_handler: bool,
}

impl Processor {
    pub fn board_handler(device: Arc<Device>) -> Self {
        Self {
            device,
            chip_index: 0,
            is_board_handler: true,
        }
    }

    pub fn view(device: Arc<Device>, chip_index: u8) -> Self {
        Self {
            device,
            chip_index,
            is_board_handler: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_are_readable_without_the_device_mutex() {
        let stats = DeviceStats::new();
        stats.set_sleep_ms(123);
        stats.record_hardware_error();
        stats.record_hardware_error();
        assert_eq!(stats.sleep_ms(), 123);
        assert_eq!(stats.hardware_errors(), 2);
    }

    #[test]
    fn temp_volts_tracks_up_to_two_temps_and_a_voltage_vector() {
        let mut tv = TempVolts::default();
        tv.temps = [Some(45.5), None];
        tv.set_millivolts(&[1200, 1250, 1300]);
        assert_eq!(tv.voltages(), &[1200, 1250, 1300]);
    }

    #[test]
    fn non_board_handler_processor_is_marked_as_a_view() {
        let inner = DeviceInner::new(
            Box::new(bitforce_protocol::mock::MockTransport::new()),
            Style::A28,
            "test".into(),
            Capabilities::default(),
            100,
        );
        let device = Device::new(inner);
        let handler = Processor::board_handler(device.clone());
        let view = Processor::view(device, 3);
        assert!(handler.is_board_handler);
        assert!(!view.is_board_handler);
        assert_eq!(view.chip_index, 3);
    }
}
