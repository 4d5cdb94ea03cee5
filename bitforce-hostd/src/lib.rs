// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Owns probed devices and exposes the host-facing interface named in
//! `spec.md` §6. The top-level mining host (work generation, share
//! submission, hashmeter aggregation) is an external collaborator reached
//! only through [`WorkSource`]; this crate runs the two cooperative worker
//! loops per board described in §5 (`minerloop`, `statsloop`) and nothing
//! above that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use bitforce_driver::async_driver::{AsyncDriver, PollOutcome, StartOutcome};
use bitforce_driver::control;
use bitforce_driver::device::{Device, DeviceInner, DeviceStats, FanMode};
use bitforce_driver::probe::{self, ProbeResult};
use bitforce_driver::queue_driver::{QueueDriver, QueueResult};
use bitforce_driver::{Clock, SystemClock};
use bitforce_protocol::error::Result;
use bitforce_protocol::work::{Work, WorkId};
use bitforce_protocol::{Style, Transport};

const STATS_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_WORK_CHECK_MS: u64 = 500;

/// Supplies work and absorbs results; implemented by the collaborator
/// host (`spec.md` §1's "OUT OF SCOPE: external collaborators").
pub trait WorkSource: Send + Sync {
    fn next_work(&self) -> Option<Work>;
    fn submit_nonces(&self, id: Option<WorkId>, nonces: &[u32]);
}

enum Personality {
    Async(AsyncDriver),
    Queue(QueueDriver),
}

/// One physical board-group: the probed [`Device`] plus whichever driver
/// personality probe selected (`spec.md` §4.4/§4.5).
pub struct MiningBoard {
    pub device: Arc<Device>,
    personality: Mutex<Personality>,
    clock: Arc<dyn Clock>,
    identity: String,
}

impl MiningBoard {
    /// Runs probe against an already-constructed transport and builds the
    /// board, selecting `AsyncDriver` or `QueueDriver` from the style
    /// negotiated at probe time.
    pub fn probe_and_build(mut transport: Box<dyn Transport>, allow_nonce_range: bool) -> Result<Self> {
        let result = probe::probe(transport.as_mut())?;
        Self::from_probe_result(transport, result, allow_nonce_range)
    }

    fn from_probe_result(
        transport: Box<dyn Transport>,
        result: ProbeResult,
        allow_nonce_range: bool,
    ) -> Result<Self> {
        let personality = if result.style.is_queued() {
            let parallel = result.boards.first().map(|b| b.parallel()).unwrap_or(1);
            Personality::Queue(QueueDriver::new(
                result.style,
                result.capabilities.parallel_protocol,
                parallel,
            ))
        } else {
            Personality::Async(AsyncDriver::new(allow_nonce_range))
        };

        let inner = DeviceInner::new(
            transport,
            result.style,
            result.identity.clone(),
            result.capabilities,
            DEFAULT_WORK_CHECK_MS,
        );
        let device = Device::new(inner);

        Ok(Self {
            device,
            personality: Mutex::new(personality),
            clock: Arc::new(SystemClock::new()),
            identity: result.identity,
        })
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.device.stats
    }

    pub fn style(&self) -> Style {
        self.device.inner.lock().unwrap().style
    }

    pub fn is_queued(&self) -> bool {
        matches!(&*self.personality.lock().unwrap(), Personality::Queue(_))
    }

    // --- control surface, §4.6, serialised against the device mutex ---

    pub fn identify(&self) -> Result<()> {
        let mut inner = self.device.inner.lock().unwrap();
        control::identify(inner.transport.as_mut())
    }

    pub fn refresh_temp_volts(&self) -> Result<()> {
        let tv = {
            let mut inner = self.device.inner.lock().unwrap();
            control::read_temp_volts(inner.transport.as_mut())
        };
        match tv {
            Ok(tv) => {
                self.device.stats.set_temp_volts(tv);
                Ok(())
            }
            Err(e) => {
                self.device.stats.record_hardware_error();
                Err(e)
            }
        }
    }

    pub fn set_fan_mode(&self, mode: FanMode) -> Result<()> {
        let mut inner = self.device.inner.lock().unwrap();
        let applied = control::set_fan_mode(inner.transport.as_mut(), mode)?;
        inner.fan_mode = applied;
        Ok(())
    }

    /// Full driver reset. Idempotent (`spec.md` §5).
    pub fn reinit(&self) -> Result<()> {
        let mut inner = self.device.inner.lock().unwrap();
        control::reinit(inner.transport.as_mut(), &self.identity)?;
        inner.async_timing = bitforce_driver::timing::AsyncTiming::new(DEFAULT_WORK_CHECK_MS);
        inner.queue_timing = bitforce_driver::timing::QueueTiming::new(100);
        drop(inner);
        let mut p = self.personality.lock().unwrap();
        if let Personality::Queue(q) = &mut *p {
            q.disable();
            q.enable();
        }
        Ok(())
    }

    // --- async driver surface, §6 ---

    pub fn prepare_and_start(&self, work: &Work) -> Result<StartOutcome> {
        let mut inner = self.device.inner.lock().unwrap();
        let mut p = self.personality.lock().unwrap();
        let Personality::Async(driver) = &mut *p else {
            return Err(bitforce_protocol::error::DriverError::ProtocolUnsupported);
        };
        let inner = &mut *inner;
        let outcome = driver.start_job(inner.transport.as_mut(), work, self.clock.as_ref(), &mut inner.async_timing)?;
        self.device.stats.set_sleep_ms(inner.async_timing.sleep_ms);
        Ok(outcome)
    }

    pub fn poll_job(&self, stale: bool) -> Result<PollOutcome> {
        let mut inner = self.device.inner.lock().unwrap();
        let mut p = self.personality.lock().unwrap();
        let Personality::Async(driver) = &mut *p else {
            return Err(bitforce_protocol::error::DriverError::ProtocolUnsupported);
        };
        let inner = &mut *inner;
        let outcome = driver.poll(inner.transport.as_mut(), self.clock.as_ref(), &mut inner.async_timing, stale)?;
        self.device.stats.set_sleep_ms(inner.async_timing.sleep_ms);
        self.device.stats.set_avg_wait(inner.async_timing.avg_wait);
        Ok(outcome)
    }

    // --- queue driver surface, §6 ---

    pub fn append(&self, work: Work) -> Option<WorkId> {
        let mut p = self.personality.lock().unwrap();
        match &mut *p {
            Personality::Queue(q) => q.append(work),
            Personality::Async(_) => None,
        }
    }

    pub fn send_queue(&self) -> Result<()> {
        let mut inner = self.device.inner.lock().unwrap();
        let mut p = self.personality.lock().unwrap();
        match &mut *p {
            Personality::Queue(q) => q.send(inner.transport.as_mut()),
            Personality::Async(_) => Ok(()),
        }
    }

    pub fn poll_queue(&self) -> Result<Vec<QueueResult>> {
        let mut inner = self.device.inner.lock().unwrap();
        let mut p = self.personality.lock().unwrap();
        match &mut *p {
            Personality::Queue(q) => {
                let results = q.poll(inner.transport.as_mut())?;
                self.device.stats.set_sleep_ms(q.timing.sleep_ms);
                for _ in 0..q.take_out_of_range_chip_indices() {
                    self.device.stats.record_hardware_error();
                }
                Ok(results)
            }
            Personality::Async(_) => Ok(Vec::new()),
        }
    }

    pub fn flush_queue(&self) -> Result<()> {
        let mut inner = self.device.inner.lock().unwrap();
        let mut p = self.personality.lock().unwrap();
        match &mut *p {
            Personality::Queue(q) => q.flush(inner.transport.as_mut()),
            Personality::Async(_) => Ok(()),
        }
    }

    pub fn disable(&self) {
        let mut p = self.personality.lock().unwrap();
        if let Personality::Queue(q) = &mut *p {
            q.disable();
        }
    }
}

/// Runs the minerloop for one board until `stop` is set (`spec.md` §5).
/// Dispatches to the queue or one-job protocol depending on what probe
/// selected.
pub fn spawn_minerloop(board: Arc<MiningBoard>, source: Arc<dyn WorkSource>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            if board.is_queued() {
                run_queue_tick(&board, source.as_ref());
            } else {
                run_async_tick(&board, source.as_ref());
            }
        }
    })
}

fn run_async_tick(board: &MiningBoard, source: &dyn WorkSource) {
    match board.poll_job(false) {
        Ok(PollOutcome::Found(nonces)) => {
            source.submit_nonces(None, &nonces);
            if let Some(work) = source.next_work() {
                let _ = board.prepare_and_start(&work);
            }
        }
        Ok(PollOutcome::NoNonce) => {
            if let Some(work) = source.next_work() {
                let _ = board.prepare_and_start(&work);
            }
        }
        Ok(PollOutcome::StillBusy) => {
            thread::sleep(Duration::from_millis(10));
        }
        Ok(PollOutcome::Overheat) | Ok(PollOutcome::Abandoned) => {
            if let Some(work) = source.next_work() {
                let _ = board.prepare_and_start(&work);
            }
        }
        Err(_) => {
            board.device.stats.record_hardware_error();
            thread::sleep(Duration::from_secs(1));
        }
    }
}

fn run_queue_tick(board: &MiningBoard, source: &dyn WorkSource) {
    while let Some(work) = source.next_work() {
        if board.append(work).is_none() {
            break;
        }
    }
    if board.send_queue().is_err() {
        board.device.stats.record_hardware_error();
        thread::sleep(Duration::from_secs(1));
        return;
    }
    match board.poll_queue() {
        Ok(results) => {
            for r in results {
                source.submit_nonces(Some(r.id), &r.nonces);
            }
        }
        Err(_) => board.device.stats.record_hardware_error(),
    }
    let delay = board.device.stats.sleep_ms().max(10);
    thread::sleep(Duration::from_millis(delay));
}

/// Periodically refreshes temperature/voltage stats (`spec.md` §5's
/// "periodic stats poller"). Non-critical: skips a cycle rather than
/// blocking if the device mutex is contended.
pub fn spawn_statsloop(board: Arc<MiningBoard>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let _ = board.refresh_temp_volts();
            thread::sleep(STATS_POLL_INTERVAL);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitforce_protocol::mock::MockTransport;

    fn probe_and_build(lines: &[&str]) -> MiningBoard {
        let mut t = MockTransport::new();
        for l in lines {
            t.push_line(*l);
        }
        MiningBoard::probe_and_build(Box::new(t), false).unwrap()
    }

    #[test]
    fn probing_an_fpga_board_selects_the_async_driver() {
        let board = probe_and_build(&[">>>ID: BFL SHA256>>>", "DEVICES IN CHAIN: 1", "OK"]);
        assert!(!board.is_queued());
        assert_eq!(board.style(), Style::Fpga);
    }

    #[test]
    fn probing_a_28nm_board_selects_the_queue_driver() {
        let board = probe_and_build(&[">>>ID: some-device>>>", "ASIC CHANNELS:16", "OK"]);
        assert!(board.is_queued());
        assert_eq!(board.style(), Style::A28);
    }
}
