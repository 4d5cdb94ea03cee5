// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The one-job state machine (`spec.md` §4.4): `WORK`/`RANGE` over
//! `ZDX`/`ZPX`/`ZFX`, FPGA and older boards that have no queue.

use zerocopy::byteorder::U32;
use zerocopy::{byteorder, AsBytes, Unaligned};

use bitforce_protocol::error::{DriverError, Result};
use bitforce_protocol::framing::cmd_with_payload;
use bitforce_protocol::result_line::{parse_count_prefix, parse_nonce_found};
use bitforce_protocol::work::{NonceWindow, Work};
use bitforce_protocol::Transport;

use crate::clock::Clock;
use crate::timing::{AsyncTiming, BITFORCE_LONG_TIMEOUT_MS, WORK_CHECK_INTERVAL_MS};

/// Sentinel byte terminating every job payload, mirroring the bulk-queue
/// framing's `0xFE`/`0xAA` job terminators in §4.5.
const JOB_SENTINEL: u8 = 0xAA;

/// Wire layout of the `[base, base+nonces]` window appended to a `RANGE`
/// job payload: two big-endian 32-bit bounds, no padding.
#[derive(AsBytes, Unaligned)]
#[repr(C)]
struct RangeWindow {
    base: U32<byteorder::BigEndian>,
    end: U32<byteorder::BigEndian>,
}

const RANGE_FIFTHS: u32 = 5;

/// The advertised nonce-space size for each protocol, surfaced to the
/// host alongside results so it can pace share submission (`spec.md`
/// §4.4: "the nonce-count advertised to upstream").
pub const WORK_NONCE_SPACE: u32 = 0xffff_ffff;
pub const RANGE_NONCE_SPACE: u32 = 0x3333_3332;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Work,
    Range,
}

impl Protocol {
    fn cmd(self) -> &'static [u8; 3] {
        match self {
            Protocol::Work => b"ZDX",
            Protocol::Range => b"ZPX",
        }
    }

    pub fn advertised_nonce_space(self) -> u32 {
        match self {
            Protocol::Work => WORK_NONCE_SPACE,
            Protocol::Range => RANGE_NONCE_SPACE,
        }
    }
}

/// State the poll loop needs between `start_job` and the next `poll`.
#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Sending,
    Waiting { busy_observed: bool },
}

/// Outcome of `start_job`, mirroring the response table in `spec.md` §4.4.
#[derive(Debug)]
pub enum StartOutcome {
    /// Device acknowledged; caller should poll again after `sleep_ms`.
    Started,
    /// Empty or `"B"`: still busy, poll again after `WORK_CHECK_INTERVAL_MS`.
    Busy,
    /// A non-`OK` RANGE rejection: the driver already retried as WORK and
    /// the job was resent; treat like `Started`.
    DemotedAndRetried,
}

/// Outcome of `poll`.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    StillBusy,
    /// Nothing found, and nothing further to wait for.
    NoNonce,
    Found(Vec<u32>),
    /// The work went stale (host cancelled) before a result arrived.
    Abandoned,
    /// `BITFORCE_LONG_TIMEOUT` elapsed with no result: presumed overheat.
    Overheat,
}

/// The one-job driver for a single board/processor. Not `Send`-shared
/// directly; owned by the board-handler `Processor`'s minerloop thread,
/// which already serializes access via the device mutex (`spec.md` §5).
pub struct AsyncDriver {
    protocol: Protocol,
    allow_nonce_range: bool,
    nonce_window: Option<NonceWindow>,
    phase: Phase,
    work_start_ms: Option<u64>,
    /// A result line read one poll early that belongs to the *next* job
    /// (`spec.md` §4.4: "buffer it via already_have_results").
    already_have_results: Option<Vec<u32>>,
}

impl AsyncDriver {
    pub fn new(allow_nonce_range: bool) -> Self {
        Self {
            protocol: if allow_nonce_range {
                Protocol::Range
            } else {
                Protocol::Work
            },
            allow_nonce_range,
            nonce_window: None,
            phase: Phase::Sending,
            work_start_ms: None,
            already_have_results: None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Builds the outgoing payload for `work`, advancing the nonce window
    /// for RANGE jobs. Sizes aren't pinned to a literal byte count in this
    /// port; the wire shape (midstate, tail, optional range, sentinel) is
    /// what callers and tests rely on.
    fn job_prepare(&mut self, work: &Work) -> Vec<u8> {
        let mut buf = Vec::with_capacity(48);
        buf.extend_from_slice(&work.midstate);
        buf.extend_from_slice(&work.tail);
        if self.protocol == Protocol::Range {
            let mut window = self.nonce_window.unwrap_or_default();
            let nonces = u32::MAX / RANGE_FIFTHS;
            let (base, end) = window.issue(nonces);
            self.nonce_window = Some(window);
            let range = RangeWindow {
                base: U32::new(base),
                end: U32::new(end),
            };
            buf.extend_from_slice(range.as_bytes());
        }
        buf.push(JOB_SENTINEL);
        buf
    }

    /// `spec.md` §4.4 job start: issue `cmd_with_payload`, act on the
    /// response table. On a non-`OK` RANGE rejection, demotes to WORK and
    /// retries immediately in the same call (invariant: a single
    /// `start_job` call always leaves the device either busy or holding an
    /// accepted job).
    pub fn start_job(
        &mut self,
        t: &mut dyn Transport,
        work: &Work,
        clock: &dyn Clock,
        timing: &mut AsyncTiming,
    ) -> Result<StartOutcome> {
        let payload = self.job_prepare(work);
        let response = cmd_with_payload(t, 0, self.protocol.cmd(), &payload)?;
        let trimmed = response.trim();

        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("B") {
            self.phase = Phase::Waiting {
                busy_observed: true,
            };
            return Ok(StartOutcome::Busy);
        }

        if !trimmed.eq_ignore_ascii_case("OK") {
            if self.protocol == Protocol::Range {
                log::warn!("device rejected RANGE job ({trimmed}); demoting to WORK");
                self.protocol = Protocol::Work;
                self.nonce_window = None;
                timing.scale_for_range_switch(false);
                let retry_payload = self.job_prepare(work);
                let retry = cmd_with_payload(t, 0, self.protocol.cmd(), &retry_payload)?;
                if !retry.trim().eq_ignore_ascii_case("OK") {
                    return Err(DriverError::UnexpectedResponse(retry));
                }
                self.work_start_ms = Some(clock.now_ms());
                self.phase = Phase::Waiting {
                    busy_observed: false,
                };
                return Ok(StartOutcome::DemotedAndRetried);
            }
            return Err(DriverError::UnexpectedResponse(response));
        }

        self.work_start_ms = Some(clock.now_ms());
        self.phase = Phase::Waiting {
            busy_observed: false,
        };
        Ok(StartOutcome::Started)
    }

    /// `spec.md` §4.4 poll: `ZFX`, interpreting `COUNT:N`, `NONCE-FOUND:`,
    /// `NO-NONCE`, or `B`. `stale` signals the host has cancelled the
    /// current work (cancellation per §5).
    pub fn poll(
        &mut self,
        t: &mut dyn Transport,
        clock: &dyn Clock,
        timing: &mut AsyncTiming,
        stale: bool,
    ) -> Result<PollOutcome> {
        if let Some(nonces) = self.already_have_results.take() {
            return Ok(PollOutcome::Found(nonces));
        }

        let busy_observed = matches!(self.phase, Phase::Waiting { busy_observed: true });
        let started = self.work_start_ms.unwrap_or_else(|| clock.now_ms());
        let elapsed = clock.now_ms().saturating_sub(started);

        if elapsed > BITFORCE_LONG_TIMEOUT_MS {
            log::warn!("job exceeded BITFORCE_LONG_TIMEOUT; presuming overheat");
            return Ok(PollOutcome::Overheat);
        }

        let response = bitforce_protocol::framing::cmd_text(t, 0, b"ZFX")?;
        let trimmed = response.trim();

        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("B") {
            if stale {
                return Ok(PollOutcome::Abandoned);
            }
            self.phase = Phase::Waiting {
                busy_observed: true,
            };
            return Ok(PollOutcome::StillBusy);
        }

        if trimmed.eq_ignore_ascii_case("NO-NONCE") {
            self.finish_poll(clock, timing, elapsed, busy_observed, started);
            return Ok(PollOutcome::NoNonce);
        }

        if let Some(nonces) = parse_nonce_found(trimmed) {
            self.validate_and_maybe_demote(&nonces);
            self.finish_poll(clock, timing, elapsed, busy_observed, started);
            return Ok(PollOutcome::Found(nonces));
        }

        if let Some(n) = parse_count_prefix(trimmed) {
            // `spec.md` §4.4: a `COUNT:N` batch carries N result lines for
            // *this* job, but the device is already free-running the next
            // one; if it slips in an (N+1)'th line early, it belongs to the
            // next job and is buffered via `already_have_results` so the
            // next `job_start` short-circuits instead of re-issuing `ZDX`.
            let mut nonces = Vec::new();
            for _ in 0..n {
                let line = bitforce_protocol::framing::read_response_line(t)?;
                if let Some(mut found) = parse_nonce_found(line.trim()) {
                    nonces.append(&mut found);
                }
            }
            let trailing = bitforce_protocol::framing::read_response_line(t)?;
            if let Some(extra) = parse_nonce_found(trailing.trim()) {
                self.already_have_results = Some(extra);
            }
            self.validate_and_maybe_demote(&nonces);
            self.finish_poll(clock, timing, elapsed, busy_observed, started);
            return Ok(PollOutcome::Found(nonces));
        }

        Err(DriverError::UnexpectedResponse(response))
    }

    fn finish_poll(
        &mut self,
        clock: &dyn Clock,
        timing: &mut AsyncTiming,
        elapsed: u64,
        busy_observed: bool,
        started: u64,
    ) {
        if busy_observed {
            timing.on_busy_then_success(clock.now_ms().saturating_sub(started));
        } else {
            timing.on_first_poll_success(elapsed);
        }
        timing.update_avg_wait(elapsed);
        self.phase = Phase::Sending;
        self.work_start_ms = None;
    }

    /// Invariant (v): a returned nonce outside the last issued RANGE
    /// window permanently demotes the device to WORK.
    fn validate_and_maybe_demote(&mut self, nonces: &[u32]) {
        if self.protocol != Protocol::Range {
            return;
        }
        let Some(window) = self.nonce_window else {
            return;
        };
        if nonces.iter().any(|&n| !window.validate(n)) {
            log::warn!("nonce outside the last issued RANGE window; demoting to WORK permanently");
            self.protocol = Protocol::Work;
            self.nonce_window = None;
        }
    }

    pub fn next_poll_delay_ms(&self, timing: &AsyncTiming) -> u64 {
        match self.phase {
            Phase::Sending => 0,
            Phase::Waiting { busy_observed: true } => WORK_CHECK_INTERVAL_MS,
            Phase::Waiting { busy_observed: false } => timing.sleep_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitforce_protocol::mock::MockTransport;

    fn work() -> Work {
        Work::new([0u8; 32], [0xffu8; 12])
    }

    #[test]
    fn s3_one_job_work_reports_two_nonces_and_converges_sleep() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_line("OK")
            .push_line("OK")
            .push_line("NONCE-FOUND:DEADBEEF,CAFEBABE");

        let clock = crate::clock::FakeClock::new();
        let mut timing = AsyncTiming::new(700);
        let mut driver = AsyncDriver::new(false);

        let outcome = driver.start_job(&mut t, &work(), &clock, &mut timing).unwrap();
        assert!(matches!(outcome, StartOutcome::Started));

        clock.advance(700);
        let outcome = driver.poll(&mut t, &clock, &mut timing, false).unwrap();
        match outcome {
            PollOutcome::Found(nonces) => {
                assert_eq!(nonces, vec![0xDEADBEEF, 0xCAFEBABE]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(timing.sleep_ms <= 700);
    }

    #[test]
    fn s4_range_rejection_falls_back_to_work_and_scales_sleep() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_line("ERR:RANGE").push_line("OK").push_line("OK");

        let clock = crate::clock::FakeClock::new();
        let mut timing = AsyncTiming::new(100);
        let before = timing.sleep_ms;
        let mut driver = AsyncDriver::new(true);
        assert_eq!(driver.protocol(), Protocol::Range);

        let outcome = driver.start_job(&mut t, &work(), &clock, &mut timing).unwrap();
        assert!(matches!(outcome, StartOutcome::DemotedAndRetried));
        assert_eq!(driver.protocol(), Protocol::Work);
        assert_eq!(driver.protocol().advertised_nonce_space(), WORK_NONCE_SPACE);
        assert_eq!(timing.sleep_ms, before / 5);

        // writes[0] = "ZPX" (rejected), writes[1] = "ZDX" retry, writes[2] = payload
        assert_eq!(&t.writes[0][..3], b"ZPX");
        assert_eq!(&t.writes[1][..3], b"ZDX");
    }

    #[test]
    fn poll_still_busy_when_device_reports_b() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_line("OK").push_line("OK").push_line("B");

        let clock = crate::clock::FakeClock::new();
        let mut timing = AsyncTiming::new(500);
        let mut driver = AsyncDriver::new(false);
        driver.start_job(&mut t, &work(), &clock, &mut timing).unwrap();
        let outcome = driver.poll(&mut t, &clock, &mut timing, false).unwrap();
        assert_eq!(outcome, PollOutcome::StillBusy);
    }

    #[test]
    fn stale_work_is_abandoned_instead_of_rescheduled() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_line("OK").push_line("OK").push_line("");

        let clock = crate::clock::FakeClock::new();
        let mut timing = AsyncTiming::new(500);
        let mut driver = AsyncDriver::new(false);
        driver.start_job(&mut t, &work(), &clock, &mut timing).unwrap();
        let outcome = driver.poll(&mut t, &clock, &mut timing, true).unwrap();
        assert_eq!(outcome, PollOutcome::Abandoned);
    }

    #[test]
    fn overheat_declared_past_the_long_timeout() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_line("OK").push_line("OK");

        let clock = crate::clock::FakeClock::new();
        let mut timing = AsyncTiming::new(500);
        let mut driver = AsyncDriver::new(false);
        driver.start_job(&mut t, &work(), &clock, &mut timing).unwrap();
        clock.advance(BITFORCE_LONG_TIMEOUT_MS + 1);
        let outcome = driver.poll(&mut t, &clock, &mut timing, false).unwrap();
        assert_eq!(outcome, PollOutcome::Overheat);
    }

    #[test]
    fn nonce_outside_range_window_demotes_permanently() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_line("OK").push_line("OK").push_line("NONCE-FOUND:FFFFFFFF");

        let clock = crate::clock::FakeClock::new();
        let mut timing = AsyncTiming::new(100);
        let mut driver = AsyncDriver::new(true);
        driver.start_job(&mut t, &work(), &clock, &mut timing).unwrap();
        driver.poll(&mut t, &clock, &mut timing, false).unwrap();
        assert_eq!(driver.protocol(), Protocol::Work);
    }
}
