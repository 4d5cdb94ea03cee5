// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bulk-queue state machine (`spec.md` §4.5): `BQUEUE`/`PQUEUE` over
//! `ZWX`/`ZNX`/`WX`, `ZOX`, `ZQX`/`ZqX`, for 65 nm and 28 nm ASIC boards.

use std::collections::VecDeque;

use bitforce_protocol::error::Result;
use bitforce_protocol::framing::{cmd_bin, cmd_text, cmd_with_payload, read_response_line};
use bitforce_protocol::result_line::{parse_count_prefix, parse_queue_result_line};
use bitforce_protocol::work::{hex, Work, WorkId, MIDSTATE_LEN, TAIL_LEN};
use bitforce_protocol::{Style, Transport};

use crate::timing::{QueueTiming, BITFORCE_MAX_QRESULTS};

const JOB_TERMINATOR: u8 = 0xFE;
const JOB_SENTINEL: u8 = 0xAA;
const A28_HEADER: u8 = 0xC1;

struct QueueEntry {
    id: WorkId,
    work: Work,
}

/// A matched result, ready to submit upstream.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueResult {
    pub id: WorkId,
    pub chip_index: Option<u8>,
    pub nonces: Vec<u32>,
}

/// Pure function of `(style, works)`: builds the multi-job wire payload,
/// constructed back-to-front for natural length prefixing (`spec.md`
/// §4.5). Property 8: equal inputs yield equal bytes.
pub fn build_queue_payload(style: Style, works: &[Work]) -> Vec<u8> {
    let mut jobs = Vec::with_capacity(works.len() * (MIDSTATE_LEN + TAIL_LEN + 1));
    for w in works {
        jobs.extend_from_slice(&w.midstate);
        jobs.extend_from_slice(&w.tail);
        jobs.push(JOB_SENTINEL);
    }
    jobs.push(JOB_TERMINATOR);

    let count = works.len() as u8;
    match style {
        Style::A28 => {
            let mut body = vec![A28_HEADER, count];
            body.extend_from_slice(&jobs);
            let len = body.len() as u16;
            let mut buf = Vec::with_capacity(body.len() + 4);
            buf.push(b'W');
            buf.push(b'X');
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&body);
            buf
        }
        Style::A65 | Style::Fpga => {
            let mut body = vec![A28_HEADER, count];
            body.extend_from_slice(&jobs);
            let mut buf = Vec::with_capacity(body.len() + 1);
            buf.push(body.len() as u8);
            buf.extend_from_slice(&body);
            buf
        }
    }
}

/// `ZNX` fallback payload: the A65 framing with the leading 3-byte header
/// (length + `0xC1,count`) stripped, per `spec.md` §4.5.
fn strip_a65_header(payload: &[u8]) -> &[u8] {
    payload.get(3..).unwrap_or(&[])
}

pub struct QueueDriver {
    style: Style,
    parallel: bool,
    missing_zwx: bool,
    max_queue_at_once: u32,
    queued_max: u32,
    /// Processor count this board was planned with; a chip index at or
    /// beyond this is out of range (`spec.md` §9) and gets clamped to 0.
    processor_count: u32,
    /// Out-of-range chip indices clamped since the last drain, surfaced
    /// to the caller so it can tick `DeviceStats::hardware_errors` (§9).
    out_of_range_chip_indices: u32,
    fifo: VecDeque<QueueEntry>,
    ready_to_queue: u32,
    queued: u32,
    next_id: u64,
    just_flushed: bool,
    queue_full: bool,
    pub timing: QueueTiming,
}

impl QueueDriver {
    pub fn new(style: Style, parallel: bool, parallel_factor: u32) -> Self {
        Self {
            style,
            parallel,
            missing_zwx: false,
            max_queue_at_once: style.max_queue_at_once(),
            queued_max: style.queued_max(parallel_factor),
            processor_count: parallel_factor.max(1),
            out_of_range_chip_indices: 0,
            fifo: VecDeque::new(),
            ready_to_queue: 0,
            queued: 0,
            next_id: 0,
            just_flushed: false,
            queue_full: false,
            timing: QueueTiming::new(100),
        }
    }

    pub fn queued(&self) -> u32 {
        self.queued
    }

    pub fn ready_to_queue(&self) -> u32 {
        self.ready_to_queue
    }

    pub fn is_queue_full(&self) -> bool {
        self.queue_full
    }

    /// Invariant (iii): `queued + ready_to_queue <= queued_max`.
    pub fn append(&mut self, work: Work) -> Option<WorkId> {
        if self.queued + self.ready_to_queue >= self.queued_max {
            return None;
        }
        let id = WorkId(self.next_id);
        self.next_id += 1;
        self.fifo.push_back(QueueEntry { id, work });
        self.ready_to_queue += 1;
        Some(id)
    }

    /// Should the driver-side FIFO be flushed to the device now?
    /// `spec.md` §4.5's append-path trigger list.
    pub fn should_send(&self, device_idle: bool) -> bool {
        self.ready_to_queue > 0
            && (device_idle
                || self.ready_to_queue >= self.max_queue_at_once
                || self.queued + self.ready_to_queue >= self.queued_max
                || self.just_flushed
                || self.missing_zwx)
    }

    fn pending_works(&self) -> Vec<Work> {
        let take = self.ready_to_queue.min(self.max_queue_at_once) as usize;
        self.fifo
            .iter()
            .rev()
            .take(take)
            .map(|e| e.work.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Sends the pending (not-yet-queued) jobs. `spec.md` §4.5's send
    /// table plus the `ZNX` fallback on `ERROR: UNKNOWN`.
    pub fn send(&mut self, t: &mut dyn Transport) -> Result<()> {
        if self.ready_to_queue == 0 {
            return Ok(());
        }
        let works = self.pending_works();
        let payload = build_queue_payload(self.style, &works);

        let response = match self.style {
            Style::A28 => cmd_bin(t, 0, &payload)?,
            Style::A65 | Style::Fpga => {
                if self.missing_zwx {
                    cmd_with_payload(t, 0, b"ZNX", strip_a65_header(&payload))?
                } else {
                    let r = cmd_with_payload(t, 0, b"ZWX", &payload)?;
                    if r.trim().eq_ignore_ascii_case("ERROR: UNKNOWN") {
                        log::warn!("device does not support ZWX; falling back to ZNX permanently");
                        self.missing_zwx = true;
                        cmd_with_payload(t, 0, b"ZNX", strip_a65_header(&payload))?
                    } else {
                        r
                    }
                }
            }
        };

        self.handle_send_response(response.trim(), works.len() as u32);
        Ok(())
    }

    fn handle_send_response(&mut self, response: &str, sent: u32) {
        self.just_flushed = false;
        if response.eq_ignore_ascii_case("ERR:QUEUE") {
            self.queue_full = true;
            return;
        }
        self.queue_full = false;
        if let Some(rest) = response.strip_prefix("OK:QUEUED") {
            let accepted = if self.missing_zwx {
                1
            } else {
                rest.trim().parse::<u32>().unwrap_or(sent)
            };
            let accepted = accepted.min(sent).max(1).min(self.ready_to_queue);
            // Sent jobs stay in the FIFO (now "queued" rather than
            // "ready"); only `append`/poll-match mutate it further.
            self.queued += accepted;
            self.ready_to_queue -= accepted;
        } else {
            log::warn!("unexpected queue-append response: {response:?}; retrying in 1s");
        }
    }

    /// `spec.md` §4.5 poll path (`ZOX`): fetch up to `BITFORCE_MAX_QRESULTS`
    /// per call, looping (not recursing, per §9's open question) while the
    /// device keeps returning a full batch.
    pub fn poll(&mut self, t: &mut dyn Transport) -> Result<Vec<QueueResult>> {
        let mut all = Vec::new();
        loop {
            let response = cmd_text(t, 0, b"ZOX")?;
            let Some(n) = parse_count_prefix(response.trim()) else {
                break;
            };
            let mut batch = Vec::with_capacity(n);
            for _ in 0..n {
                let line = read_response_line(t)?;
                if let Some(parsed) = parse_queue_result_line(&line, self.parallel) {
                    batch.push(parsed);
                }
            }
            let _terminator = read_response_line(t)?; // "OK"

            let fetched = batch.len();
            for result in batch {
                if let Some(matched) = self.match_and_remove(&result.midstate, &result.tail) {
                    all.push(QueueResult {
                        id: matched,
                        chip_index: self.clamp_chip_index(result.chip_index),
                        nonces: result.nonces,
                    });
                }
            }
            self.timing.on_poll_result(fetched, self.queued);

            if fetched < BITFORCE_MAX_QRESULTS {
                break;
            }
        }
        Ok(all)
    }

    /// Matches a result line to the owning work item by exact
    /// `(midstate, tail)`. In non-parallel mode, results arrive in FIFO
    /// order, so every entry up to and including the match is removed
    /// (`spec.md` §4.5); in parallel mode only the matched entry is
    /// removed, since out-of-order completion is expected.
    fn match_and_remove(&mut self, midstate: &[u8; MIDSTATE_LEN], tail: &[u8; TAIL_LEN]) -> Option<WorkId> {
        let pos = self
            .fifo
            .iter()
            .position(|e| &e.work.midstate == midstate && &e.work.tail == tail)?;
        let id = self.fifo[pos].id;
        if self.parallel {
            self.fifo.remove(pos);
        } else {
            for _ in 0..=pos {
                self.fifo.pop_front();
            }
        }
        self.queued = self.queued.saturating_sub(if self.parallel { 1 } else { pos as u32 + 1 });
        Some(id)
    }

    /// `spec.md` §4.5 flush: `ZqX` (parallel) or `ZQX` (non-parallel),
    /// then an absorbing poll and, if the device supplied an in-progress
    /// list, a reconciliation pass.
    pub fn flush(&mut self, t: &mut dyn Transport) -> Result<()> {
        let cmd: &[u8; 3] = if self.parallel { b"ZqX" } else { b"ZQX" };
        let first = cmd_text(t, 0, cmd)?;
        let trimmed = first.trim();

        self.ready_to_queue = 0;

        if let Some(rest) = trimmed.strip_prefix("OK:FLUSHED") {
            let n: u32 = rest.trim().parse().unwrap_or(0);
            self.queued = self.queued.saturating_sub(n);
        } else if let Some(job_line_count) = parse_count_prefix(trimmed) {
            let flushed_line = read_response_line(t)?;
            let n: u32 = flushed_line
                .trim()
                .strip_prefix("FLUSHED:")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            self.queued = self.queued.saturating_sub(n);

            let mut in_progress: Vec<([u8; MIDSTATE_LEN], [u8; TAIL_LEN])> = Vec::new();
            for _ in 0..job_line_count {
                let line = read_response_line(t)?;
                if let Some((m, tl)) = parse_in_progress_line(&line) {
                    in_progress.push((m, tl));
                }
            }
            let _terminator = read_response_line(t)?; // "OK"
            self.reconcile(&in_progress);
        } else if trimmed.eq_ignore_ascii_case("OK") {
            log::debug!("flush acknowledged without a count; treating as zero flushed");
        } else {
            log::warn!("unexpected flush response: {trimmed:?}");
        }

        self.poll(t)?;
        self.just_flushed = true;
        Ok(())
    }

    /// Drops any driver queue entry not present in the device's
    /// in-progress list — jobs the device has lost (`spec.md` §4.5).
    /// Entries the device claims but we don't track are tolerated.
    fn reconcile(&mut self, in_progress: &[([u8; MIDSTATE_LEN], [u8; TAIL_LEN])]) {
        let mut multiset = in_progress.to_vec();
        self.fifo.retain(|entry| {
            if let Some(pos) = multiset
                .iter()
                .position(|(m, tl)| *m == entry.work.midstate && *tl == entry.work.tail)
            {
                multiset.remove(pos);
                true
            } else {
                log::warn!("dropping queue entry with no match in device's in-progress list");
                false
            }
        });
    }

    /// A chip index at or beyond the planned processor count can't be
    /// attributed to a real `Processor`; clamp to 0 and count it as a
    /// hardware error rather than drop the result (`spec.md` §9).
    fn clamp_chip_index(&mut self, chip_index: Option<u8>) -> Option<u8> {
        chip_index.map(|c| {
            if u32::from(c) >= self.processor_count {
                log::warn!("result chip index {c} out of range (processor_count={}); clamping to 0", self.processor_count);
                self.out_of_range_chip_indices += 1;
                0
            } else {
                c
            }
        })
    }

    /// Drains the out-of-range chip-index count accumulated since the
    /// last call, for the caller to fold into `DeviceStats::hardware_errors`.
    pub fn take_out_of_range_chip_indices(&mut self) -> u32 {
        std::mem::take(&mut self.out_of_range_chip_indices)
    }

    pub fn enable(&mut self) {
        self.queue_full = false;
    }

    pub fn disable(&mut self) {
        self.fifo.clear();
        self.ready_to_queue = 0;
        self.queued = 0;
    }
}

fn parse_in_progress_line(line: &str) -> Option<([u8; MIDSTATE_LEN], [u8; TAIL_LEN])> {
    let mut parts = line.trim().split(',');
    let mut m = [0u8; MIDSTATE_LEN];
    hex::decode_into(parts.next()?, &mut m)?;
    let mut tl = [0u8; TAIL_LEN];
    hex::decode_into(parts.next()?, &mut tl)?;
    Some((m, tl))
}

#[cfg(test)]
fn work_at(byte: u8) -> Work {
    Work::new([byte; MIDSTATE_LEN], [byte.wrapping_add(1); TAIL_LEN])
}

#[cfg(test)]
fn line_for(work: &Work, chip: Option<u8>, nonces: &[u32]) -> String {
    let mut s = format!("{},{}", hex::encode(work.midstate), hex::encode(work.tail));
    if let Some(c) = chip {
        s.push_str(&format!(",{:x}", c));
    }
    s.push_str(&format!(",{}", nonces.len()));
    for n in nonces {
        s.push_str(&format!(",{:08x}", n));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitforce_protocol::mock::MockTransport;

    #[test]
    fn payload_builder_is_pure() {
        let works = vec![work_at(1), work_at(2)];
        let a = build_queue_payload(Style::A28, &works);
        let b = build_queue_payload(Style::A28, &works);
        assert_eq!(a, b);
        assert_eq!(&a[..2], b"WX");
    }

    #[test]
    fn a65_payload_has_no_wx_header() {
        let works = vec![work_at(1)];
        let payload = build_queue_payload(Style::A65, &works);
        assert_ne!(&payload[..2], b"WX");
        assert_eq!(payload[1], A28_HEADER);
    }

    #[test]
    fn s5_queue_three_jobs_on_a65() {
        let mut t = MockTransport::new();
        t.open().unwrap();

        let mut qd = QueueDriver::new(Style::A65, false, 1);
        let w1 = work_at(1);
        let w2 = work_at(2);
        let w3 = work_at(3);
        qd.append(w1.clone());
        qd.append(w2.clone());
        qd.append(w3.clone());

        t.push_line("OK").push_line("OK:QUEUED 3");
        qd.send(&mut t).unwrap();
        assert_eq!(qd.queued(), 3);
        assert_eq!(qd.ready_to_queue(), 0);

        let line1 = line_for(&w1, None, &[1]);
        let line2 = line_for(&w2, None, &[]);
        t.push_line("COUNT:2")
            .push_line(line1)
            .push_line(line2)
            .push_line("OK")
            .push_line("NO-RESULTS"); // second ZOX call in the loop: not COUNT -> breaks

        let results = qd.poll(&mut t).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].nonces, vec![1]);
        assert!(results[1].nonces.is_empty());
        assert_eq!(qd.queued(), 1);
    }

    #[test]
    fn s6_znx_fallback_counts_one_job_regardless_of_batch_size() {
        let mut t = MockTransport::new();
        t.open().unwrap();

        let mut qd = QueueDriver::new(Style::A65, false, 1);
        qd.append(work_at(1));
        qd.append(work_at(2));
        qd.append(work_at(3));

        t.push_line("ERROR: UNKNOWN")
            .push_line("OK")
            .push_line("OK:QUEUED 3");
        qd.send(&mut t).unwrap();
        assert!(qd.missing_zwx);
        assert_eq!(qd.queued(), 1);
        assert_eq!(qd.ready_to_queue(), 2);
    }

    #[test]
    fn s7_flush_with_reconciliation_drops_unmatched_entries() {
        let mut t = MockTransport::new();
        t.open().unwrap();

        let mut qd = QueueDriver::new(Style::A65, false, 1);
        let w1 = work_at(1);
        let w2 = work_at(2);
        qd.append(w1.clone());
        qd.append(w2.clone());
        qd.queued = 2;
        qd.ready_to_queue = 0;

        let inprogress_line = format!("{},{}", hex::encode(w1.midstate), hex::encode(w1.tail));
        t.push_line("COUNT:1")
            .push_line("FLUSHED:2")
            .push_line(inprogress_line)
            .push_line("OK")
            .push_line("NO-RESULTS"); // absorbing poll's ZOX call

        qd.flush(&mut t).unwrap();
        assert_eq!(qd.queued(), 0);
        assert_eq!(qd.ready_to_queue(), 0);
    }

    #[test]
    fn out_of_range_chip_index_is_clamped_and_counted() {
        let mut t = MockTransport::new();
        t.open().unwrap();

        let mut qd = QueueDriver::new(Style::A28, true, 2);
        let w1 = work_at(1);
        qd.append(w1.clone());
        qd.queued = 1;

        let line = line_for(&w1, Some(7), &[42]);
        t.push_line("COUNT:1").push_line(line).push_line("OK").push_line("NO-RESULTS");

        let results = qd.poll(&mut t).unwrap();
        assert_eq!(results[0].chip_index, Some(0));
        assert_eq!(qd.take_out_of_range_chip_indices(), 1);
    }

    #[test]
    fn append_rejects_past_queued_max() {
        let mut qd = QueueDriver::new(Style::A28, false, 1);
        for _ in 0..qd.queued_max {
            assert!(qd.append(work_at(1)).is_some());
        }
        assert!(qd.append(work_at(1)).is_none());
    }
}
