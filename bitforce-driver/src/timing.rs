// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Adaptive polling cadence shared by both driver personalities
//! (`spec.md` §4.4, §4.5).

/// Poll cadence constants named in `spec.md`.
pub const WORK_CHECK_INTERVAL_MS: u64 = 50;
pub const BITFORCE_CHECK_INTERVAL_MS: u64 = 10;
pub const BITFORCE_LONG_TIMEOUT_MS: u64 = 25_000;

pub const BITFORCE_MAX_QRESULTS: usize = 16;
pub const BITFORCE_GOAL_QRESULTS: u64 = 5;
pub const BITFORCE_MIN_QRESULT_WAIT_MS: u64 = 10;
pub const BITFORCE_MAX_QRESULT_WAIT_MS: u64 = 1000;

/// Timing state for the one-job (async) driver.
#[derive(Clone, Debug)]
pub struct AsyncTiming {
    pub sleep_ms: u64,
    pub sleep_ms_default: u64,
    pub avg_wait: f64,
}

impl AsyncTiming {
    pub fn new(sleep_ms_default: u64) -> Self {
        Self {
            sleep_ms: sleep_ms_default,
            sleep_ms_default,
            avg_wait: 0.0,
        }
    }

    /// Results arrived on the first poll, with no intervening "busy"
    /// response: keep `sleep_ms` if the overshoot (time we budgeted
    /// beyond what the device actually needed) is small, otherwise reset
    /// to `sleep_ms_default`, or to `BITFORCE_CHECK_INTERVAL_MS` if the
    /// default is itself too slack for the observed latency.
    pub fn on_first_poll_success(&mut self, elapsed_ms: u64) {
        let overshoot = self.sleep_ms.saturating_sub(elapsed_ms);
        if overshoot <= WORK_CHECK_INTERVAL_MS {
            return;
        }
        let default_overshoot = self.sleep_ms_default.saturating_sub(elapsed_ms);
        self.sleep_ms = if default_overshoot > WORK_CHECK_INTERVAL_MS {
            BITFORCE_CHECK_INTERVAL_MS
        } else {
            self.sleep_ms_default
        };
    }

    /// Results arrived after one or more "busy" polls observed at
    /// `busy_ms` intervals: pull `sleep_ms` toward the observed latency
    /// when it's meaningfully off.
    pub fn on_busy_then_success(&mut self, busy_ms: u64) {
        if busy_ms.saturating_sub(self.sleep_ms) > WORK_CHECK_INTERVAL_MS {
            self.sleep_ms = busy_ms.saturating_sub(WORK_CHECK_INTERVAL_MS / 2);
        }
    }

    pub fn update_avg_wait(&mut self, elapsed_ms: u64) {
        self.avg_wait += (elapsed_ms as f64 - self.avg_wait) / 8.0;
    }

    /// Switching `WORK` <-> `RANGE` scales the interval by the
    /// corresponding factor from `spec.md` §4.4.
    pub fn scale_for_range_switch(&mut self, entering_range: bool) {
        self.sleep_ms = if entering_range {
            self.sleep_ms.saturating_mul(5)
        } else {
            (self.sleep_ms / 5).max(BITFORCE_CHECK_INTERVAL_MS)
        };
    }
}

/// Timing state for the bulk-queue (non-parallel) driver.
#[derive(Clone, Debug)]
pub struct QueueTiming {
    pub sleep_ms: u64,
}

impl QueueTiming {
    pub fn new(sleep_ms_default: u64) -> Self {
        Self {
            sleep_ms: sleep_ms_default,
        }
    }

    /// Adjusts toward `BITFORCE_GOAL_QRESULTS` yield per poll, only when
    /// `queued > 1` and the ratio is meaningfully off (more than ~20% from
    /// the goal), clamped to `[MIN, MAX]`.
    pub fn on_poll_result(&mut self, fetched: usize, queued: u32) {
        if queued <= 1 {
            return;
        }
        let fcount = fetched.max(1) as u64;
        let target = BITFORCE_GOAL_QRESULTS;
        let ratio_off = fcount.abs_diff(target) * 5 > target; // >20% off
        if !ratio_off {
            return;
        }
        let candidate = self.sleep_ms.saturating_mul(target) / fcount;
        self.sleep_ms = candidate.clamp(BITFORCE_MIN_QRESULT_WAIT_MS, BITFORCE_MAX_QRESULT_WAIT_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_poll_success_keeps_sleep_when_overshoot_small() {
        let mut t = AsyncTiming::new(500);
        t.sleep_ms = 700;
        t.on_first_poll_success(660); // overshoot 40 <= 50
        assert_eq!(t.sleep_ms, 700);
    }

    #[test]
    fn first_poll_success_resets_to_default_when_overshoot_large() {
        let mut t = AsyncTiming::new(100);
        t.sleep_ms = 700;
        t.on_first_poll_success(10); // overshoot 690, default_overshoot = 90 <= 50? no, 90>50
        assert_eq!(t.sleep_ms, BITFORCE_CHECK_INTERVAL_MS);
    }

    #[test]
    fn first_poll_success_resets_to_sleep_default_when_default_is_tight() {
        let mut t = AsyncTiming::new(650);
        t.sleep_ms = 700;
        t.on_first_poll_success(640); // overshoot 60 > 50; default_overshoot = 10 <= 50
        assert_eq!(t.sleep_ms, 650);
    }

    #[test]
    fn busy_then_success_converges_toward_observed_latency() {
        // Property 5: for constant latency L, sleep_ms converges to
        // within [L - WORK_CHECK_INTERVAL_MS, L] in O(1) polls.
        let l = 700;
        let mut t = AsyncTiming::new(100);
        for _ in 0..4 {
            t.on_busy_then_success(l);
        }
        assert!(t.sleep_ms <= l);
        assert!(t.sleep_ms >= l - WORK_CHECK_INTERVAL_MS);
    }

    #[test]
    fn avg_wait_is_an_ema_with_factor_eight() {
        let mut t = AsyncTiming::new(100);
        t.update_avg_wait(800.0 as u64);
        assert!((t.avg_wait - 100.0).abs() < 1e-9);
    }

    #[test]
    fn queue_timing_targets_goal_yield_and_clamps() {
        let mut q = QueueTiming::new(100);
        q.on_poll_result(1, 10); // far below goal of 5 -> interval should grow
        assert!(q.sleep_ms > 100);
        let mut q2 = QueueTiming::new(20);
        q2.on_poll_result(16, 10); // far above goal -> interval should shrink
        assert!(q2.sleep_ms < 20);
    }

    #[test]
    fn queue_timing_ignores_small_or_single_item_queues() {
        let mut q = QueueTiming::new(100);
        q.on_poll_result(1, 1); // queued <= 1, never adjusted
        assert_eq!(q.sleep_ms, 100);
    }
}
