// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device style/generation and the chip-plan policy used to size the
//! processor array discovered during probe.

/// Device generation, negotiated during probe (`spec.md` §4.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Style {
    /// Older FPGA board. Single job, no queue.
    Fpga,
    /// 65 nm ASIC. Queued, `max_queue_at_once = 5`.
    A65,
    /// 28 nm ASIC. Queued, `max_queue_at_once = 20`.
    A28,
}

impl Style {
    /// `queued_max` clamp window from invariant (iii): `2 * parallel`
    /// clamped to `[10, 40]`.
    pub fn queued_max(self, parallel: u32) -> u32 {
        (2 * parallel).clamp(10, 40)
    }

    /// `max_queue_at_once` from invariant (iii).
    pub fn max_queue_at_once(self) -> u32 {
        match self {
            Style::Fpga => 0,
            Style::A65 => 5,
            Style::A28 => 20,
        }
    }

    pub fn is_queued(self) -> bool {
        !matches!(self, Style::Fpga)
    }
}

/// Capability flags tracked per `Device`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_fanspeed: bool,
    /// Set permanently once `ZWX` has been observed to fail with
    /// `ERROR: UNKNOWN` and the driver has fallen back to `ZNX`.
    pub missing_zwx: bool,
    /// True when the board reported protocol-parallel capability (a
    /// negative parallel factor at probe time); selects `PQUEUE` over
    /// `BQUEUE` and enables chip-indexed result attribution.
    pub parallel_protocol: bool,
}

/// Plan processor count for a reported parallel factor `p` and the
/// highest chip index `c` actually observed in the `PROCESSOR ` lines of
/// the `ZCX` dump, per the chip-plan policy in `spec.md` §4.3: the
/// smallest power of two strictly greater than `c`, from the fixed ladder
/// `1, 2, 4, 8, 16, 32` (zero chips observed -> 1 processor).
pub fn plan_processor_count(max_chip_index_seen: Option<u32>) -> u32 {
    const LADDER: [u32; 6] = [1, 2, 4, 8, 16, 32];
    let c = match max_chip_index_seen {
        None => return 1,
        Some(c) => c,
    };
    for &step in &LADDER {
        if step > c {
            return step;
        }
    }
    *LADDER.last().unwrap()
}

/// Split a signed parallel factor into `(abs(p), protocol_parallel)`.
pub fn decode_parallel_factor(p: i32) -> (u32, bool) {
    (p.unsigned_abs(), p < 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_max_clamps() {
        assert_eq!(Style::A28.queued_max(1), 10);
        assert_eq!(Style::A28.queued_max(16), 32);
        assert_eq!(Style::A28.queued_max(100), 40);
    }

    #[test]
    fn chip_plan_ladder() {
        assert_eq!(plan_processor_count(None), 1);
        assert_eq!(plan_processor_count(Some(0)), 1);
        assert_eq!(plan_processor_count(Some(1)), 2);
        assert_eq!(plan_processor_count(Some(2)), 4);
        assert_eq!(plan_processor_count(Some(15)), 16);
        assert_eq!(plan_processor_count(Some(16)), 32);
    }

    #[test]
    fn parallel_factor_sign_encodes_protocol_parallel() {
        assert_eq!(decode_parallel_factor(-4), (4, true));
        assert_eq!(decode_parallel_factor(4), (4, false));
    }
}
