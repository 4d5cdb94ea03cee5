// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Probe and enumeration (`spec.md` §4.3): opens a candidate transport,
//! negotiates style/chain/parallelism, and plans the processor array.

use bitforce_protocol::error::{DriverError, Result};
use bitforce_protocol::framing::{cmd_text, read_response_line};
use bitforce_protocol::style::{decode_parallel_factor, plan_processor_count};
use bitforce_protocol::{Capabilities, Style, Transport};

use crate::control;

const FIRST_LINE_RETRIES: u32 = 4;

/// Everything learned about one board on the XLINK chain during its
/// `ZCX` exchange.
#[derive(Clone, Debug, Default)]
pub struct BoardInfo {
    pub xlink_id: u8,
    pub max_chip_index_seen: Option<u32>,
    /// Signed parallel factor as reported by `CHIP PARALLELIZATION: YES @N`
    /// / `ASIC CHANNELS:N`; negative encodes protocol-parallel capability.
    pub parallel_factor: Option<i32>,
    pub asic_channels: Option<u32>,
    pub style_upgrade_to_a65: bool,
    pub manufacturer: Option<String>,
}

impl BoardInfo {
    pub fn processor_count(&self) -> u32 {
        self.asic_channels
            .unwrap_or_else(|| plan_processor_count(self.max_chip_index_seen))
    }

    pub fn parallel(&self) -> u32 {
        self.parallel_factor
            .map(|p| decode_parallel_factor(p).0)
            .or(self.asic_channels)
            .unwrap_or(1)
    }

    pub fn protocol_parallel(&self) -> bool {
        self.parallel_factor
            .map(|p| decode_parallel_factor(p).1)
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug)]
pub struct ProbeResult {
    pub style: Style,
    pub identity: String,
    pub capabilities: Capabilities,
    pub chain_presence_mask: u32,
    pub devices_in_chain: u32,
    /// Board 0 is the locally addressed board (XLINK id 0); subsequent
    /// entries are downstream boards 1..devices_in_chain.
    pub boards: Vec<BoardInfo>,
}

impl ProbeResult {
    /// Total processor count across every board, per the chip-plan policy.
    pub fn total_processors(&self) -> u32 {
        self.boards.iter().map(BoardInfo::processor_count).sum()
    }
}

/// Extracts the `>>>ID: ...>>>` marker from a `ZGX` reply line.
fn extract_identity(line: &str) -> Option<String> {
    let start = line.find(">>>ID: ")? + ">>>ID: ".len();
    let rest = &line[start..];
    let end = rest.find(">>>")?;
    Some(rest[..end].trim().to_string())
}

fn send_zcx_with_retries(t: &mut dyn Transport, xlink_id: u8) -> Result<String> {
    for _ in 0..=FIRST_LINE_RETRIES {
        let line = cmd_text(t, xlink_id, b"ZCX")?;
        if !line.is_empty() {
            return Ok(line);
        }
    }
    Err(DriverError::Timeout)
}

/// Runs the `ZCX` exchange for one board (local if `xlink_id == 0`,
/// otherwise routed through the XLINK envelope) and parses the key/value
/// dump per the table in `spec.md` §4.3.
fn probe_board(t: &mut dyn Transport, xlink_id: u8) -> Result<(BoardInfo, Option<u32>, Option<u32>)> {
    let mut board = BoardInfo {
        xlink_id,
        ..Default::default()
    };
    let mut devices_in_chain = None;
    let mut chain_presence_mask = None;

    let mut line = send_zcx_with_retries(t, xlink_id)?;
    loop {
        parse_zcx_line(&line, &mut board, &mut devices_in_chain, &mut chain_presence_mask);
        if line.trim().eq_ignore_ascii_case("OK") {
            break;
        }
        line = read_response_line(t)?;
        if line.is_empty() {
            return Err(DriverError::Timeout);
        }
    }

    Ok((board, devices_in_chain, chain_presence_mask))
}

fn parse_zcx_line(
    line: &str,
    board: &mut BoardInfo,
    devices_in_chain: &mut Option<u32>,
    chain_presence_mask: &mut Option<u32>,
) {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("PROCESSOR ") {
        if let Ok(idx) = rest.trim().parse::<u32>() {
            board.max_chip_index_seen =
                Some(board.max_chip_index_seen.map_or(idx, |m| m.max(idx)));
        }
    } else if let Some(rest) = line.strip_prefix("DEVICES IN CHAIN:") {
        *devices_in_chain = rest.trim().parse().ok();
    } else if let Some(rest) = line.strip_prefix("CHAIN PRESENCE MASK:") {
        *chain_presence_mask = u32::from_str_radix(rest.trim().trim_start_matches("0x"), 16).ok();
    } else if line.starts_with("DEVICE:") && line.contains("SC") {
        board.style_upgrade_to_a65 = true;
    } else if let Some(rest) = line.strip_prefix("CHIP PARALLELIZATION: YES @") {
        board.parallel_factor = rest.trim().parse().ok();
    } else if let Some(rest) = line.strip_prefix("ASIC CHANNELS:") {
        board.asic_channels = rest.trim().parse().ok();
    } else if let Some(rest) = line.strip_prefix("MANUFACTURER:") {
        board.manufacturer = Some(rest.trim().to_string());
    } else if let Some(rest) = line.strip_prefix("XLINK:") {
        // Supplement: the board's own reported XLINK id, used only to
        // sanity-check addressing; not otherwise acted upon.
        let _ = rest.trim().parse::<u8>();
    }
}

/// Runs the full probe sequence against an already-constructed
/// transport: `ZGX` identity check, then `ZCX` on the local board and
/// every downstream board named by `DEVICES IN CHAIN:`.
pub fn probe(t: &mut dyn Transport) -> Result<ProbeResult> {
    t.open()?;

    let id_line = cmd_text(t, 0, b"ZGX")?;
    if id_line.is_empty() {
        return Err(DriverError::Timeout);
    }
    if !id_line.contains("SHA256") {
        return Err(DriverError::UnexpectedResponse(id_line));
    }
    let identity = extract_identity(&id_line).unwrap_or_else(|| id_line.clone());

    let (mut local, devices_in_chain, chain_presence_mask) = probe_board(t, 0)?;
    let devices_in_chain = devices_in_chain.unwrap_or(0);
    let chain_presence_mask = chain_presence_mask.unwrap_or(0);

    let mut style = Style::Fpga;
    let mut upgrade_seen = local.style_upgrade_to_a65;
    if local.asic_channels.is_some() {
        style = Style::A28;
    }

    let mut boards = vec![local.clone()];
    for board_idx in 1..devices_in_chain {
        let xlink_id = board_idx as u8;
        let (board, _, _) = probe_board(t, xlink_id)?;
        upgrade_seen |= board.style_upgrade_to_a65;
        if board.asic_channels.is_some() {
            style = Style::A28;
        }
        boards.push(board);
    }

    // "If a non-FPGA feature appears on a style still marked FPGA
    // (multi-proc or parallel>1), the style is forced to A65 and a
    // warning is surfaced; this is intentionally permissive."
    let multi_proc = boards.iter().any(|b| b.processor_count() > 1);
    let parallel_gt_one = boards.iter().any(|b| b.parallel() > 1);
    if style == Style::Fpga && (upgrade_seen || multi_proc || parallel_gt_one) {
        log::warn!(
            "device reported SC/multi-proc/parallel features while still tagged FPGA; \
             forcing style to A65"
        );
        style = Style::A65;
    } else if upgrade_seen && style == Style::Fpga {
        style = Style::A65;
    }

    local.manufacturer = boards[0].manufacturer.clone();

    let supports_fanspeed = control::probe_fan_support(t)?;

    let capabilities = Capabilities {
        supports_fanspeed,
        missing_zwx: false,
        parallel_protocol: boards.iter().any(BoardInfo::protocol_parallel),
    };

    Ok(ProbeResult {
        style,
        identity,
        capabilities,
        chain_presence_mask,
        devices_in_chain,
        boards,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitforce_protocol::mock::MockTransport;

    fn probe_with_lines(lines: &[&str]) -> ProbeResult {
        let mut t = MockTransport::new();
        for l in lines {
            t.push_line(*l);
        }
        probe(&mut t).unwrap()
    }

    #[test]
    fn s1_probe_fpga() {
        let result = probe_with_lines(&[
            ">>>ID: BFL SHA256>>>",
            "DEVICES IN CHAIN: 1",
            "OK",
        ]);
        assert_eq!(result.style, Style::Fpga);
        assert_eq!(result.identity, "BFL SHA256");
        assert_eq!(result.total_processors(), 1);
    }

    #[test]
    fn s2_probe_28nm() {
        let result = probe_with_lines(&[">>>ID: some-device>>>", "ASIC CHANNELS:16", "OK"]);
        assert_eq!(result.style, Style::A28);
        assert_eq!(result.total_processors(), 16);
        assert_eq!(result.boards[0].parallel(), 16);
        assert_eq!(result.style.queued_max(16), 32);
        assert_eq!(result.style.max_queue_at_once(), 20);
    }

    #[test]
    fn missing_identity_response_is_a_probe_failure() {
        let mut t = MockTransport::new();
        t.push_timeout();
        assert!(matches!(probe(&mut t), Err(DriverError::Timeout)));
    }

    #[test]
    fn identity_without_sha256_is_rejected() {
        let mut t = MockTransport::new();
        t.push_line(">>>ID: some other device>>>");
        assert!(matches!(
            probe(&mut t),
            Err(DriverError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn fan_support_is_probed_via_z9x_during_probe() {
        let result = probe_with_lines(&[
            ">>>ID: BFL SHA256>>>",
            "DEVICES IN CHAIN: 1",
            "OK",
            "ERR",
        ]);
        assert!(!result.capabilities.supports_fanspeed);
    }

    #[test]
    fn fpga_style_is_upgraded_when_sc_device_line_appears() {
        let result = probe_with_lines(&[
            ">>>ID: BFL SHA256>>>",
            "DEVICE: SC-65NM",
            "OK",
        ]);
        assert_eq!(result.style, Style::A65);
    }
}
