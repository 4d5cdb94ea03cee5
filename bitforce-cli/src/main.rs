// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot control surface for a single BitForce device (`spec.md` §6):
//! probe, identify, fan mode, a raw 3-byte command passthrough, and the
//! global `--allow-nonce-range` flag that seeds the one-job driver's
//! initial protocol.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use bitforce_driver::control;
use bitforce_driver::device::FanMode;
use bitforce_driver::probe;
use bitforce_driver::AsyncDriver;
use bitforce_protocol::framing::cmd_text;
use bitforce_transport::SerialTransport;

#[derive(Debug, Parser)]
#[clap(about = "Control a single BitForce SHA-256 device over its serial/VCOM port")]
struct Args {
    /// Serial device path, e.g. /dev/ttyUSB0
    #[clap(short, long, default_value = "/dev/ttyUSB0")]
    device: String,

    /// Baud rate for the serial transport.
    #[clap(long, default_value_t = 115_200)]
    baud_rate: u32,

    /// Initialise the one-job driver's protocol to RANGE instead of WORK
    /// on boards that have no bulk queue.
    #[clap(long)]
    allow_nonce_range: bool,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Probe the device and print style, identity and chain layout.
    Probe,
    /// Blink the device's identify LED for a few seconds.
    Identify,
    /// Set the fan mode: "auto" or a 0-100 manual speed.
    Fanmode {
        #[clap(value_parser = parse_fan_mode)]
        mode: FanMode,
    },
    /// Send a raw 3-byte command (e.g. "ZGX") and print the response line.
    Cmd1 {
        #[clap(value_parser = parse_raw_cmd)]
        command: [u8; 3],
    },
}

fn parse_fan_mode(s: &str) -> Result<FanMode, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(FanMode::Auto);
    }
    s.parse::<u8>()
        .map(FanMode::Manual)
        .map_err(|_| format!("expected \"auto\" or a 0-100 speed, got {s:?}"))
}

fn parse_raw_cmd(s: &str) -> Result<[u8; 3], String> {
    let bytes = s.as_bytes();
    if bytes.len() != 3 {
        return Err(format!("command must be exactly 3 bytes, got {:?} ({})", s, bytes.len()));
    }
    Ok([bytes[0], bytes[1], bytes[2]])
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut transport = SerialTransport::new(&args.device, args.baud_rate);
    let result = probe::probe(&mut transport).with_context(|| format!("probing {}", args.device))?;
    log::info!("probed {}: style={:?}, identity={:?}", args.device, result.style, result.identity);

    match args.cmd {
        Cmd::Probe => {
            println!("style: {:?}", result.style);
            println!("identity: {}", result.identity);
            println!("devices in chain: {}", result.devices_in_chain);
            println!("total processors: {}", result.total_processors());
            if !result.style.is_queued() {
                let driver = AsyncDriver::new(args.allow_nonce_range);
                println!("one-job protocol: {:?}", driver.protocol());
            }
        }
        Cmd::Identify => {
            control::identify(&mut transport)?;
            println!("identify complete");
        }
        Cmd::Fanmode { mode } => {
            let applied = control::set_fan_mode(&mut transport, mode)?;
            println!("fan mode set to {applied:?}");
        }
        Cmd::Cmd1 { command } => {
            let response = cmd_text(&mut transport, 0, &command)?;
            if response.is_empty() {
                bail!("device did not respond to {:?}", String::from_utf8_lossy(&command));
            }
            println!("{response}");
        }
    }
    Ok(())
}
