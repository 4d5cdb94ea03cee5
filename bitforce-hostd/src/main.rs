// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Standalone daemon entry point: probes one device, spawns its
//! minerloop/statsloop pair (`spec.md` §5) and runs until interrupted.
//! Work generation is out of scope (`spec.md` §1's external collaborator
//! boundary), so this binary drives a synthetic, never-ending work
//! source purely to exercise the driver end to end.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use bitforce_hostd::{spawn_minerloop, spawn_statsloop, MiningBoard, WorkSource};
use bitforce_protocol::work::{Work, WorkId, MIDSTATE_LEN, TAIL_LEN};
use bitforce_transport::SerialTransport;

/// Hands out work built from a monotonically increasing counter and
/// discards submitted nonces. Stands in for the real share-submission
/// collaborator this crate doesn't implement.
struct CounterWorkSource {
    next: AtomicU64,
    submitted: Mutex<u64>,
}

impl CounterWorkSource {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            submitted: Mutex::new(0),
        }
    }
}

impl WorkSource for CounterWorkSource {
    fn next_work(&self) -> Option<Work> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let mut midstate = [0u8; MIDSTATE_LEN];
        midstate[..8].copy_from_slice(&n.to_be_bytes());
        let tail = [0u8; TAIL_LEN];
        Some(Work::new(midstate, tail))
    }

    fn submit_nonces(&self, id: Option<WorkId>, nonces: &[u32]) {
        if nonces.is_empty() {
            return;
        }
        *self.submitted.lock().unwrap() += nonces.len() as u64;
        log::info!("{} nonce(s) from job {id:?}: {nonces:02x?}", nonces.len());
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let device_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let baud_rate: u32 = std::env::var("BITFORCE_BAUD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(115_200);
    let allow_nonce_range = std::env::var("BITFORCE_ALLOW_NONCE_RANGE").is_ok();

    let transport = Box::new(SerialTransport::new(device_path.clone(), baud_rate));
    let board = Arc::new(
        MiningBoard::probe_and_build(transport, allow_nonce_range)
            .with_context(|| format!("probing BitForce device at {device_path}"))?,
    );
    log::info!("probed {device_path}: style={:?} queued={}", board.style(), board.is_queued());

    let source: Arc<dyn WorkSource> = Arc::new(CounterWorkSource::new());
    let stop = Arc::new(AtomicBool::new(false));

    let minerloop = spawn_minerloop(board.clone(), source, stop.clone());
    let statsloop = spawn_statsloop(board.clone(), stop);

    // Runs until the process is killed; there's no in-process stop trigger
    // yet (no admin socket or signal handler in this daemon's scope).
    minerloop.join().ok();
    statsloop.join().ok();
    Ok(())
}
