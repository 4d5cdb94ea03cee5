// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control surface (`spec.md` §4.6): temperature/voltage readouts,
//! LED identify, fan mode, and re-initialisation, all serialised against
//! the device mutex.

use std::thread;
use std::time::Duration;

use bitforce_protocol::error::{DriverError, Result};
use bitforce_protocol::framing::cmd_text;
use bitforce_protocol::Transport;

use crate::device::{FanMode, TempVolts};
use crate::timing::BITFORCE_LONG_TIMEOUT_MS;

const REINIT_SETTLE: Duration = Duration::from_secs(5);
const LED_IDENTIFY_HOLD: Duration = Duration::from_secs(4);

/// Parses `ZTX`'s `TEMP:<f>[|TEMP:<f>]` into up to two readings. A
/// malformed response is reported as `ThermalThrottle` so the caller can
/// flush the input buffer and tick a hardware error, per `spec.md` §4.6.
pub fn parse_temperatures(line: &str) -> Result<[Option<f32>; 2]> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DriverError::ThermalThrottle);
    }
    let mut temps = [None, None];
    for (i, part) in line.split('|').take(2).enumerate() {
        let value = part
            .trim()
            .strip_prefix("TEMP:")
            .ok_or(DriverError::ThermalThrottle)?;
        temps[i] = Some(value.parse::<f32>().map_err(|_| DriverError::ThermalThrottle)?);
    }
    Ok(temps)
}

/// Parses `ZLX`'s comma-separated millivolt list.
pub fn parse_voltages(line: &str) -> Result<Vec<u32>> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DriverError::ThermalThrottle);
    }
    line.split(',')
        .map(|s| {
            s.trim()
                .parse::<f32>()
                .map(|v| v as u32)
                .map_err(|_| DriverError::ThermalThrottle)
        })
        .collect()
}

/// Reads temperature and voltage in one pass (`ZTX` then `ZLX`), under
/// the caller's already-held device mutex.
pub fn read_temp_volts(t: &mut dyn Transport) -> Result<TempVolts> {
    let temp_line = cmd_text(t, 0, b"ZTX")?;
    let temps = parse_temperatures(&temp_line)?;
    let volt_line = cmd_text(t, 0, b"ZLX")?;
    let millivolts = parse_voltages(&volt_line)?;

    let mut tv = TempVolts {
        temps,
        ..Default::default()
    };
    tv.set_millivolts(&millivolts);
    Ok(tv)
}

/// `ZMX`: identify via LED. Holds the mutex (via the caller, who must
/// already hold it) for `LED_IDENTIFY_HOLD` to avoid interleaving with
/// any other command while the LED blinks.
pub fn identify(t: &mut dyn Transport) -> Result<()> {
    cmd_text(t, 0, b"ZMX")?;
    thread::sleep(LED_IDENTIFY_HOLD);
    Ok(())
}

/// `Z{0..5,9}X`: sets fan mode. `Z9X` is the probe-time availability
/// check (an `ERR` response there permanently disables fan control);
/// `Z0X..Z5X` select a manual speed band.
pub fn probe_fan_support(t: &mut dyn Transport) -> Result<bool> {
    let response = cmd_text(t, 0, b"Z9X")?;
    Ok(!response.trim().eq_ignore_ascii_case("ERR"))
}

pub fn set_fan_mode(t: &mut dyn Transport, mode: FanMode) -> Result<FanMode> {
    let cmd: [u8; 3] = match mode {
        FanMode::Auto => *b"Z9X",
        FanMode::Manual(speed) => {
            let band = (speed / 20).min(5);
            [b'Z', b'0' + band, b'X']
        }
    };
    let response = cmd_text(t, 0, &cmd)?;
    if response.trim().eq_ignore_ascii_case("ERR") {
        return Err(DriverError::ProtocolUnsupported);
    }
    Ok(mode)
}

/// `spec.md` §4.6 re-init: close, settle, reopen, resynchronise identity
/// with a bounded busy-wait, per `SPEC_FULL.md`'s §4.6 supplement a style
/// mismatch after resync marks the device failed rather than silently
/// re-adopting a new style (a cable-swap guard; the driver has no way to
/// safely re-plan `queued_max`/`max_queue_at_once` mid-flight).
pub fn reinit(t: &mut dyn Transport, expected_identity: &str) -> Result<()> {
    reinit_with_settle(t, expected_identity, REINIT_SETTLE)
}

fn reinit_with_settle(t: &mut dyn Transport, expected_identity: &str, settle: Duration) -> Result<()> {
    t.close();
    thread::sleep(settle);
    t.open()?;

    let deadline_polls = BITFORCE_LONG_TIMEOUT_MS / 50;
    let mut id_line = String::new();
    for _ in 0..deadline_polls {
        id_line = cmd_text(t, 0, b"ZGX")?;
        if !id_line.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    if id_line.is_empty() {
        return Err(DriverError::Timeout);
    }
    if !id_line.contains(expected_identity) {
        log::error!(
            "re-init identity mismatch: expected {expected_identity:?}, got {id_line:?}; \
             marking device failed rather than silently restyling"
        );
        return Err(DriverError::SanityMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitforce_protocol::mock::MockTransport;

    #[test]
    fn parses_two_temperature_sensors() {
        let temps = parse_temperatures("TEMP:45.5|TEMP:46.0").unwrap();
        assert_eq!(temps, [Some(45.5), Some(46.0)]);
    }

    #[test]
    fn garbled_temperature_is_a_thermal_throttle_error() {
        assert!(matches!(
            parse_temperatures("garbage"),
            Err(DriverError::ThermalThrottle)
        ));
    }

    #[test]
    fn parses_millivolt_list() {
        let volts = parse_voltages("1200.000,1250.500").unwrap();
        assert_eq!(volts, vec![1200, 1250]);
    }

    #[test]
    fn fan_mode_is_rejected_when_device_reports_err() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_line("ERR");
        assert!(matches!(
            set_fan_mode(&mut t, FanMode::Manual(40)),
            Err(DriverError::ProtocolUnsupported)
        ));
    }

    #[test]
    fn reinit_rejects_an_identity_mismatch_after_resync() {
        let mut t = MockTransport::new();
        t.open().unwrap();
        t.push_line(">>>ID: a different board>>>");
        assert!(matches!(
            reinit_with_settle(&mut t, "BFL SHA256", Duration::ZERO),
            Err(DriverError::SanityMismatch)
        ));
    }
}
