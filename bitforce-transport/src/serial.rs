// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial/VCOM transport: one byte at a time until newline, a 250 ms
//! inter-byte timeout, and a blocking whole-buffer write.

use std::io::{Read, Write};
use std::time::Duration;

use bitforce_protocol::error::{DriverError, Result};
use bitforce_protocol::transport::Transport;

const INTER_BYTE_TIMEOUT: Duration = Duration::from_millis(250);

pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: None,
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(INTER_BYTE_TIMEOUT)
            .open()
            .map_err(|e| {
                log::warn!("failed to open serial transport {}: {}", self.path, e);
                DriverError::TransportClosed
            })?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read_line(&mut self, buf: &mut [u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or(DriverError::TransportClosed)?;
        let mut n = 0;
        let mut byte = [0u8; 1];
        while n < buf.len() {
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    buf[n] = byte[0];
                    n += 1;
                }
                // A timed-out read is not a fault: it's how the caller
                // learns the device has nothing to say yet.
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    log::warn!("serial read error on {}: {}", self.path, e);
                    return Err(DriverError::TransportClosed);
                }
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or(DriverError::TransportClosed)?;
        match port.write_all(data) {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                log::warn!("serial write error on {}: {}", self.path, e);
                Ok(0)
            }
        }
    }
}
