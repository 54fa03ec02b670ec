// Copyright (C) 2026 The xsend Authors
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::io::{Read, Write};
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, ClearBuffer, DataBits, Parity, StopBits};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Trait for the half-duplex byte stream the sender drives
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Reads up to `buf.len()` bytes. A timeout surfaces either as `Ok(0)`
    /// or as an error of kind `TimedOut`.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Discards anything the receiver sent that has not been read yet.
    fn clear_input(&mut self) -> std::io::Result<()>;

    /// Returns whatever bytes are already buffered, without waiting.
    fn read_available(&mut self) -> std::io::Result<Vec<u8>>;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("failed to open serial port {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: serialport::Error,
    },
    #[error("failed to enumerate serial ports: {0}")]
    Enumerate(#[source] serialport::Error),
    #[error("no serial port found")]
    NoPortFound,
}

fn to_io(e: serialport::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, SerialError> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|source| SerialError::Open { name: port_name.to_string(), source })?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout).map_err(to_io)?;
        self.port.read(buf)
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(to_io)
    }

    fn read_available(&mut self) -> std::io::Result<Vec<u8>> {
        let pending = self.port.bytes_to_read().map_err(to_io)? as usize;
        let mut buf = vec![0u8; pending];
        if pending > 0 {
            self.port.read_exact(&mut buf)?;
        }
        Ok(buf)
    }
}

// ============================================================================
// Port Discovery
// ============================================================================

/// Names of all serial ports the system reports, in enumeration order
pub fn list_ports() -> Result<Vec<String>, SerialError> {
    let ports = serialport::available_ports().map_err(SerialError::Enumerate)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Picks the first port the system reports
pub fn discover_port() -> Result<String, SerialError> {
    list_ports()?.into_iter().next().ok_or(SerialError::NoPortFound)
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

/// One call made against the mock, in the order it happened
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Clear,
    Write(usize),
    Read(Duration),
    Drain,
}

#[cfg(test)]
pub type MockOpLog = std::sync::Arc<std::sync::Mutex<Vec<MockOp>>>;

#[cfg(test)]
pub struct MockSerialPort {
    // Control bytes to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Bytes handed out by read_available once the transfer ends
    trailing: Vec<u8>,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    ops: MockOpLog,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            trailing: Vec::new(),
            write_log: Vec::new(),
            expected_writes,
            ops: Default::default(),
        }
    }

    pub fn with_trailing(mut self, trailing: &[u8]) -> Self {
        self.trailing = trailing.to_vec();
        self
    }

    /// Shared log of every call, readable after the mock is consumed
    pub fn op_log(&self) -> MockOpLog {
        self.ops.clone()
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.ops.lock().unwrap().push(MockOp::Write(buf.len()));
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.ops.lock().unwrap().push(MockOp::Read(timeout));

        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        // If current response is None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        self.ops.lock().unwrap().push(MockOp::Clear);
        Ok(())
    }

    fn read_available(&mut self) -> std::io::Result<Vec<u8>> {
        self.ops.lock().unwrap().push(MockOp::Drain);
        Ok(std::mem::take(&mut self.trailing))
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

/// Port that fails every operation, as an unplugged adapter would
#[cfg(test)]
pub struct DisconnectedPort;

#[cfg(test)]
impl SerialPort for DisconnectedPort {
    fn write_all(&mut self, _buf: &[u8]) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "device disconnected"))
    }

    fn read_timeout(&mut self, _buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "device disconnected"))
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn read_available(&mut self) -> std::io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}
