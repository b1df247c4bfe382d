use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};

use crate::core::error::TransportError;
use crate::core::utils::{decode_line, format_hex_spaced};

/// Time the reader needs after the port opens; it reboots on connection
pub const CONNECT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Default baud rate of the reader firmware
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A newline-framed, bidirectional link to the reader
pub trait LineTransport {
    /// Wait up to `timeout` for the next non-blank line.
    ///
    /// `Ok(None)` means the timeout elapsed; that is the normal outcome
    /// when the device has nothing to say.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;

    /// Write raw bytes and flush them to the device
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Drop everything received but not yet returned as a line
    fn reset_input(&mut self) -> Result<(), TransportError>;

    /// Send `line` followed by a newline
    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write(&bytes)
    }
}

/// Accumulates raw bytes and hands out complete lines
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete non-blank line, if one has been received
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = decode_line(&raw);
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    /// Bytes received after the last newline
    pub fn partial_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Line transport over a serial port
pub struct SerialTransport {
    port_name: String,
    port: Box<dyn SerialPort>,
    framer: LineFramer,
}

impl SerialTransport {
    /// Open `port_name` and wait for the reader to finish booting
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        Self::open_with_settle(port_name, baud_rate, CONNECT_SETTLE_DELAY)
    }

    pub fn open_with_settle(
        port_name: &str,
        baud_rate: u32,
        settle: Duration,
    ) -> Result<Self, TransportError> {
        log::info!("Connecting to {} at {} baud", port_name, baud_rate);

        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|source| {
                log::error!("Failed to connect to {}: {}", port_name, source);
                TransportError::Connect {
                    port: port_name.to_string(),
                    source,
                }
            })?;

        // Anything printed before the reader settles is boot noise
        thread::sleep(settle);

        log::info!("Connected to {}", port_name);
        Ok(Self {
            port_name: port_name.to_string(),
            port,
            framer: LineFramer::new(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl LineTransport for SerialTransport {
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];

        loop {
            if let Some(line) = self.framer.next_line() {
                log::debug!("RX: {}", line);
                return Ok(Some(line));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            self.port.set_timeout(remaining)?;
            match self.port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => self.framer.push(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(TransportError::Read(e)),
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        log::debug!("TX: {}", format_hex_spaced(bytes));
        self.port.write_all(bytes).map_err(TransportError::Write)?;
        self.port.flush().map_err(TransportError::Write)
    }

    fn reset_input(&mut self) -> Result<(), TransportError> {
        if self.framer.partial_len() > 0 {
            log::debug!("Discarding {} buffered bytes", self.framer.partial_len());
        }
        self.framer.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        log::info!("Disconnected from {}", self.port_name);
    }
}

/// A serial port visible on this machine
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    pub port_type: String,
    pub product: Option<String>,
    pub vid_pid: Option<(u16, u16)>,
}

/// List serial ports the reader could be attached to
pub fn available_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports()?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let (port_type, product, vid_pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    ("USB".to_string(), info.product, Some((info.vid, info.pid)))
                }
                serialport::SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None),
                serialport::SerialPortType::PciPort => ("PCI".to_string(), None, None),
                serialport::SerialPortType::Unknown => ("Unknown".to_string(), None, None),
            };
            PortInfo {
                name: p.port_name,
                port_type,
                product,
                vid_pid,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_splits_lines() {
        let mut framer = LineFramer::new();
        framer.push(b"START_CARD-04A1_CARRIED-1234\r\nRFID Re");
        assert_eq!(framer.next_line().as_deref(), Some("START_CARD-04A1_CARRIED-1234"));
        assert_eq!(framer.next_line(), None);
        assert_eq!(framer.partial_len(), 7);

        framer.push(b"ader ready\n");
        assert_eq!(framer.next_line().as_deref(), Some("RFID Reader ready"));
        assert_eq!(framer.partial_len(), 0);
    }

    #[test]
    fn test_framer_skips_blank_lines() {
        let mut framer = LineFramer::new();
        framer.push(b"\r\n\n   \nrst:0x1\n");
        assert_eq!(framer.next_line().as_deref(), Some("rst:0x1"));
        assert_eq!(framer.next_line(), None);
    }

    #[test]
    fn test_framer_clear() {
        let mut framer = LineFramer::new();
        framer.push(b"stale line\npartial");
        framer.clear();
        assert_eq!(framer.next_line(), None);
        assert_eq!(framer.partial_len(), 0);
    }

    #[test]
    fn test_open_missing_port_is_connect_error() {
        let result = SerialTransport::open_with_settle(
            "/dev/rfid-vault-does-not-exist",
            DEFAULT_BAUD_RATE,
            Duration::ZERO,
        );
        match result {
            Err(TransportError::Connect { port, .. }) => {
                assert_eq!(port, "/dev/rfid-vault-does-not-exist")
            }
            Err(other) => panic!("Expected connect error, got {other}"),
            Ok(_) => panic!("Expected connect error"),
        }
    }
}
