//! Serial Transportation.
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::Transport;
use crate::error::{Error, Result};

const SERIAL_TIMEOUT_MS: u64 = 1000;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }
}

impl Transport for SerialTransport {
    fn send_frame(&mut self, raw: &[u8], timeout: Duration) -> Result<usize> {
        self.serial_port.set_timeout(timeout)?;
        match self.serial_port.write_all(raw) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::TimedOut => return Err(Error::Timeout),
            Err(e) => return Err(Error::Transport(e.to_string())),
        }
        self.serial_port
            .flush()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(raw.len())
    }

    fn recv_frame(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut nread = 0;
        while nread < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.serial_port.set_timeout(remaining)?;
            match self.serial_port.read(&mut buf[nread..]) {
                Ok(0) => break,
                Ok(n) => nread += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(e.to_string())),
            }
        }
        Ok(nread)
    }
}
