//! The underlying binary protocol of the OLS USB bootloader

use std::fmt;

use scroll::{BE, Pread, Pwrite};

use crate::constants::boot::{DATA_OFFSET, FRAME_SIZE, commands};
use crate::error::{Error, Result};

/// Bootloader Command, always sent as one `FRAME_SIZE` report.
///
/// Layout: opcode, echo, address (big endian), reserved, size, flush,
/// reserved, data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Command {
    /// Query bootloader version.
    GetFirmwareVersion,
    /// Read `len` bytes of program memory, `len` must be even.
    ReadFlash { address: u16, len: u8 },
    /// Program memory write.
    ///
    /// `flush` carries `WRITE_FLUSH` and `WRITE_2BYTE`; without the flush bit
    /// the bootloader only buffers the data.
    WriteFlash {
        address: u16,
        flush: u8,
        data: Vec<u8>,
    },
    /// Erase `size_x64` blocks starting at `address`.
    EraseFlash { address: u16, size_x64: u8 },
    /// Jump to the application, connection will be lost
    Reset,
}

impl Command {
    /// Read request, an odd `len` is rounded up as the bootloader reads words
    pub fn read_flash(address: u16, len: u8) -> Self {
        Command::ReadFlash {
            address,
            len: len + (len % 2),
        }
    }

    pub fn write_flash(address: u16, flush: u8, data: Vec<u8>) -> Self {
        Command::WriteFlash {
            address,
            flush,
            data,
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::GetFirmwareVersion => commands::GET_FW_VERSION,
            Command::ReadFlash { .. } => commands::READ_FLASH,
            Command::WriteFlash { .. } => commands::WRITE_FLASH,
            Command::EraseFlash { .. } => commands::ERASE_FLASH,
            Command::Reset => commands::RESET,
        }
    }

    pub fn into_raw(self, echo: u8) -> Result<[u8; FRAME_SIZE]> {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = self.opcode();
        buf[1] = echo;
        match self {
            Command::GetFirmwareVersion | Command::Reset => {}
            Command::ReadFlash { address, len } => {
                buf.pwrite_with(address, 2, BE)?;
                buf[5] = len;
            }
            Command::WriteFlash {
                address,
                flush,
                data,
            } => {
                if data.len() > FRAME_SIZE - DATA_OFFSET {
                    return Err(Error::Protocol(format!(
                        "{} bytes do not fit into a write command",
                        data.len()
                    )));
                }
                buf.pwrite_with(address, 2, BE)?;
                buf[5] = data.len() as u8;
                buf[6] = flush;
                buf[DATA_OFFSET..DATA_OFFSET + data.len()].copy_from_slice(&data);
            }
            Command::EraseFlash { address, size_x64 } => {
                buf.pwrite_with(address, 2, BE)?;
                buf[5] = size_x64;
            }
        }
        Ok(buf)
    }
}

/// Bootloader version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub sub_minor: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.sub_minor)
    }
}

/// Reply to a Command, same framing as the request.
#[derive(Clone, PartialEq, Eq)]
pub struct Response {
    raw: [u8; FRAME_SIZE],
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response({:02x}, echo {:02x})[{}]",
            self.command(),
            self.echo(),
            hex::encode(self.payload())
        )
    }
}

impl Response {
    pub fn command(&self) -> u8 {
        self.raw[0]
    }

    pub fn echo(&self) -> u8 {
        self.raw[1]
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[2..]
    }

    /// Data field of a read reply
    pub fn data(&self) -> &[u8] {
        &self.raw[DATA_OFFSET..]
    }

    pub fn version(&self) -> Result<Version> {
        Ok(Version {
            major: self.raw.pread(2)?,
            minor: self.raw.pread(3)?,
            sub_minor: self.raw.pread(4)?,
        })
    }

    pub(crate) fn from_raw(raw: &[u8]) -> Result<Self> {
        let raw: [u8; FRAME_SIZE] = raw.try_into().map_err(|_| Error::ShortReply {
            expected: FRAME_SIZE,
            actual: raw.len(),
        })?;
        Ok(Response { raw })
    }
}
