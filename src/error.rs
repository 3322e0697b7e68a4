//! Error types shared by the codecs, protocol clients and the orchestrator.

use thiserror::Error;

/// Everything that can go wrong while talking to an OLS or handling its images
#[derive(Debug, Error)]
pub enum Error {
    /// Line does not look like an Intel HEX record
    #[error("line {line}: {reason}")]
    Format { line: usize, reason: String },

    /// Record checksum does not match its contents
    #[error("line {line}: checksum mismatch (record says 0x{found:02X}, computed 0x{expected:02X})")]
    Checksum { line: usize, expected: u8, found: u8 },

    #[error("line {line}: unknown record type 0x{record_type:02X}")]
    UnknownRecordType { line: usize, record_type: u8 },

    /// Data would land outside the memory image
    #[error("{len} bytes at 0x{address:08x} do not fit into a {capacity} byte image")]
    Capacity {
        address: u32,
        len: usize,
        capacity: usize,
    },

    #[error("file is {size} bytes, image only holds {capacity}")]
    Size { size: usize, capacity: usize },

    #[error("page {page} out of range, flash has {pages} pages")]
    Range { page: u16, pages: u16 },

    #[error("communication timeout")]
    Timeout,

    #[error("device disconnected")]
    DeviceDisconnected,

    #[error("transport error: {0}")]
    Transport(String),

    /// Reply belongs to another request
    #[error("echo mismatch: sent 0x{sent:02x}, device answered 0x{received:02x}")]
    EchoMismatch { sent: u8, received: u8 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("short reply: expected {expected} bytes, got {actual}")]
    ShortReply { expected: usize, actual: usize },

    #[error("unknown flash chip (JEDEC ID {})", hex::encode(.0))]
    UnknownFlash([u8; 4]),

    #[error("no flash chip identified")]
    NoFlash,

    #[error("no device {vid:04x}:{pid:04x} found")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("self-test failed (status 0x{status:02x})")]
    Selftest { status: u8 },

    #[error("reading memory at 0x{address:04x} failed")]
    Read {
        address: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("writing memory at 0x{address:04x} failed")]
    Write {
        address: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("erasing flash failed")]
    Erase(#[source] Box<Error>),

    /// The controller rejected a page write
    #[error("device reported checksum error for page {page} (status 0x{status:02x})")]
    PageChecksum { page: u16, status: u8 },

    #[error("no data decoded from image file")]
    EmptyImage,

    #[error("verification failed at {mismatches} byte(s)")]
    Verify { mismatches: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("flash chip database: {0}")]
    ChipDatabase(#[from] serde_yaml::Error),

    #[error("cannot encode hex record: {0}")]
    HexEncode(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn read(address: u32, source: Error) -> Self {
        Error::Read {
            address,
            source: Box::new(source),
        }
    }

    pub(crate) fn write(address: u32, source: Error) -> Self {
        Error::Write {
            address,
            source: Box::new(source),
        }
    }

    pub(crate) fn erase(source: Error) -> Self {
        Error::Erase(Box::new(source))
    }
}

impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => Error::Timeout,
            rusb::Error::NoDevice => Error::DeviceDisconnected,
            rusb::Error::Pipe => Error::Transport("endpoint stalled, not an OLS?".to_string()),
            other => Error::Transport(other.to_string()),
        }
    }
}

impl From<scroll::Error> for Error {
    fn from(e: scroll::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
