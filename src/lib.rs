//! Firmware and bitstream loader for the Open Bench Logic Sniffer.
//!
//! The OLS carries two memories: the PIC program memory, reached through the
//! USB bootloader, and the SPI flash holding the FPGA bitstream, reached through
//! the serial interface of the running firmware.

pub mod bootloader;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod image;
pub mod protocol;
pub mod serial_flash;
pub mod transport;

pub use self::bootloader::Bootloader;
pub use self::device::FlashChip;
pub use self::error::{Error, Result};
pub use self::flashing::{FlashTarget, Flashing};
pub use self::format::{FileFormat, checksum};
pub use self::image::MemoryImage;
pub use self::protocol::{Command, Response};
pub use self::serial_flash::SerialFlash;
pub use self::transport::Transport;
