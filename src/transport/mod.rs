//! Abstract Device transport interface.
use std::time::Duration;

use crate::error::Result;

pub use self::serial::SerialTransport;
pub use self::usb::UsbTransport;

#[cfg(test)]
pub(crate) mod mock;
mod serial;
mod usb;

/// Abstraction of the transport layer.
/// Either the USB HID link of the bootloader or the serial link of the OLS.
pub trait Transport {
    /// Sends one frame, returning the number of bytes the device accepted.
    fn send_frame(&mut self, raw: &[u8], timeout: Duration) -> Result<usize>;

    /// Receives up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// A stream transport returns what arrived before the timeout, possibly 0.
    fn recv_frame(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Called when the device is expected to go away, e.g. after a reset.
    fn device_lost(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_frame(&mut self, raw: &[u8], timeout: Duration) -> Result<usize> {
        (**self).send_frame(raw, timeout)
    }

    fn recv_frame(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).recv_frame(buf, timeout)
    }

    fn device_lost(&mut self) {
        (**self).device_lost()
    }
}
