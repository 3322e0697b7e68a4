//! USB Transportation.
use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use super::Transport;
use crate::error::{Error, Result};

const INTERFACE: u8 = 0;
const ENDPOINT_IN: u8 = 0x81;

/// HID class request, host to device, interface recipient
const REQUEST_TYPE_HID_OUT: u8 = 0x21;
const HID_SET_REPORT: u8 = 0x09;

pub struct UsbTransport {
    device_handle: DeviceHandle<Context>,
    /// Kernel driver was detached on open and has to be given back
    reattach: bool,
}

impl UsbTransport {
    pub fn scan_devices(vid: u16, pid: u16) -> Result<usize> {
        let context = Context::new()?;

        let n = context
            .devices()?
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .map(|desc| desc.vendor_id() == vid && desc.product_id() == pid)
                    .unwrap_or(false)
            })
            .enumerate()
            .map(|(i, device)| {
                log::debug!("Found OLS bootloader #{}: [{:?}]", i, device);
            })
            .count();
        Ok(n)
    }

    /// Opens the first device matching `vid:pid` and claims its HID interface.
    pub fn open(vid: u16, pid: u16) -> Result<UsbTransport> {
        let context = Context::new()?;

        let device_handle = context
            .open_device_with_vid_pid(vid, pid)
            .ok_or(Error::DeviceNotFound { vid, pid })?;
        log::debug!("Found USB Device {:?}", device_handle.device());

        // Not supported on every platform, nothing to detach then
        let reattach = device_handle.kernel_driver_active(INTERFACE).unwrap_or(false);
        if reattach {
            log::debug!("Detaching kernel driver");
            device_handle.detach_kernel_driver(INTERFACE)?;
        }

        device_handle.claim_interface(INTERFACE)?;
        if let Err(e) = device_handle.set_alternate_setting(INTERFACE, 0) {
            log::warn!("Unable to set alternate setting: {}", e);
        }

        Ok(UsbTransport {
            device_handle,
            reattach,
        })
    }
}

impl Transport for UsbTransport {
    fn send_frame(&mut self, raw: &[u8], timeout: Duration) -> Result<usize> {
        let n = self.device_handle.write_control(
            REQUEST_TYPE_HID_OUT,
            HID_SET_REPORT,
            0x0000,
            INTERFACE as u16,
            raw,
            timeout,
        )?;
        Ok(n)
    }

    fn recv_frame(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self
            .device_handle
            .read_interrupt(ENDPOINT_IN, buf, timeout)?;
        Ok(n)
    }

    fn device_lost(&mut self) {
        self.reattach = false;
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.device_handle.release_interface(INTERFACE) {
            log::debug!("Unable to release interface: {}", e);
        }
        if self.reattach {
            if let Err(e) = self.device_handle.attach_kernel_driver(INTERFACE) {
                log::warn!("Unable to reattach kernel driver: {}", e);
            }
        }
    }
}
