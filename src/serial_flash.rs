//! Client of the OLS serial interface, programs the FPGA bitstream SPI flash.

use std::fmt;

use bitflags::bitflags;

use crate::constants::ols::{FRAME_TIMEOUT, POLL_RETRIES, POLL_TIMEOUT, STATUS_OK, commands};
use crate::device::{ChipDB, FlashChip};
use crate::error::{Error, Result};
use crate::format::checksum;
use crate::transport::{SerialTransport, Transport};

bitflags! {
    /// Failure bits of the self-test status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SelftestFailures: u8 {
        const SUPPLY_1V2 = 0x01;
        const SUPPLY_2V5 = 0x02;
        const PROG_B_PULLUP = 0x04;
        const DONE_PULLUP = 0x08;
        const UNKNOWN_ROM_ID = 0x10;
        const UPDATE_BUTTON_PULLUP = 0x20;
    }
}

const SELFTEST_CAUSES: [(SelftestFailures, &str); 6] = [
    (SelftestFailures::SUPPLY_1V2, "1V2 supply failed self-test"),
    (SelftestFailures::SUPPLY_2V5, "2V5 supply failed self-test"),
    (SelftestFailures::PROG_B_PULLUP, "PROG_B pull-up failed self-test"),
    (SelftestFailures::DONE_PULLUP, "DONE pull-up failed self-test"),
    (SelftestFailures::UNKNOWN_ROM_ID, "unknown ROM JEDEC ID (this could be ok)"),
    (SelftestFailures::UPDATE_BUTTON_PULLUP, "UPDATE button pull-up failed self-test"),
];

impl SelftestFailures {
    pub fn describe(self) -> Vec<&'static str> {
        SELFTEST_CAUSES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|&(_, cause)| cause)
            .collect()
    }
}

/// Identity frame of the OLS controller: `H<hw>F<major><minor>B<boot>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerId {
    pub hardware: u8,
    pub firmware: (u8, u8),
    pub bootloader: u8,
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HW: {}, FW: {}.{}, Boot: {}",
            self.hardware, self.firmware.0, self.firmware.1, self.bootloader
        )
    }
}

impl ControllerId {
    fn from_raw(raw: &[u8; 7]) -> Result<Self> {
        if raw[0] != b'H' || raw[2] != b'F' || raw[5] != b'B' {
            return Err(Error::Protocol(format!(
                "invalid OLS id {}",
                hex::encode(raw)
            )));
        }
        Ok(ControllerId {
            hardware: raw[1],
            firmware: (raw[3], raw[4]),
            bootloader: raw[6],
        })
    }
}

pub struct SerialFlash<T: Transport> {
    transport: T,
    chip: Option<FlashChip>,
    verbose: bool,
}

impl SerialFlash<SerialTransport> {
    /// Opens the port and identifies both the OLS and its flash chip.
    pub fn open(port: &str, baudrate: u32) -> Result<Self> {
        let transport = SerialTransport::open(port, baudrate)?;
        let mut ols = SerialFlash::new(transport);
        let id = ols.controller_id()?;
        log::info!("Found OLS {}", id);
        let chip = ols.identify_flash()?;
        log::info!("Found flash: {}", chip);
        Ok(ols)
    }
}

impl<T: Transport> SerialFlash<T> {
    /// Wraps a transport without talking to the device yet.
    pub fn new(transport: T) -> Self {
        SerialFlash {
            transport,
            chip: None,
            verbose: false,
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Flash chip identified by [`SerialFlash::identify_flash`]
    pub fn chip(&self) -> Result<&FlashChip> {
        self.chip.as_ref().ok_or(Error::NoFlash)
    }

    fn send(&mut self, raw: &[u8]) -> Result<usize> {
        log::trace!("=> {}", hex::encode(raw));
        self.transport.send_frame(raw, FRAME_TIMEOUT)
    }

    fn command(&mut self, cmd: [u8; 4]) -> Result<()> {
        let n = self.send(&cmd)?;
        if n != cmd.len() {
            return Err(Error::Protocol(format!(
                "command truncated, {} of {} bytes sent",
                n,
                cmd.len()
            )));
        }
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8], timeout: std::time::Duration) -> Result<()> {
        let n = self.transport.recv_frame(buf, timeout)?;
        log::trace!("<= {}", hex::encode(&buf[..n]));
        match n {
            0 => Err(Error::Timeout),
            n if n != buf.len() => Err(Error::ShortReply {
                expected: buf.len(),
                actual: n,
            }),
            _ => Ok(()),
        }
    }

    /// Polls for a single status byte, retrying only the read.
    fn poll_status(&mut self) -> Result<u8> {
        let mut status = [0u8; 1];
        for _ in 0..=POLL_RETRIES {
            if self.transport.recv_frame(&mut status, POLL_TIMEOUT)? == 1 {
                log::trace!("<= {:02x}", status[0]);
                return Ok(status[0]);
            }
        }
        Err(Error::Timeout)
    }

    pub fn controller_id(&mut self) -> Result<ControllerId> {
        self.command([commands::GET_ID, 0, 0, 0])?;
        let mut raw = [0u8; 7];
        self.recv_exact(&mut raw, FRAME_TIMEOUT)?;
        ControllerId::from_raw(&raw)
    }

    /// Reads the JEDEC ID and looks the chip up, the result is kept for page operations.
    pub fn identify_flash(&mut self) -> Result<&FlashChip> {
        self.command([commands::GET_FLASH_ID, 0, 0, 0])?;
        let mut id = [0u8; 4];
        self.recv_exact(&mut id, FRAME_TIMEOUT)?;

        if id[0] == b'H' && id[2] == b'F' {
            return Err(Error::Protocol(
                "OLS id was returned instead of the flash id".to_string(),
            ));
        }

        match ChipDB::find_chip(id)? {
            Some(chip) => Ok(self.chip.insert(chip)),
            None => {
                log::error!(
                    "Unknown flash type ({}), is the OLS in update mode?",
                    hex::encode(id)
                );
                Err(Error::UnknownFlash(id))
            }
        }
    }

    pub fn enter_bootloader(&mut self) -> Result<()> {
        self.command(commands::ENTER_BOOTLOADER)?;
        log::info!("OLS switched to bootloader mode");
        Ok(())
    }

    pub fn enter_run_mode(&mut self) -> Result<()> {
        self.command(commands::ENTER_RUN_MODE)?;
        log::info!("OLS switched to RUN mode");
        Ok(())
    }

    pub fn status(&mut self) -> Result<u8> {
        self.command([commands::STATUS, 0, 0, 0])?;
        let mut status = [0u8; 1];
        self.recv_exact(&mut status, POLL_TIMEOUT)?;
        log::info!("OLS status: {:02x}", status[0]);
        Ok(status[0])
    }

    pub fn run_selftest(&mut self) -> Result<()> {
        self.command([commands::SELFTEST, 0, 0, 0])?;
        log::info!("Running self-test ...");
        let status = self.poll_status()?;
        if status == 0 {
            log::info!("Passed self-test");
            return Ok(());
        }

        for cause in SelftestFailures::from_bits_retain(status).describe() {
            log::error!("{}", cause);
        }
        Err(Error::Selftest { status })
    }

    /// Bulk erase of the whole flash chip
    pub fn flash_erase(&mut self) -> Result<()> {
        self.chip()?;
        self.command([commands::ERASE, 0, 0, 0])?;
        log::info!("Chip erase ...");

        match self.poll_status() {
            Ok(STATUS_OK) => {
                log::info!("Chip erase done");
                Ok(())
            }
            Ok(status) => Err(Error::erase(Error::Protocol(format!(
                "bad erase reply 0x{:02x}",
                status
            )))),
            Err(e) => Err(Error::erase(e)),
        }
    }

    fn page_command(&self, opcode: u8, page: u16) -> Result<([u8; 4], usize)> {
        let chip = self.chip()?;
        if page >= chip.page_count {
            return Err(Error::Range {
                page,
                pages: chip.page_count,
            });
        }
        let [hi, lo] = chip.page_address(page);
        Ok(([opcode, hi, lo, 0], chip.page_size as usize))
    }

    /// Reads one page, `buf` has to hold exactly one page.
    pub fn flash_read(&mut self, page: u16, buf: &mut [u8]) -> Result<()> {
        let (cmd, page_size) = self.page_command(commands::PAGE_READ, page)?;
        check_page_buffer(buf.len(), page_size)?;
        if self.verbose {
            log::debug!("Page 0x{:04x} read", page);
        }

        self.command(cmd)?;
        self.recv_exact(buf, FRAME_TIMEOUT)
            .map_err(|e| Error::read(page as u32 * page_size as u32, e))
    }

    /// Programs one page, the controller checks the trailing checksum.
    pub fn flash_write(&mut self, page: u16, buf: &[u8]) -> Result<()> {
        let (cmd, page_size) = self.page_command(commands::PAGE_WRITE, page)?;
        check_page_buffer(buf.len(), page_size)?;
        let sum = checksum(buf);
        if self.verbose {
            log::debug!("Page 0x{:04x} write (0x{:02x} 0x{:02x})", page, cmd[1], cmd[2]);
        }

        let address = page as u32 * page_size as u32;
        let sent = self.send(&cmd)? + self.send(buf)? + self.send(&[sum])?;
        if sent != cmd.len() + page_size + 1 {
            return Err(Error::write(
                address,
                Error::Protocol(format!("page write truncated, {} bytes sent", sent)),
            ));
        }

        let mut status = [0u8; 1];
        self.recv_exact(&mut status, FRAME_TIMEOUT)
            .map_err(|e| Error::write(address, e))?;
        if status[0] != STATUS_OK {
            return Err(Error::PageChecksum {
                page,
                status: status[0],
            });
        }
        Ok(())
    }
}

fn check_page_buffer(len: usize, page_size: usize) -> Result<()> {
    if len != page_size {
        return Err(Error::Protocol(format!(
            "page buffer holds {} bytes, page size is {}",
            len, page_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockTransport, Reply};

    const AT45DB041D: [u8; 4] = [0x1f, 0x24, 0x00, 0x00];
    const W25X40: [u8; 4] = [0xef, 0x30, 0x13, 0x00];

    fn ols(replies: impl IntoIterator<Item = Reply>) -> SerialFlash<MockTransport> {
        SerialFlash::new(MockTransport::new(replies))
    }

    fn identified(jedec_id: [u8; 4], replies: Vec<Reply>) -> SerialFlash<MockTransport> {
        let mut all = vec![Reply::Bytes(jedec_id.to_vec())];
        all.extend(replies);
        let mut ols = ols(all);
        ols.identify_flash().unwrap();
        ols.transport.sent.clear();
        ols
    }

    #[test]
    fn controller_id_is_checked() {
        let mut o = ols([
            Reply::Bytes(b"H\x02F\x03\x01B\x02".to_vec()),
            Reply::Bytes(b"X\x02F\x03\x01B\x02".to_vec()),
            Reply::Bytes(b"H\x02F".to_vec()),
        ]);
        let id = o.controller_id().unwrap();
        assert_eq!(id.to_string(), "HW: 2, FW: 3.1, Boot: 2");
        assert_eq!(o.transport().sent[0], vec![0, 0, 0, 0]);
        assert!(matches!(o.controller_id(), Err(Error::Protocol(_))));
        assert!(matches!(o.controller_id(), Err(Error::ShortReply { expected: 7, actual: 3 })));
    }

    #[test]
    fn flash_id_lookup() {
        let mut o = ols([
            Reply::Bytes(W25X40.to_vec()),
            Reply::Bytes(vec![0x12, 0x34, 0x56, 0x78]),
            Reply::Bytes(b"H\x02F\x03".to_vec()),
        ]);
        assert_eq!(o.identify_flash().unwrap().name, "WINBOND W25X40");
        assert_eq!(o.transport().sent[0], vec![1, 0, 0, 0]);
        assert!(matches!(
            o.identify_flash(),
            Err(Error::UnknownFlash([0x12, 0x34, 0x56, 0x78]))
        ));
        assert!(matches!(o.identify_flash(), Err(Error::Protocol(_))));
    }

    #[test]
    fn page_operations_need_a_chip() {
        let mut o = ols([]);
        let mut buf = [0u8; 256];
        assert!(matches!(o.flash_read(0, &mut buf), Err(Error::NoFlash)));
        assert!(matches!(o.flash_erase(), Err(Error::NoFlash)));
        assert!(o.transport().sent.is_empty());
    }

    #[test]
    fn dataflash_read_uses_shifted_address() {
        let page = vec![0xa5; 264];
        let mut o = identified(AT45DB041D, vec![Reply::Bytes(page.clone())]);
        let mut buf = vec![0u8; 264];
        o.flash_read(1, &mut buf).unwrap();
        assert_eq!(o.transport().sent[0], vec![0x03, 0x00, 0x02, 0x00]);
        assert_eq!(buf, page);
    }

    #[test]
    fn short_page_read_fails() {
        let mut o = identified(W25X40, vec![Reply::Bytes(vec![0; 100])]);
        let mut buf = vec![0u8; 256];
        let err = o.flash_read(2, &mut buf).unwrap_err();
        assert!(matches!(err, Error::Read { address: 512, .. }));
        assert_eq!(o.transport().sent[0], vec![0x03, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn page_out_of_range() {
        let mut o = identified(W25X40, vec![]);
        let mut buf = vec![0u8; 256];
        assert!(matches!(
            o.flash_read(2048, &mut buf),
            Err(Error::Range { page: 2048, pages: 2048 })
        ));
        assert!(o.transport().sent.is_empty());
    }

    #[test]
    fn page_write_appends_checksum() {
        let mut o = identified(W25X40, vec![Reply::Bytes(vec![0x01])]);
        let data: Vec<u8> = (0..=255).collect();
        o.flash_write(0x0102, &data).unwrap();

        let sent = o.transport().sent_bytes();
        assert_eq!(&sent[..4], &[0x02, 0x01, 0x02, 0x00]);
        assert_eq!(&sent[4..260], &data[..]);
        assert_eq!(checksum(&sent[4..]), 0);
        assert_eq!(o.transport().sent.len(), 3);
    }

    #[test]
    fn page_write_checksum_error() {
        let mut o = identified(W25X40, vec![Reply::Bytes(vec![0x00]), Reply::Silence]);
        let data = vec![0u8; 256];
        assert!(matches!(
            o.flash_write(0, &data),
            Err(Error::PageChecksum { page: 0, status: 0 })
        ));
        assert!(matches!(o.flash_write(0, &data), Err(Error::Write { .. })));
    }

    #[test]
    fn truncated_page_write_is_detected() {
        let mut o = identified(W25X40, vec![Reply::Bytes(vec![0x01])]);
        o.transport.accept_limit = Some(100);
        let err = o.flash_write(0, &[0u8; 256]).unwrap_err();
        assert!(matches!(err, Error::Write { address: 0, .. }));
    }

    #[test]
    fn erase_polls_for_status() {
        let mut replies: Vec<Reply> = (0..5).map(|_| Reply::Silence).collect();
        replies.push(Reply::Bytes(vec![0x01]));
        replies.push(Reply::Bytes(vec![0x07]));
        let mut o = identified(W25X40, replies);

        o.flash_erase().unwrap();
        assert_eq!(o.transport().sent[0], vec![0x04, 0, 0, 0]);
        let err = o.flash_erase().unwrap_err();
        assert!(matches!(err, Error::Erase(ref inner) if matches!(**inner, Error::Protocol(_))));
    }

    #[test]
    fn erase_times_out() {
        let mut o = identified(W25X40, vec![]);
        let err = o.flash_erase().unwrap_err();
        assert!(matches!(err, Error::Erase(ref inner) if matches!(**inner, Error::Timeout)));
        // the command is sent once, only the status read is retried
        assert_eq!(o.transport().sent.len(), 1);
    }

    #[test]
    fn selftest_decodes_failures() {
        let mut o = ols([Reply::Silence, Reply::Bytes(vec![0x00]), Reply::Bytes(vec![0x12])]);
        o.run_selftest().unwrap();
        assert!(matches!(o.run_selftest(), Err(Error::Selftest { status: 0x12 })));

        let causes = SelftestFailures::from_bits_retain(0x12).describe();
        assert_eq!(causes.len(), 2);
        assert!(causes[0].starts_with("2V5"));
        assert!(causes[1].starts_with("unknown ROM"));
    }

    #[test]
    fn status_reads_one_byte() {
        let mut o = ols([Reply::Bytes(vec![0x5a]), Reply::Silence]);
        assert_eq!(o.status().unwrap(), 0x5a);
        assert_eq!(o.transport().sent, vec![vec![0x05, 0, 0, 0]]);
        assert!(matches!(o.status(), Err(Error::Timeout)));
    }

    #[test]
    fn mode_switch_commands() {
        let mut o = ols([]);
        o.enter_bootloader().unwrap();
        o.enter_run_mode().unwrap();
        assert_eq!(o.transport().sent, vec![vec![0x24; 4], vec![0xff; 4]]);
    }
}
