//! Flashing logic shared by both OLS targets.

use std::ops::Range;
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};

use crate::bootloader::Bootloader;
use crate::constants::boot::{FLASH_ADDR, FLASH_SIZE, FLASH_TOTAL_SIZE};
use crate::error::{Error, Result};
use crate::format::FileFormat;
use crate::image::{ERASED, MemoryImage};
use crate::serial_flash::SerialFlash;
use crate::transport::Transport;

/// Pages between two progress bar updates
pub const PROGRESS_INTERVAL: usize = 32;

/// Program memory row of the PIC, unit of bootloader reads and writes
pub const BOOT_PAGE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total addressable bytes
    pub capacity: usize,
    pub page_size: usize,
}

/// Page-wise access to a device memory.
///
/// Implementations map pages onto their own addressing and framing, while
/// [`Flashing`] does the chunking, progress and verification.
pub trait FlashTarget {
    fn geometry(&self) -> Result<Geometry>;

    /// Range covered by a full read-out
    fn dump_range(&self, page_limit: Option<usize>) -> Result<Range<usize>>;

    /// Range written and verified for an image whose used size is `len`
    fn program_range(&self, len: usize, page_limit: Option<usize>) -> Result<Range<usize>>;

    fn erase(&mut self) -> Result<()>;

    /// Reads at most one page starting at the page aligned `address`
    fn read_page(&mut self, address: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes at most one page starting at the page aligned `address`
    fn write_page(&mut self, address: usize, data: &[u8]) -> Result<()>;

    /// Returns the device to normal operation
    fn reset(&mut self) -> Result<()>;
}

fn boot_address(address: usize, len: usize) -> Result<u16> {
    u16::try_from(address)
        .ok()
        .filter(|_| address + len <= FLASH_TOTAL_SIZE as usize)
        .ok_or(Error::Capacity {
            address: address as u32,
            len,
            capacity: FLASH_TOTAL_SIZE as usize,
        })
}

impl<T: Transport> FlashTarget for Bootloader<T> {
    fn geometry(&self) -> Result<Geometry> {
        Ok(Geometry {
            capacity: FLASH_TOTAL_SIZE as usize,
            page_size: BOOT_PAGE_SIZE,
        })
    }

    /// The whole program memory, bootloader included
    fn dump_range(&self, page_limit: Option<usize>) -> Result<Range<usize>> {
        if page_limit.is_some() {
            log::debug!("Page limit ignored for the bootloader");
        }
        Ok(0..FLASH_TOTAL_SIZE as usize)
    }

    /// Only the application region
    fn program_range(&self, len: usize, _page_limit: Option<usize>) -> Result<Range<usize>> {
        let start = FLASH_ADDR as usize;
        let size = len.saturating_sub(start).min(FLASH_SIZE as usize);
        Ok(start..start + size)
    }

    fn erase(&mut self) -> Result<()> {
        Bootloader::erase(self)
    }

    fn read_page(&mut self, address: usize, buf: &mut [u8]) -> Result<()> {
        let address = boot_address(address, buf.len())?;
        self.read(address, buf)
    }

    fn write_page(&mut self, address: usize, data: &[u8]) -> Result<()> {
        let address = boot_address(address, data.len())?;
        self.write(address, data)
    }

    fn reset(&mut self) -> Result<()> {
        Bootloader::reset(self)
    }
}

impl<T: Transport> SerialFlash<T> {
    fn page_index(&self, address: usize) -> Result<u16> {
        let chip = self.chip()?;
        let page = address / chip.page_size as usize;
        u16::try_from(page)
            .ok()
            .filter(|&p| p < chip.page_count)
            .ok_or(Error::Range {
                page: page.min(u16::MAX as usize) as u16,
                pages: chip.page_count,
            })
    }

    /// A page limit of 0 means no limit
    fn pages(&self, page_limit: Option<usize>) -> Result<usize> {
        let chip = self.chip()?;
        let total = chip.page_count as usize;
        Ok(page_limit.filter(|&n| n != 0).unwrap_or(total).min(total))
    }
}

impl<T: Transport> FlashTarget for SerialFlash<T> {
    fn geometry(&self) -> Result<Geometry> {
        let chip = self.chip()?;
        Ok(Geometry {
            capacity: chip.size(),
            page_size: chip.page_size as usize,
        })
    }

    fn dump_range(&self, page_limit: Option<usize>) -> Result<Range<usize>> {
        let page_size = self.chip()?.page_size as usize;
        Ok(0..self.pages(page_limit)? * page_size)
    }

    fn program_range(&self, len: usize, page_limit: Option<usize>) -> Result<Range<usize>> {
        let page_size = self.chip()?.page_size as usize;
        let pages = page_limit
            .filter(|&n| n != 0)
            .unwrap_or(len.div_ceil(page_size))
            .min(self.pages(None)?);
        Ok(0..pages * page_size)
    }

    fn erase(&mut self) -> Result<()> {
        self.flash_erase()
    }

    fn read_page(&mut self, address: usize, buf: &mut [u8]) -> Result<()> {
        let page = self.page_index(address)?;
        let page_size = self.chip()?.page_size as usize;
        if buf.len() == page_size {
            return self.flash_read(page, buf);
        }
        let mut full = vec![ERASED; page_size];
        self.flash_read(page, &mut full)?;
        let n = buf.len().min(page_size);
        buf[..n].copy_from_slice(&full[..n]);
        Ok(())
    }

    fn write_page(&mut self, address: usize, data: &[u8]) -> Result<()> {
        let page = self.page_index(address)?;
        let page_size = self.chip()?.page_size as usize;
        if data.len() == page_size {
            return self.flash_write(page, data);
        }
        let mut full = vec![ERASED; page_size];
        let n = data.len().min(page_size);
        full[..n].copy_from_slice(&data[..n]);
        self.flash_write(page, &full)
    }

    fn reset(&mut self) -> Result<()> {
        self.enter_run_mode()
    }
}

/// A byte that differs between the image and the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub address: usize,
    pub expected: u8,
    pub actual: u8,
}

/// Byte-wise comparison, `offset` is the address of the first byte.
pub fn compare(expected: &[u8], actual: &[u8], offset: usize) -> Vec<Mismatch> {
    expected
        .iter()
        .zip(actual)
        .enumerate()
        .filter(|(_, (e, a))| e != a)
        .map(|(i, (&expected, &actual))| Mismatch {
            address: offset + i,
            expected,
            actual,
        })
        .collect()
}

pub struct Flashing<T: FlashTarget> {
    target: T,
    geometry: Geometry,
    verbose: bool,
}

impl<T: FlashTarget> Flashing<T> {
    pub fn new(target: T) -> Result<Self> {
        let geometry = target.geometry()?;
        Ok(Flashing {
            target,
            geometry,
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }

    /// A working image as large as the device
    pub fn new_image(&self) -> MemoryImage {
        MemoryImage::new(self.geometry.capacity)
    }

    /// Decodes an image file, refusing files without any data.
    pub fn load_image<P: AsRef<Path>>(&self, format: FileFormat, path: P) -> Result<MemoryImage> {
        let mut image = self.new_image();
        let size = format.read_file(path, &mut image)?;
        if size == 0 {
            return Err(Error::EmptyImage);
        }
        log::info!("Image size: {} bytes", size);
        Ok(image)
    }

    fn progress(&self, range: &Range<usize>) -> ProgressBar {
        let pages = range.len().div_ceil(self.geometry.page_size);
        let style = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} pages")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        ProgressBar::new(pages as u64).with_style(style)
    }

    fn read_range(&mut self, range: Range<usize>, image: &mut MemoryImage) -> Result<()> {
        let pb = self.progress(&range).with_message("Reading");
        let page_size = self.geometry.page_size;
        for (i, start) in range.clone().step_by(page_size).enumerate() {
            let end = (start + page_size).min(range.end);
            self.target.read_page(start, image.region_mut(start..end)?)?;
            if i % PROGRESS_INTERVAL == 0 {
                pb.set_position(i as u64);
            }
        }
        pb.finish_and_clear();
        Ok(())
    }

    /// Reads the device into an erased image.
    pub fn read(&mut self, page_limit: Option<usize>) -> Result<MemoryImage> {
        let range = self.target.dump_range(page_limit)?;
        log::info!("Reading flash (0x{:04x} - 0x{:04x})", range.start, range.end);
        let mut image = self.new_image();
        self.read_range(range, &mut image)?;
        Ok(image)
    }

    pub fn erase(&mut self) -> Result<()> {
        log::info!("Erasing flash ...");
        self.target.erase()
    }

    /// Erases the device and programs the used part of `image`.
    pub fn write(&mut self, image: &MemoryImage, page_limit: Option<usize>) -> Result<()> {
        if image.is_empty() {
            return Err(Error::EmptyImage);
        }
        let range = self.target.program_range(image.len(), page_limit)?;

        self.erase()?;

        log::info!(
            "Writing flash (0x{:04x} - 0x{:04x}), {} pages",
            range.start,
            range.end,
            range.len().div_ceil(self.geometry.page_size)
        );
        let pb = self.progress(&range).with_message("Writing");
        let page_size = self.geometry.page_size;
        for (i, start) in range.clone().step_by(page_size).enumerate() {
            let end = (start + page_size).min(range.end);
            self.target.write_page(start, &image.as_slice()[start..end])?;
            if i % PROGRESS_INTERVAL == 0 {
                pb.set_position(i as u64);
            }
        }
        pb.finish_and_clear();
        Ok(())
    }

    /// Reads back the programmed range and compares it with `expected`.
    pub fn verify(&mut self, expected: &MemoryImage, page_limit: Option<usize>) -> Result<()> {
        if expected.is_empty() {
            return Err(Error::EmptyImage);
        }
        let range = self.target.program_range(expected.len(), page_limit)?;
        log::info!("Checking flash (0x{:04x} - 0x{:04x})", range.start, range.end);

        let mut actual = self.new_image();
        self.read_range(range.clone(), &mut actual)?;

        let mismatches = compare(
            &expected.as_slice()[range.clone()],
            &actual.as_slice()[range.clone()],
            range.start,
        );
        if mismatches.is_empty() {
            log::info!("Verify OK");
            return Ok(());
        }

        if self.verbose {
            for m in &mismatches {
                log::warn!(
                    "Diff @0x{:04x} (is 0x{:02x} should be 0x{:02x})",
                    m.address,
                    m.actual,
                    m.expected
                );
            }
            dump_row(expected, &actual, mismatches[0].address);
        }
        Err(Error::Verify {
            mismatches: mismatches.len(),
        })
    }

    pub fn reset(&mut self) -> Result<()> {
        self.target.reset()
    }
}

/// Hex dump of the 16-byte row around `address` from both images
fn dump_row(expected: &MemoryImage, actual: &MemoryImage, address: usize) {
    let start = address & !0xf;
    let end = (start + 16).min(expected.capacity());
    for (label, image) in [("expected", expected), ("actual", actual)] {
        let mut out = Vec::new();
        if hxdmp::hexdump(&image.as_slice()[start..end], &mut out).is_ok() {
            log::debug!(
                "{} @0x{:04x}: {}",
                label,
                start,
                String::from_utf8_lossy(&out).trim_end()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::boot::FRAME_SIZE;
    use crate::transport::mock::{MockTransport, Reply};

    #[test]
    fn compare_reports_each_difference() {
        let mismatches = compare(&[1, 2, 3, 4], &[1, 9, 3, 8], 0x800);
        assert_eq!(
            mismatches,
            vec![
                Mismatch {
                    address: 0x801,
                    expected: 2,
                    actual: 9
                },
                Mismatch {
                    address: 0x803,
                    expected: 4,
                    actual: 8
                },
            ]
        );
    }

    #[test]
    fn bootloader_program_range_is_application_only() {
        let boot = Bootloader::new(MockTransport::default());
        assert_eq!(boot.program_range(0x0100, None).unwrap(), 0x800..0x800);
        assert_eq!(boot.program_range(0x0a00, None).unwrap(), 0x800..0xa00);
        assert_eq!(boot.program_range(0x4000, Some(2)).unwrap(), 0x800..0x3c00);
        assert_eq!(boot.dump_range(Some(1)).unwrap(), 0..0x4000);
    }

    #[test]
    fn serial_ranges_follow_pages() {
        let mut ols = SerialFlash::new(MockTransport::new([Reply::Bytes(vec![
            0xef, 0x30, 0x12, 0x00,
        ])]));
        ols.identify_flash().unwrap();

        assert_eq!(ols.program_range(1, None).unwrap(), 0..256);
        assert_eq!(ols.program_range(257, None).unwrap(), 0..512);
        assert_eq!(ols.program_range(257, Some(5)).unwrap(), 0..5 * 256);
        assert_eq!(ols.program_range(10_000_000, None).unwrap(), 0..1024 * 256);
        assert_eq!(ols.dump_range(None).unwrap(), 0..1024 * 256);
        assert_eq!(ols.dump_range(Some(3)).unwrap(), 0..768);
    }

    #[test]
    fn zero_page_limit_means_whole_chip() {
        let mut ols = SerialFlash::new(MockTransport::new([Reply::Bytes(vec![
            0xef, 0x30, 0x12, 0x00,
        ])]));
        ols.identify_flash().unwrap();

        assert_eq!(ols.program_range(257, Some(0)).unwrap(), 0..512);
        assert_eq!(ols.dump_range(Some(0)).unwrap(), 0..1024 * 256);
    }

    #[test]
    fn bootloader_read_fills_whole_memory() {
        let replies = (0..FLASH_TOTAL_SIZE as usize / BOOT_PAGE_SIZE * 2).map(|_| {
            let mut frame = vec![0x3c; FRAME_SIZE];
            frame[..2].fill(0);
            Reply::Echo(frame)
        });
        let boot = Bootloader::new(MockTransport::new(replies));
        let mut flashing = Flashing::new(boot).unwrap();
        let image = flashing.read(None).unwrap();
        assert_eq!(image.len(), 0x4000);
        assert!(image.used().iter().all(|&b| b == 0x3c));
    }

    #[test]
    fn unidentified_serial_target_is_rejected() {
        let ols = SerialFlash::new(MockTransport::default());
        assert!(matches!(Flashing::new(ols), Err(Error::NoFlash)));
    }
}
