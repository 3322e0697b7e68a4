//! Flat memory image shared by the file codecs and the flash targets.

use std::ops::Range;

use crate::error::{Error, Result};

/// Value of an erased flash byte
pub const ERASED: u8 = 0xff;

/// A fixed-capacity byte buffer with a high-water mark of written addresses.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryImage {
    data: Vec<u8>,
    max_written: Option<u32>,
}

impl MemoryImage {
    /// Allocates an image in erased state.
    pub fn new(capacity: usize) -> Self {
        MemoryImage {
            data: vec![ERASED; capacity],
            max_written: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes up to and including the highest written address.
    pub fn len(&self) -> usize {
        self.max_written.map_or(0, |addr| addr as usize + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.max_written.is_none()
    }

    /// Copies `bytes` to `address`, failing before any mutation if they do not fit.
    pub fn write(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        let start = address as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::Capacity {
                address,
                len: bytes.len(),
                capacity: self.data.len(),
            })?;
        self.data[start..end].copy_from_slice(bytes);
        if !bytes.is_empty() {
            self.mark_written(end as u32 - 1);
        }
        Ok(())
    }

    /// Raises the watermark to `address` if it is higher.
    pub fn mark_written(&mut self, address: u32) {
        self.max_written = Some(self.max_written.map_or(address, |max| max.max(address)));
    }

    /// Mutable access to a region which the caller fills, e.g. from the device.
    pub fn region_mut(&mut self, range: Range<usize>) -> Result<&mut [u8]> {
        if range.end > self.data.len() || range.start > range.end {
            return Err(Error::Capacity {
                address: range.start as u32,
                len: range.end.saturating_sub(range.start),
                capacity: self.data.len(),
            });
        }
        if range.end > range.start {
            self.mark_written(range.end as u32 - 1);
        }
        Ok(&mut self.data[range])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The written part of the image, `0..len()`.
    pub fn used(&self) -> &[u8] {
        &self.data[..self.len()]
    }
}

impl std::fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImage")
            .field("capacity", &self.data.len())
            .field("len", &self.len())
            .finish()
    }
}
