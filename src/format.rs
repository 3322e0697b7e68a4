//! Image file formats: flat binary and Intel HEX
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use ihex::Record;

use crate::error::{Error, Result};
use crate::image::MemoryImage;

/// Longest data record emitted by [`write_ihex`]
pub const HEX_RECORD_SIZE: usize = 16;

pub mod record_type {
    pub const DATA: u8 = 0x00;
    pub const END_OF_FILE: u8 = 0x01;
    pub const EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum FileFormat {
    /// Raw bytes, file offset = address
    #[value(alias = "BIN")]
    Bin,
    /// Intel HEX
    #[value(alias = "HEX")]
    Hex,
}

impl FileFormat {
    /// Picks a format from the file extension, Intel HEX unless it looks binary.
    pub fn guess(path: &Path) -> FileFormat {
        let ext = path
            .extension()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
            .to_lowercase();
        if ["bin", "bit", "raw"].contains(&&*ext) {
            FileFormat::Bin
        } else {
            FileFormat::Hex
        }
    }

    /// Decodes `path` into `image`, returning the used image size.
    pub fn read_file<P: AsRef<Path>>(self, path: P, image: &mut MemoryImage) -> Result<usize> {
        let p = path.as_ref();
        log::info!("Reading {} as {:?}", p.display(), self);
        let file = File::open(p)?;
        match self {
            FileFormat::Bin => read_binary(file, image),
            FileFormat::Hex => read_ihex(BufReader::new(file), image),
        }
    }

    pub fn write_file<P: AsRef<Path>>(self, path: P, data: &[u8]) -> Result<()> {
        let p = path.as_ref();
        log::info!("Writing {} bytes to {} as {:?}", data.len(), p.display(), self);
        let mut writer = BufWriter::new(File::create(p)?);
        match self {
            FileFormat::Bin => write_binary(&mut writer, data)?,
            FileFormat::Hex => write_ihex(&mut writer, data)?,
        }
        writer.flush()?;
        Ok(())
    }
}

/// Two's complement of the byte sum, as used by Intel HEX and the OLS page writes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_sub(b))
}

pub fn read_binary<R: Read>(mut reader: R, image: &mut MemoryImage) -> Result<usize> {
    let mut raw = Vec::with_capacity(image.capacity());
    reader.read_to_end(&mut raw)?;
    if raw.len() > image.capacity() {
        return Err(Error::Size {
            size: raw.len(),
            capacity: image.capacity(),
        });
    }
    image.write(0, &raw)?;
    Ok(raw.len())
}

pub fn write_binary<W: Write>(mut writer: W, data: &[u8]) -> Result<()> {
    writer.write_all(data)?;
    Ok(())
}

/// One decoded line of an Intel HEX stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub address: u16,
    pub record_type: u8,
    pub payload: Vec<u8>,
}

impl HexRecord {
    /// Parses and checksums a single record, `line` is only used for error reports.
    pub fn parse(text: &str, line: usize) -> Result<HexRecord> {
        let digits = text.strip_prefix(':').ok_or_else(|| Error::Format {
            line,
            reason: "missing ':' start code".to_string(),
        })?;
        let raw = hex::decode(digits).map_err(|e| Error::Format {
            line,
            reason: format!("invalid hex digits ({})", e),
        })?;
        // count, address hi/lo, type, checksum
        if raw.len() < 5 {
            return Err(Error::Format {
                line,
                reason: "record too short".to_string(),
            });
        }
        let byte_count = raw[0] as usize;
        if raw.len() != byte_count + 5 {
            return Err(Error::Format {
                line,
                reason: format!(
                    "byte count 0x{:02X} does not match record length",
                    byte_count
                ),
            });
        }

        let (body, found) = raw.split_at(raw.len() - 1);
        let expected = checksum(body);
        if expected != found[0] {
            return Err(Error::Checksum {
                line,
                expected,
                found: found[0],
            });
        }

        Ok(HexRecord {
            address: u16::from_be_bytes([raw[1], raw[2]]),
            record_type: raw[3],
            payload: body[4..].to_vec(),
        })
    }
}

/// Decodes an Intel HEX stream into `image`, returning the used image size.
pub fn read_ihex<R: BufRead>(reader: R, image: &mut MemoryImage) -> Result<usize> {
    let mut base_address = 0u32;

    for (idx, text) in reader.lines().enumerate() {
        let text = text?;
        let line = idx + 1;
        let text = text.trim_end();
        if text.is_empty() {
            continue;
        }

        let record = HexRecord::parse(text, line)?;
        match record.record_type {
            record_type::DATA => {
                let address = base_address | record.address as u32;
                image.write(address, &record.payload)?;
            }
            record_type::EXTENDED_LINEAR_ADDRESS => {
                if record.payload.len() != 2 {
                    return Err(Error::Format {
                        line,
                        reason: "extended linear address record must carry 2 bytes".to_string(),
                    });
                }
                base_address = (u16::from_be_bytes([record.payload[0], record.payload[1]]) as u32) << 16;
                log::trace!("line {}: base address 0x{:08x}", line, base_address);
            }
            record_type::END_OF_FILE => break,
            other => {
                return Err(Error::UnknownRecordType {
                    line,
                    record_type: other,
                });
            }
        }
    }

    Ok(image.len())
}

/// Encodes `data`, starting at address 0, as an Intel HEX stream.
pub fn write_ihex<W: Write>(mut writer: W, data: &[u8]) -> Result<()> {
    let mut upper = 0u16;
    let mut address = 0u32;

    write_record(&mut writer, Record::ExtendedLinearAddress(upper))?;
    for chunk in data.chunks(HEX_RECORD_SIZE) {
        write_record(
            &mut writer,
            Record::Data {
                offset: address as u16,
                value: chunk.to_vec(),
            },
        )?;
        address += chunk.len() as u32;

        if address & 0x1_0000 != 0 {
            upper = upper.wrapping_add(1);
            address -= 0x1_0000;
            write_record(&mut writer, Record::ExtendedLinearAddress(upper))?;
        }
    }
    write_record(&mut writer, Record::EndOfFile)
}

fn write_record<W: Write>(writer: &mut W, record: Record) -> Result<()> {
    let line = record
        .to_record_string()
        .map_err(|e| Error::HexEncode(format!("{:?}", e)))?;
    writeln!(writer, "{}", line)?;
    Ok(())
}
