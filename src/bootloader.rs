//! Client of the OLS USB bootloader, reprograms the PIC program memory.

use crate::constants::boot::{
    DATA_OFFSET, ERASE_ADDR, ERASE_SIZE_X64, FLASH_ADDR, FLASH_SIZE, FRAME_SIZE, READ_SIZE,
    TIMEOUT, WRITE_2BYTE, WRITE_FLUSH,
};
use crate::error::{Error, Result};
use crate::image::ERASED;
use crate::protocol::{Command, Response, Version};
use crate::transport::{Transport, UsbTransport};

/// How the bootloader expects program data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// One 16-bit word per command, each flushed immediately
    TwoByte,
    /// 64-byte rows sent as two 32-byte halves, the second one commits the row
    Page64,
}

impl WriteMode {
    /// Bytes carried by one write command
    pub const fn chunk_size(self) -> usize {
        match self {
            WriteMode::TwoByte => 2,
            WriteMode::Page64 => 32,
        }
    }
}

/// Write mode of the shipped bootloader
pub const WRITE_MODE: WriteMode = WriteMode::Page64;

pub struct Bootloader<T: Transport> {
    transport: T,
    echo: u8,
    write_mode: WriteMode,
    attached: bool,
}

impl Bootloader<UsbTransport> {
    pub fn open(vid: u16, pid: u16) -> Result<Self> {
        let transport = UsbTransport::open(vid, pid)?;
        Ok(Bootloader::new(transport))
    }
}

impl<T: Transport> Bootloader<T> {
    pub fn new(transport: T) -> Self {
        Bootloader {
            transport,
            echo: 0,
            write_mode: WRITE_MODE,
            attached: true,
        }
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    /// False once the device was told to reset.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn next_echo(&mut self) -> u8 {
        let echo = self.echo;
        self.echo = self.echo.wrapping_add(1);
        echo
    }

    fn send(&mut self, cmd: Command) -> Result<u8> {
        let echo = self.next_echo();
        let req = cmd.into_raw(echo)?;
        log::trace!("=> {}", hex::encode(req));
        let n = self.transport.send_frame(&req, TIMEOUT)?;
        if n != FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "command frame truncated, {} of {} bytes sent",
                n, FRAME_SIZE
            )));
        }
        Ok(echo)
    }

    /// One request/reply exchange, the reply has to carry our echo byte.
    pub fn transfer(&mut self, cmd: Command) -> Result<Response> {
        let echo = self.send(cmd)?;

        let mut buf = [0u8; FRAME_SIZE];
        let n = self.transport.recv_frame(&mut buf, TIMEOUT)?;
        if n == 0 {
            return Err(Error::Timeout);
        }
        log::trace!("<= {}", hex::encode(&buf[..n]));
        let resp = Response::from_raw(&buf[..n])?;
        if resp.echo() != echo {
            return Err(Error::EchoMismatch {
                sent: echo,
                received: resp.echo(),
            });
        }
        Ok(resp)
    }

    pub fn version(&mut self) -> Result<Version> {
        let resp = self.transfer(Command::GetFirmwareVersion)?;
        let version = resp.version()?;
        log::info!("Bootloader version {}", version);
        Ok(version)
    }

    /// Reads `buf.len()` bytes of program memory starting at `address`.
    pub fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<()> {
        let mut address = address;
        for chunk in buf.chunks_mut(READ_SIZE) {
            let resp = self
                .transfer(Command::read_flash(address, chunk.len() as u8))
                .map_err(|e| Error::read(address as u32, e))?;
            chunk.copy_from_slice(&resp.data()[..chunk.len()]);
            address = address.wrapping_add(chunk.len() as u16);
        }
        Ok(())
    }

    /// Programs `data` at `address`, keeping clear of the bootloader.
    ///
    /// Chunks below the application region are skipped, a chunk reaching the
    /// end of the application region stops the whole write.
    pub fn write(&mut self, address: u16, data: &[u8]) -> Result<()> {
        let chunk_size = self.write_mode.chunk_size();
        let mut address = address as u32;
        let mut committed = true;

        for chunk in data.chunks(chunk_size) {
            let (flush, payload) = match self.write_mode {
                WriteMode::TwoByte => {
                    let mut payload = chunk.to_vec();
                    if payload.len() % 2 != 0 {
                        payload.push(ERASED);
                    }
                    (WRITE_2BYTE | WRITE_FLUSH, payload)
                }
                WriteMode::Page64 => {
                    committed = !committed;
                    let mut payload = vec![ERASED; chunk_size];
                    payload[..chunk.len()].copy_from_slice(chunk);
                    (if committed { WRITE_FLUSH } else { 0 }, payload)
                }
            };
            let len = payload.len() as u32;

            if address < FLASH_ADDR {
                log::warn!("Protecting bootloader - skip @0x{:04x}", address);
            } else if address + len >= FLASH_ADDR + FLASH_SIZE {
                log::warn!("Protecting bootloader - stop @0x{:04x}", address);
                return Ok(());
            } else {
                self.write_chunk(address, flush, payload)?;
            }
            address += len;
        }

        // Odd number of halves, the last row is still buffered in the device
        if !committed {
            let padding = vec![ERASED; chunk_size];
            if address >= FLASH_ADDR && address + (chunk_size as u32) < FLASH_ADDR + FLASH_SIZE {
                self.write_chunk(address, WRITE_FLUSH, padding)?;
            }
        }
        Ok(())
    }

    fn write_chunk(&mut self, address: u32, flush: u8, payload: Vec<u8>) -> Result<()> {
        debug_assert!(payload.len() <= FRAME_SIZE - DATA_OFFSET);
        self.transfer(Command::write_flash(address as u16, flush, payload))
            .map_err(|e| Error::write(address, e))?;
        Ok(())
    }

    /// Erases the application region, the bootloader knows its own extent.
    pub fn erase(&mut self) -> Result<()> {
        self.transfer(Command::EraseFlash {
            address: ERASE_ADDR,
            size_x64: ERASE_SIZE_X64,
        })
        .map_err(Error::erase)?;
        log::info!("Program memory erased");
        Ok(())
    }

    /// Starts the application. The device re-enumerates, no reply is awaited.
    pub fn reset(&mut self) -> Result<()> {
        self.send(Command::Reset)?;
        self.attached = false;
        self.transport.device_lost();
        log::info!("Device reset");
        Ok(())
    }
}
