//! Simulated OLS devices speaking the wire protocols over the `Transport` trait.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use olsflash::Transport;
use olsflash::constants::boot::{FLASH_ADDR, FLASH_SIZE, FLASH_TOTAL_SIZE, FRAME_SIZE};
use olsflash::{Result, checksum};

/// PIC bootloader with a 16K program memory.
pub struct BootloaderSim {
    pub memory: Vec<u8>,
    pub version: [u8; 3],
    /// Half rows waiting for a flush
    pending: Vec<(usize, Vec<u8>)>,
    reply: Option<[u8; FRAME_SIZE]>,
    pub commands: Vec<u8>,
    pub erased: usize,
    pub reset: bool,
}

impl BootloaderSim {
    pub fn new() -> Self {
        BootloaderSim {
            memory: vec![0xff; FLASH_TOTAL_SIZE as usize],
            version: [2, 5, 0],
            pending: vec![],
            reply: None,
            commands: vec![],
            erased: 0,
            reset: false,
        }
    }

    /// Device writes at `address`, committed or not.
    pub fn writes_to(&self, address: usize) -> bool {
        self.memory[address] != 0xff || self.pending.iter().any(|(a, _)| *a == address)
    }
}

impl Transport for BootloaderSim {
    fn send_frame(&mut self, raw: &[u8], _timeout: Duration) -> Result<usize> {
        assert_eq!(raw.len(), FRAME_SIZE);
        let address = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        let size = raw[5] as usize;
        self.commands.push(raw[0]);

        let mut reply = [0u8; FRAME_SIZE];
        reply[..2].copy_from_slice(&raw[..2]);
        match raw[0] {
            0x00 => reply[2..5].copy_from_slice(&self.version),
            0x01 => reply[8..8 + size].copy_from_slice(&self.memory[address..address + size]),
            0x02 => {
                assert!(address >= FLASH_ADDR as usize, "write into the bootloader");
                self.pending.push((address, raw[8..8 + size].to_vec()));
                if raw[6] & 0x01 != 0 {
                    for (address, data) in self.pending.drain(..) {
                        self.memory[address..address + data.len()].copy_from_slice(&data);
                    }
                }
            }
            0x03 => {
                let region = FLASH_ADDR as usize..(FLASH_ADDR + FLASH_SIZE) as usize;
                self.memory[region].fill(0xff);
                self.erased += 1;
            }
            0xff => {
                self.reset = true;
                return Ok(raw.len());
            }
            op => panic!("unknown bootloader command {:02x}", op),
        }
        self.reply = Some(reply);
        Ok(raw.len())
    }

    fn recv_frame(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        match self.reply.take() {
            Some(reply) => {
                buf[..FRAME_SIZE].copy_from_slice(&reply);
                Ok(FRAME_SIZE)
            }
            None => Ok(0),
        }
    }
}

/// OLS controller in update mode with an SPI flash attached.
pub struct SerialFlashSim {
    pub jedec_id: [u8; 4],
    pub page_size: usize,
    pub pages: Vec<Vec<u8>>,
    pub selftest_status: u8,
    pub in_bootloader: bool,
    pub in_run_mode: bool,
    pub erases: usize,
    /// Page currently being received, with its address
    receiving: Option<usize>,
    input: Vec<u8>,
    output: VecDeque<u8>,
}

impl SerialFlashSim {
    pub fn new(jedec_id: [u8; 4], page_size: usize, page_count: usize) -> Self {
        SerialFlashSim {
            jedec_id,
            page_size,
            pages: vec![vec![0xff; page_size]; page_count],
            selftest_status: 0,
            in_bootloader: false,
            in_run_mode: false,
            erases: 0,
            receiving: None,
            input: vec![],
            output: VecDeque::new(),
        }
    }

    pub fn w25x40() -> Self {
        SerialFlashSim::new([0xef, 0x30, 0x13, 0x00], 256, 2048)
    }

    pub fn at45db041d() -> Self {
        SerialFlashSim::new([0x1f, 0x24, 0x00, 0x00], 264, 2048)
    }

    fn decode_page(&self, hi: u8, lo: u8) -> usize {
        if self.page_size == 264 {
            ((hi as usize) << 7) | (lo as usize >> 1)
        } else {
            ((hi as usize) << 8) | lo as usize
        }
    }

    fn process(&mut self) {
        loop {
            if let Some(page) = self.receiving {
                if self.input.len() < self.page_size + 1 {
                    return;
                }
                let data: Vec<u8> = self.input.drain(..=self.page_size).collect();
                self.receiving = None;
                if checksum(&data) == 0 {
                    self.pages[page].copy_from_slice(&data[..self.page_size]);
                    self.output.push_back(0x01);
                } else {
                    self.output.push_back(0x00);
                }
                continue;
            }
            if self.input.len() < 4 {
                return;
            }
            let cmd: Vec<u8> = self.input.drain(..4).collect();
            match cmd[..] {
                [0x24, 0x24, 0x24, 0x24] => self.in_bootloader = true,
                [0xff, 0xff, 0xff, 0xff] => self.in_run_mode = true,
                [0x00, ..] => self.output.extend(*b"H\x02F\x03\x01B\x02"),
                [0x01, ..] => self.output.extend(self.jedec_id),
                [0x02, hi, lo, _] => self.receiving = Some(self.decode_page(hi, lo)),
                [0x03, hi, lo, _] => {
                    let page = self.decode_page(hi, lo);
                    self.output.extend(self.pages[page].clone());
                }
                [0x04, ..] => {
                    for page in &mut self.pages {
                        page.fill(0xff);
                    }
                    self.erases += 1;
                    self.output.push_back(0x01);
                }
                [0x05, ..] => self.output.push_back(0x00),
                [0x07, ..] => self.output.push_back(self.selftest_status),
                _ => panic!("unknown OLS command {}", hex::encode(&cmd)),
            }
        }
    }
}

impl Transport for SerialFlashSim {
    fn send_frame(&mut self, raw: &[u8], _timeout: Duration) -> Result<usize> {
        self.input.extend_from_slice(raw);
        self.process();
        Ok(raw.len())
    }

    fn recv_frame(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let n = buf.len().min(self.output.len());
        for (dst, src) in buf.iter_mut().zip(self.output.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}
