//! Protocol constants of the OLS bootloader and the OLS flash interface.

/// Default USB IDs of the PIC bootloader
pub const OLS_VID: u16 = 0x04d8;
pub const OLS_PID: u16 = 0xfc90;

/// Default baud rate of the OLS serial interface
pub const OLS_BAUD: u32 = 921_600;

pub mod boot {
    use std::time::Duration;

    /// Both command and reply frames are one full HID report
    pub const FRAME_SIZE: usize = 64;
    /// Offset of the data field inside command and reply frames
    pub const DATA_OFFSET: usize = 8;
    /// Payload capacity of a read reply
    pub const READ_SIZE: usize = FRAME_SIZE - DATA_OFFSET;

    pub const TIMEOUT: Duration = Duration::from_millis(1000);

    /// Start of the application region, everything below is the bootloader
    pub const FLASH_ADDR: u32 = 0x0800;
    /// Size of the application region, 16K - 3K
    pub const FLASH_SIZE: u32 = 0x3400;
    /// Size of the whole program memory
    pub const FLASH_TOTAL_SIZE: u32 = 0x4000;

    /// Erase request as hard-coded in the bootloader
    pub const ERASE_ADDR: u16 = 0x0800;
    pub const ERASE_SIZE_X64: u8 = 0x0d;

    pub const WRITE_FLUSH: u8 = 0x01;
    pub const WRITE_2BYTE: u8 = 0x02;

    pub mod commands {
        pub const GET_FW_VERSION: u8 = 0x00;
        pub const READ_FLASH: u8 = 0x01;
        pub const WRITE_FLASH: u8 = 0x02;
        pub const ERASE_FLASH: u8 = 0x03;
        pub const RESET: u8 = 0xff;
    }
}

pub mod ols {
    use std::time::Duration;

    pub const FRAME_TIMEOUT: Duration = Duration::from_millis(1000);
    /// Per-read timeout while polling for a status byte
    pub const POLL_TIMEOUT: Duration = Duration::from_millis(330);
    /// Poll retries, about 20 seconds together with `POLL_TIMEOUT`
    pub const POLL_RETRIES: u32 = 60;

    pub const STATUS_OK: u8 = 0x01;

    pub mod commands {
        pub const GET_ID: u8 = 0x00;
        pub const GET_FLASH_ID: u8 = 0x01;
        pub const PAGE_WRITE: u8 = 0x02;
        pub const PAGE_READ: u8 = 0x03;
        pub const ERASE: u8 = 0x04;
        pub const STATUS: u8 = 0x05;
        pub const SELFTEST: u8 = 0x07;
        pub const ENTER_BOOTLOADER: [u8; 4] = [0x24; 4];
        pub const ENTER_RUN_MODE: [u8; 4] = [0xff; 4];
    }
}
