//! SPI flash chip definitions, looked up by JEDEC ID
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Atmel DataFlash page size, these chips use a shifted page address
pub const DATAFLASH_PAGE_SIZE: u16 = 264;

/// Represents an SPI flash chip behind the OLS controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashChip {
    pub name: String,
    #[serde(with = "jedec_id")]
    pub jedec_id: [u8; 4],
    pub page_size: u16,
    pub page_count: u16,
}

impl ::std::fmt::Display for FlashChip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{}({}, {}x{} bytes)",
            self.name,
            hex::encode(self.jedec_id),
            self.page_count,
            self.page_size
        )
    }
}

impl FlashChip {
    /// Total size in bytes
    pub const fn size(&self) -> usize {
        self.page_size as usize * self.page_count as usize
    }

    /// Address bytes of `page` in a read/write command.
    ///
    /// DataFlash parts take the page number in the upper 15 bits, the rest
    /// take it as a plain 16-bit value.
    pub const fn page_address(&self, page: u16) -> [u8; 2] {
        if self.page_size == DATAFLASH_PAGE_SIZE {
            [(page >> 7) as u8, (page << 1) as u8]
        } else {
            [(page >> 8) as u8, page as u8]
        }
    }
}

pub struct ChipDB {
    chips: Vec<FlashChip>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            chips: serde_yaml::from_str(include_str!("../devices/flash_chips.yaml"))?,
        })
    }

    pub fn chips(&self) -> &[FlashChip] {
        &self.chips
    }

    pub fn find_chip(jedec_id: [u8; 4]) -> Result<Option<FlashChip>> {
        let db = ChipDB::load()?;
        let chip = db.chips.iter().find(|c| c.jedec_id == jedec_id).cloned();
        if let Some(chip) = &chip {
            log::debug!("Find flash chip: {}", chip);
        }
        Ok(chip)
    }
}

mod jedec_id {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(id: &[u8; 4], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(id))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 4], D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        let s = s.trim_start_matches("0x").trim_start_matches("0X");
        let mut id = [0u8; 4];
        hex::decode_to_slice(s, &mut id)
            .map_err(|e| D::Error::custom(format!("invalid JEDEC ID {:?}: {}", s, e)))?;
        Ok(id)
    }
}
