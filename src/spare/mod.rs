//! This module describes the spare ("out-of-band") area following each page, as laid out by the
//! three generations of flash controller:
//!
//! ```text
//!  byte:  0     1     2     3     4     5     6     7     8     9    10-11   12    13-15
//!        +-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+------+
//! meta 0 | LBA | LBA | SEQ | SEQ | SEQ | BAD | SEQ | SZ  | SZ  | PGS |  -  | TYP | ECC  |
//! meta 1 | SEQ | LBA | LBA | SEQ | SEQ | BAD | SEQ | SZ  | SZ  | PGS |  -  | TYP | ECC  |
//! meta 2 | BAD | LBA | LBA | SEQ | SEQ | SEQ |  -  | SZ  | SZ  | PGS |  -  | TYP | ECC  |
//!        +-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+-----+------+
//! ```
//!
//! The logical block address is 12 bits: a low byte followed by a byte whose low nibble holds the
//! upper bits. Byte 12 is shared between the 6-bit filesystem block type and the top 2 bits of the
//! 26-bit ECC.

pub mod codec;

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::{PAGE_SIZE, PAGES_PER_BLOCK, RAW_PAGE_SIZE, SPARE_SIZE};

/// Value of the bad-block marker on usable blocks
pub const BLOCK_GOOD: u8 = 0xFF;

/// The highest logical address the 12-bit field can hold
pub const MAX_LBA: u16 = 0xFFF;

/// The spare layouts, named after the hardware they appear on
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub enum MetaType {
    /// Original small-block controllers (meta type 0)
    SmallBlock,

    /// Newer controllers driving small-block parts (meta type 1)
    BigOnSmall,

    /// Newer controllers driving large-block parts (meta type 2)
    BigBlock,
}

impl MetaType {
    /// Pages per logical address: the erase block size of the part
    pub fn pages_per_lba(self) -> u32 {
        match self {
            Self::SmallBlock | Self::BigOnSmall => PAGES_PER_BLOCK as u32,
            Self::BigBlock => 256,
        }
    }

    /// The logical address that a page is expected to carry in a linear image
    ///
    /// Fails with [Error::ImageTooLarge] if the address does not fit the 12-bit field.
    pub fn lba_for_page(self, page_index: u32) -> Result<u16> {
        let lba = page_index / self.pages_per_lba();
        u16::try_from(lba)
            .ok()
            .filter(|&lba| lba <= MAX_LBA)
            .ok_or(Error::ImageTooLarge {
                page: page_index,
                lba,
            })
    }

    pub(crate) fn layout(self) -> &'static SpareLayout {
        match self {
            Self::SmallBlock => &SMALL_BLOCK,
            Self::BigOnSmall => &BIG_ON_SMALL,
            Self::BigBlock => &BIG_BLOCK,
        }
    }
}

impl From<MetaType> for u8 {
    fn from(value: MetaType) -> Self {
        match value {
            MetaType::SmallBlock => 0,
            MetaType::BigOnSmall => 1,
            MetaType::BigBlock => 2,
        }
    }
}

impl TryFrom<u8> for MetaType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::SmallBlock),
            1 => Ok(Self::BigOnSmall),
            2 => Ok(Self::BigBlock),
            x => Err(Error::UnsupportedMetaType(x)),
        }
    }
}

/// Parse the meta type number, e.g. "2"
impl FromStr for MetaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(s.trim().parse::<u8>()?.try_into()?)
    }
}

/// Where each field sits within the spare, for one meta type
#[derive(Debug)]
pub(crate) struct SpareLayout {
    /// Low byte of the logical address; the next byte holds the upper nibble
    pub lba: usize,

    pub bad_block: usize,

    /// Bytes of the sequence counter, least significant first
    pub sequence: &'static [usize],

    /// A byte cleared whenever the address and marker are rewritten
    pub cleared: Option<usize>,

    /// Multiplier from the stored free page count to pages
    pub page_count_scale: u16,
}

const FS_SIZE: usize = 7;
const FS_PAGE_COUNT: usize = 9;
const FS_BLOCK_TYPE: usize = 12;

static SMALL_BLOCK: SpareLayout = SpareLayout {
    lba: 0,
    bad_block: 5,
    sequence: &[2, 3, 4, 6],
    cleared: None,
    page_count_scale: 1,
};

static BIG_ON_SMALL: SpareLayout = SpareLayout {
    lba: 1,
    bad_block: 5,
    sequence: &[0, 3, 4, 6],
    cleared: None,
    page_count_scale: 1,
};

static BIG_BLOCK: SpareLayout = SpareLayout {
    lba: 1,
    bad_block: 0,
    sequence: &[5, 4, 3],
    cleared: Some(5),
    page_count_scale: 4,
};

impl SpareLayout {
    pub fn lba(&self, spare: &[u8]) -> u16 {
        u16::from(spare[self.lba]) | (u16::from(spare[self.lba + 1] & 0x0F) << 8)
    }

    /// The two address bytes as they are written for `lba`
    pub fn lba_bytes(lba: u16) -> [u8; 2] {
        debug_assert!(lba <= MAX_LBA);
        lba.to_le_bytes()
    }

    pub fn lba_matches(&self, spare: &[u8], lba: u16) -> bool {
        spare[self.lba..self.lba + 2] == Self::lba_bytes(lba)
    }

    /// Write the logical address and mark the block good
    pub fn stamp(&self, spare: &mut [u8], lba: u16) {
        spare[self.lba..self.lba + 2].copy_from_slice(&Self::lba_bytes(lba));
        spare[self.bad_block] = BLOCK_GOOD;
        if let Some(cleared) = self.cleared {
            spare[cleared] = 0x00;
        }
    }
}

/// The fields of a spare, decoded according to its meta type
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct MetaData {
    pub meta_type: MetaType,

    /// The logical block address this page belongs to
    pub lba: u16,

    /// The bad-block marker; [BLOCK_GOOD] unless the block has been retired
    pub bad_block: u8,

    /// Filesystem block type (6 bits)
    pub fs_block_type: u8,

    /// Free pages left in the block, already scaled to pages
    pub fs_free_pages: u16,

    /// Filesystem sequence counter (24 bits on meta type 2)
    pub fs_sequence: u32,

    /// Filesystem size field
    pub fs_size: u16,
}

impl MetaData {
    /// Decode a 16-byte spare
    pub fn parse(spare: &[u8], meta_type: MetaType) -> Result<Self> {
        let spare = spare.get(..SPARE_SIZE).ok_or(Error::InvalidLength {
            len: spare.len(),
            granularity: SPARE_SIZE,
        })?;
        let layout = meta_type.layout();

        let fs_sequence = layout
            .sequence
            .iter()
            .rev()
            .fold(0u32, |acc, &offset| (acc << 8) | u32::from(spare[offset]));

        Ok(Self {
            meta_type,
            lba: layout.lba(spare),
            bad_block: spare[layout.bad_block],
            fs_block_type: spare[FS_BLOCK_TYPE] & 0x3F,
            fs_free_pages: u16::from(spare[FS_PAGE_COUNT]) * layout.page_count_scale,
            fs_sequence,
            fs_size: u16::from_le_bytes([spare[FS_SIZE], spare[FS_SIZE + 1]]),
        })
    }

    /// Decode the spare of one page of a raw image
    pub fn from_page(image: &[u8], page_index: u32, meta_type: MetaType) -> Result<Self> {
        let pages = (image.len() / RAW_PAGE_SIZE) as u32;
        if page_index >= pages {
            return Err(Error::PageOutOfRange {
                page: page_index,
                pages,
            });
        }

        let offset = page_index as usize * RAW_PAGE_SIZE + PAGE_SIZE;
        Self::parse(&image[offset..offset + SPARE_SIZE], meta_type)
    }

    /// Has the block this page belongs to been retired?
    pub fn is_bad(&self) -> bool {
        self.bad_block != BLOCK_GOOD
    }
}

#[test]
fn test_meta_type_numbers() {
    for n in 0..3u8 {
        let meta_type = MetaType::try_from(n).unwrap();
        assert_eq!(u8::from(meta_type), n);
        assert_eq!(format!("{n}").parse::<MetaType>().unwrap(), meta_type);
    }
    assert!(matches!(
        MetaType::try_from(3),
        Err(Error::UnsupportedMetaType(3))
    ));
    assert!("7".parse::<MetaType>().is_err());
    assert!("big".parse::<MetaType>().is_err());
}

#[test]
fn test_lba_for_page() -> anyhow::Result<()> {
    assert_eq!(MetaType::SmallBlock.lba_for_page(31)?, 0);
    assert_eq!(MetaType::BigOnSmall.lba_for_page(32)?, 1);
    assert_eq!(MetaType::BigBlock.lba_for_page(255)?, 0);
    assert_eq!(MetaType::BigBlock.lba_for_page(256 * 7 + 3)?, 7);
    Ok(())
}

#[test]
fn test_lba_for_page_limit() -> anyhow::Result<()> {
    for meta_type in [
        MetaType::SmallBlock,
        MetaType::BigOnSmall,
        MetaType::BigBlock,
    ] {
        let first_unaddressable = 0x1000 * meta_type.pages_per_lba();
        assert_eq!(meta_type.lba_for_page(first_unaddressable - 1)?, MAX_LBA);
        assert!(matches!(
            meta_type.lba_for_page(first_unaddressable),
            Err(Error::ImageTooLarge { lba: 0x1000, .. })
        ));
        assert!(meta_type.lba_for_page(u32::MAX).is_err());
    }
    Ok(())
}

#[test]
fn test_parse_small_block() {
    let spare = [
        0x34, 0xF2, 0x01, 0x02, 0x03, 0xFF, 0x04, 0x20, 0x06, 0x1D, 0x00, 0x00, 0xEA, 0x11, 0x22,
        0x33,
    ];
    let meta = MetaData::parse(&spare, MetaType::SmallBlock).unwrap();
    assert_eq!(
        meta,
        MetaData {
            meta_type: MetaType::SmallBlock,
            lba: 0x234,
            bad_block: 0xFF,
            fs_block_type: 0x2A,
            fs_free_pages: 0x1D,
            fs_sequence: 0x0403_0201,
            fs_size: 0x0620,
        }
    );
    assert!(!meta.is_bad());
}

#[test]
fn test_parse_big_on_small() {
    let spare = [
        0x01, 0x34, 0x02, 0x02, 0x03, 0x00, 0x04, 0x20, 0x06, 0x1D, 0x00, 0x00, 0x3F, 0x00, 0x00,
        0x00,
    ];
    let meta = MetaData::parse(&spare, MetaType::BigOnSmall).unwrap();
    assert_eq!(meta.lba, 0x234);
    assert_eq!(meta.fs_sequence, 0x0403_0201);
    assert_eq!(meta.fs_block_type, 0x3F);
    assert!(meta.is_bad());
}

#[test]
fn test_parse_big_block() {
    let spare = [
        0xFF, 0x10, 0x30, 0x03, 0x02, 0x01, 0xAA, 0x00, 0x20, 0x3F, 0x00, 0x00, 0x01, 0x00, 0x00,
        0x00,
    ];
    let meta = MetaData::parse(&spare, MetaType::BigBlock).unwrap();
    assert_eq!(meta.lba, 0x010);
    assert_eq!(meta.bad_block, 0xFF);
    assert_eq!(meta.fs_sequence, 0x03_0201);
    assert_eq!(meta.fs_free_pages, 0x3F * 4);
    assert_eq!(meta.fs_size, 0x2000);
    assert_eq!(meta.fs_block_type, 1);
}

#[test]
fn test_parse_short() {
    assert!(matches!(
        MetaData::parse(&[0u8; 15], MetaType::SmallBlock),
        Err(Error::InvalidLength { len: 15, .. })
    ));
}

#[test]
fn test_from_page() {
    let mut image = vec![0u8; RAW_PAGE_SIZE * 2];
    image[RAW_PAGE_SIZE + PAGE_SIZE] = 0x05;
    image[RAW_PAGE_SIZE + PAGE_SIZE + 5] = 0xFF;

    let meta = MetaData::from_page(&image, 1, MetaType::SmallBlock).unwrap();
    assert_eq!((meta.lba, meta.bad_block), (5, 0xFF));

    assert!(matches!(
        MetaData::from_page(&image, 2, MetaType::SmallBlock),
        Err(Error::PageOutOfRange { page: 2, pages: 2 })
    ));
}

#[test]
fn test_stamp() {
    let mut spare = [0xAAu8; SPARE_SIZE];
    BIG_BLOCK.stamp(&mut spare, 0x123);
    assert_eq!(spare[..6], [0xFF, 0x23, 0x01, 0xAA, 0xAA, 0x00]);
    assert!(BIG_BLOCK.lba_matches(&spare, 0x123));
    assert!(!BIG_BLOCK.lba_matches(&spare, 0x124));

    let mut spare = [0u8; SPARE_SIZE];
    SMALL_BLOCK.stamp(&mut spare, 7);
    let meta = MetaData::parse(&spare, MetaType::SmallBlock).unwrap();
    assert_eq!((meta.lba, meta.bad_block), (7, BLOCK_GOOD));
}
