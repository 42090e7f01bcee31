//! Decoding of the flash controller's config register into the NAND geometry.
//!
//! The register packs a controller generation (bits 17-18) and a block size class (bits 4-5).
//! Small-block parts have one of a few fixed sizes; large-block parts encode their capacity as a
//! power of two in bits 19-20 and 21-24.

use thiserror::Error;

use crate::spare::MetaType;
use crate::{PAGE_SIZE, RAW_PAGE_SIZE, SPARE_SIZE};

const SMALL_BLOCK_SIZE: u32 = 0x4000;
const LARGE_BLOCK_SIZE: u32 = 0x20000;
const HUGE_BLOCK_SIZE: u32 = 0x40000;

/// Exponent added to the capacity fields of large-block parts
const CAPACITY_SHIFT_BASE: u32 = 0x17;

/// Reasons a config register can't be turned into a [Geometry]
#[derive(Error, Debug, Eq, PartialEq, Copy, Clone)]
pub enum GeometryError {
    /// The register reads as zero, so the controller did not answer
    #[error("invalid (zero) config register")]
    InvalidConfig,

    #[error("unknown controller type {0}")]
    UnknownControllerType(u8),

    #[error("unknown block kind {0}")]
    UnknownBlockKind(u8),

    /// A known combination that this code does not handle
    #[error("unsupported block kind {block_kind} on controller type {controller_type}")]
    UnsupportedBlockKind { controller_type: u8, block_kind: u8 },
}

/// A pub-fields struct describing a NAND as reported by its controller
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    /// The raw register this was decoded from
    pub config: u32,

    pub controller_type: u8,
    pub block_kind: u8,
    pub meta_type: MetaType,

    /// Bytes of user data per page (always 0x200)
    pub page_size: usize,

    /// Bytes of spare data per page (always 0x10)
    pub spare_size: usize,

    /// Bytes of user data per erase block
    pub block_size: u32,

    /// Number of erase blocks on the part
    pub total_blocks: u32,

    /// Number of erase blocks addressable by the filesystem; the rest are kept in reserve for
    /// remapping bad blocks
    pub fs_reserved_blocks: u32,

    pub pages_per_block: u32,

    /// Bytes per erase block including spare
    pub raw_block_size: u32,

    /// Bytes of user data on the part
    pub total_size: u64,

    /// Bytes on the part including spare
    pub total_raw_size: u64,

    /// How many 16 KiB blocks the part would have, for tools that only count small blocks
    pub small_block_count: u32,
}

impl Geometry {
    /// Decode a config register value
    pub fn decode(config: u32) -> Result<Self, GeometryError> {
        if config == 0 {
            return Err(GeometryError::InvalidConfig);
        }

        let controller_type = ((config >> 17) & 0x3) as u8;
        let block_kind = ((config >> 4) & 0x3) as u8;
        let unsupported = GeometryError::UnsupportedBlockKind {
            controller_type,
            block_kind,
        };

        // (meta type, block size, total blocks, fs reserved blocks)
        let (meta_type, block_size, total_blocks, fs_reserved_blocks) = match controller_type {
            0 => {
                let (total, fs) = match block_kind {
                    0 => return Err(unsupported),
                    1 => (0x400, 0x3E0),
                    2 => (0x800, 0x7C0),
                    3 => (0x1000, 0xF80),
                    x => return Err(GeometryError::UnknownBlockKind(x)),
                };
                (MetaType::SmallBlock, SMALL_BLOCK_SIZE, total, fs)
            }
            1 | 2 => match block_kind {
                0 if controller_type == 1 => return Err(unsupported),
                0 => (MetaType::BigOnSmall, SMALL_BLOCK_SIZE, 0x400, 0x3E0),
                1 if controller_type == 1 => (MetaType::BigOnSmall, SMALL_BLOCK_SIZE, 0x400, 0x3E0),
                1 => (MetaType::BigOnSmall, SMALL_BLOCK_SIZE, 0x1000, 0xF80),
                2 => {
                    let total = large_capacity(config) >> LARGE_BLOCK_SIZE.trailing_zeros();
                    (MetaType::BigBlock, LARGE_BLOCK_SIZE, total as u32, 0x1E0)
                }
                3 => {
                    let total = large_capacity(config) >> HUGE_BLOCK_SIZE.trailing_zeros();
                    (MetaType::BigBlock, HUGE_BLOCK_SIZE, total as u32, 0xF0)
                }
                x => return Err(GeometryError::UnknownBlockKind(x)),
            },
            x => return Err(GeometryError::UnknownControllerType(x)),
        };

        let pages_per_block = block_size / PAGE_SIZE as u32;
        let raw_block_size = pages_per_block * RAW_PAGE_SIZE as u32;
        let total_size = u64::from(block_size) * u64::from(total_blocks);
        let total_raw_size = (total_size / u64::from(block_size)) * u64::from(raw_block_size);
        let small_block_count = (total_size / u64::from(SMALL_BLOCK_SIZE)) as u32;

        Ok(Self {
            config,
            controller_type,
            block_kind,
            meta_type,
            page_size: PAGE_SIZE,
            spare_size: SPARE_SIZE,
            block_size,
            total_blocks,
            fs_reserved_blocks,
            pages_per_block,
            raw_block_size,
            total_size,
            total_raw_size,
            small_block_count,
        })
    }

    /// Bytes of user data in the filesystem area
    pub fn fs_size(&self) -> u64 {
        u64::from(self.fs_reserved_blocks) * u64::from(self.block_size)
    }

    /// Is `block` a valid erase block index on this part?
    pub fn contains_block(&self, block: u32) -> bool {
        block < self.total_blocks
    }
}

/// The capacity of a large-block part, in bytes
fn large_capacity(config: u32) -> u64 {
    let shift = ((config >> 19) & 0x3) + ((config >> 21) & 0xF) + CAPACITY_SHIFT_BASE;
    1u64 << shift
}

#[cfg(test)]
fn config(controller_type: u32, block_kind: u32, size_lo: u32, size_hi: u32) -> u32 {
    (controller_type << 17) | (block_kind << 4) | (size_lo << 19) | (size_hi << 21)
}

#[test]
fn test_small_block_16m() {
    use pretty_assertions::assert_eq;

    let geometry = Geometry::decode(config(0, 1, 0, 0)).unwrap();
    assert_eq!(
        geometry,
        Geometry {
            config: 0x10,
            controller_type: 0,
            block_kind: 1,
            meta_type: MetaType::SmallBlock,
            page_size: 0x200,
            spare_size: 0x10,
            block_size: 0x4000,
            total_blocks: 0x400,
            fs_reserved_blocks: 0x3E0,
            pages_per_block: 32,
            raw_block_size: 0x4200,
            total_size: 0x100_0000,
            total_raw_size: 0x108_0000,
            small_block_count: 0x400,
        }
    );
}

#[test]
fn test_small_block_sizes() {
    let geometry = Geometry::decode(config(0, 2, 0, 0)).unwrap();
    assert_eq!((geometry.total_blocks, geometry.fs_reserved_blocks), (0x800, 0x7C0));
    assert_eq!(geometry.total_size, 32 << 20);

    let geometry = Geometry::decode(config(0, 3, 0, 0)).unwrap();
    assert_eq!((geometry.total_blocks, geometry.fs_reserved_blocks), (0x1000, 0xF80));
    assert_eq!(geometry.total_size, 64 << 20);
    assert_eq!(geometry.fs_size(), 0xF80 * 0x4000);
}

#[test]
fn test_unsupported() {
    assert_eq!(
        Geometry::decode(config(0, 0, 0, 0) | 1),
        Err(GeometryError::UnsupportedBlockKind {
            controller_type: 0,
            block_kind: 0
        })
    );
    assert_eq!(
        Geometry::decode(config(1, 0, 0, 0)),
        Err(GeometryError::UnsupportedBlockKind {
            controller_type: 1,
            block_kind: 0
        })
    );
}

#[test]
fn test_invalid_config() {
    assert_eq!(Geometry::decode(0), Err(GeometryError::InvalidConfig));
}

#[test]
fn test_unknown_controller() {
    for block_kind in 0..4 {
        assert_eq!(
            Geometry::decode(config(3, block_kind, 1, 1)),
            Err(GeometryError::UnknownControllerType(3))
        );
    }
}

#[test]
fn test_big_on_small() {
    let geometry = Geometry::decode(config(2, 0, 0, 0)).unwrap();
    assert_eq!(geometry.meta_type, MetaType::BigOnSmall);
    assert_eq!((geometry.total_blocks, geometry.block_size), (0x400, 0x4000));

    let geometry = Geometry::decode(config(1, 1, 0, 0)).unwrap();
    assert_eq!(geometry.meta_type, MetaType::BigOnSmall);
    assert_eq!(geometry.total_blocks, 0x400);

    let geometry = Geometry::decode(config(2, 1, 0, 0)).unwrap();
    assert_eq!(geometry.meta_type, MetaType::BigOnSmall);
    assert_eq!((geometry.total_blocks, geometry.fs_reserved_blocks), (0x1000, 0xF80));
}

#[test]
fn test_big_block_256m() {
    // 1 << (2 + 3 + 0x17) = 256 MiB
    let geometry = Geometry::decode(config(2, 2, 2, 3)).unwrap();
    assert_eq!(geometry.meta_type, MetaType::BigBlock);
    assert_eq!(geometry.block_size, 0x20000);
    assert_eq!(geometry.total_size, 0x1000_0000);
    assert_eq!(geometry.total_blocks, 0x1000_0000 >> 17);
    assert_eq!(geometry.fs_reserved_blocks, 0x1E0);
    assert_eq!(geometry.pages_per_block, 256);
    assert_eq!(geometry.raw_block_size, 256 * 0x210);
    assert_eq!(geometry.total_raw_size, 0x800 * 256 * 0x210);
    assert_eq!(geometry.small_block_count, 0x4000);
    assert!(geometry.contains_block(0x7FF));
    assert!(!geometry.contains_block(0x800));
}

#[test]
fn test_huge_block() {
    // 1 << (0 + 6 + 0x17) = 512 MiB
    let geometry = Geometry::decode(config(1, 3, 0, 6)).unwrap();
    assert_eq!(geometry.meta_type, MetaType::BigBlock);
    assert_eq!(geometry.block_size, 0x40000);
    assert_eq!(geometry.total_blocks, 0x800);
    assert_eq!(geometry.fs_reserved_blocks, 0xF0);
    assert_eq!(geometry.pages_per_block, 512);
}

#[test]
fn test_every_register_class() {
    // Only the controller type and block kind decide success or failure
    for controller_type in 0..4 {
        for block_kind in 0..4 {
            let result = Geometry::decode(config(controller_type, block_kind, 1, 2));
            let expect_ok = match controller_type {
                0 => block_kind != 0,
                1 => block_kind != 0,
                2 => true,
                _ => false,
            };
            assert_eq!(result.is_ok(), expect_ok, "{controller_type}/{block_kind}");

            if let Ok(geometry) = result {
                assert_eq!(
                    u64::from(geometry.block_size) * u64::from(geometry.total_blocks),
                    geometry.total_size
                );
                assert_eq!(geometry.pages_per_block * 0x200, geometry.block_size);
            }
        }
    }
}
