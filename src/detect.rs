//! Working out which spare layout a raw image uses, by looking at the spares of a few blocks.
//!
//! Large-block images are recognized from block 0: only their layout puts a good bad-block
//! marker in byte 0 next to address 0. The two small-block layouts differ by a one byte shift of
//! the address, so they are told apart by finding address 1 in block 1, or the last block's own
//! address in the last block if block 1 is retired or damaged.

use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::{Error, Result};
use crate::nand::PageUtil;
use crate::spare::{MetaType, BLOCK_GOOD};
use crate::{PAGE_SIZE, RAW_BLOCK_SIZE, RAW_PAGE_SIZE, SPARE_SIZE};

/// Read the spare of the first page of `block`
fn read_block_spare<R: Read + Seek>(image: &mut R, block: u64) -> Result<[u8; SPARE_SIZE]> {
    let mut spare = [0u8; SPARE_SIZE];
    image.seek(SeekFrom::Start(block * RAW_BLOCK_SIZE as u64 + PAGE_SIZE as u64))?;
    image.read_exact(&mut spare)?;
    Ok(spare)
}

/// Which of the small-block layouts puts `lba` in this (good) spare, if any?
fn match_small_block(spare: &[u8], lba: u16) -> Option<MetaType> {
    let candidates = [MetaType::SmallBlock, MetaType::BigOnSmall];

    // Both layouts keep the bad-block marker in the same place
    if spare[candidates[0].layout().bad_block] != BLOCK_GOOD {
        return None;
    }

    candidates
        .into_iter()
        .find(|meta_type| meta_type.layout().lba(spare) == lba)
}

fn detect<R: Read + Seek>(image: &mut R, len: u64) -> Result<MetaType> {
    if len == 0 || len % RAW_PAGE_SIZE as u64 != 0 {
        return Err(Error::InvalidLength {
            len: len as usize,
            granularity: RAW_PAGE_SIZE,
        });
    }

    // Page 0 is all it takes to rule out blank and large-block images
    let spare = read_block_spare(image, 0)?;
    if spare.is_erased() {
        return Err(Error::BlankImage);
    }
    let big_block = MetaType::BigBlock.layout();
    if spare[big_block.bad_block] == BLOCK_GOOD && big_block.lba(&spare) == 0 {
        return Ok(MetaType::BigBlock);
    }

    let blocks = len / RAW_BLOCK_SIZE as u64;
    if blocks > 1 {
        let spare = read_block_spare(image, 1)?;
        if let Some(meta_type) = match_small_block(&spare, 1) {
            return Ok(meta_type);
        }
    }

    let last = blocks.checked_sub(1).ok_or(Error::UnrecognizedImage)?;
    let spare = read_block_spare(image, last)?;
    match_small_block(&spare, last as u16).ok_or(Error::UnrecognizedImage)
}

/// Detect the meta type of a raw image (pages with spare).
///
/// The stream is rewound to its start afterwards.
pub fn detect_meta_type<R: Read + Seek>(image: &mut R) -> Result<MetaType> {
    let len = image.seek(SeekFrom::End(0))?;
    let result = detect(image, len);
    image.seek(SeekFrom::Start(0))?;
    result
}

/// Detect the meta type of a raw image held in memory
pub fn detect_meta_type_in(image: &[u8]) -> Result<MetaType> {
    detect_meta_type(&mut Cursor::new(image))
}

#[cfg(test)]
fn test_image(blocks: usize, meta_type: MetaType) -> Vec<u8> {
    use crate::spare::codec::add_spare;
    use crate::BLOCK_SIZE;

    add_spare(&vec![0x5Au8; blocks * BLOCK_SIZE], meta_type).unwrap()
}

#[test]
fn test_detect_generated() {
    for meta_type in [
        MetaType::SmallBlock,
        MetaType::BigOnSmall,
        MetaType::BigBlock,
    ] {
        let image = test_image(16, meta_type);
        assert_eq!(detect_meta_type_in(&image).unwrap(), meta_type);
    }
}

#[test]
fn test_detect_rewinds() -> anyhow::Result<()> {
    let mut cursor = Cursor::new(test_image(4, MetaType::BigOnSmall));
    cursor.seek(SeekFrom::Start(100))?;
    assert_eq!(detect_meta_type(&mut cursor)?, MetaType::BigOnSmall);
    assert_eq!(cursor.position(), 0);
    Ok(())
}

#[test]
fn test_detect_blank() {
    let image = vec![0xFFu8; RAW_BLOCK_SIZE * 4];
    assert!(matches!(detect_meta_type_in(&image), Err(Error::BlankImage)));
}

#[test]
fn test_detect_bad_block_one() {
    for meta_type in [MetaType::SmallBlock, MetaType::BigOnSmall] {
        let mut image = test_image(8, meta_type);

        // Retire block 1; the last block decides
        image[RAW_BLOCK_SIZE + PAGE_SIZE + 5] = 0x00;
        assert_eq!(detect_meta_type_in(&image).unwrap(), meta_type);

        // Damage the last block as well
        let last = image.len() - RAW_BLOCK_SIZE;
        image[last + PAGE_SIZE..][..2].fill(0x77);
        assert!(matches!(
            detect_meta_type_in(&image),
            Err(Error::UnrecognizedImage)
        ));
    }
}

#[test]
fn test_detect_garbage() {
    let image = vec![0x00u8; RAW_BLOCK_SIZE * 4];
    assert!(matches!(
        detect_meta_type_in(&image),
        Err(Error::UnrecognizedImage)
    ));
}

#[test]
fn test_detect_bad_length() {
    assert!(matches!(
        detect_meta_type_in(&[]),
        Err(Error::InvalidLength { .. })
    ));
    assert!(matches!(
        detect_meta_type_in(&[0u8; RAW_PAGE_SIZE + 1]),
        Err(Error::InvalidLength { .. })
    ));
    assert!(matches!(
        detect_meta_type_in(&[0u8; RAW_PAGE_SIZE]),
        Err(Error::UnrecognizedImage)
    ));
}

#[test]
fn test_detect_short_image() -> anyhow::Result<()> {
    use crate::spare::codec::add_spare;

    // Fewer pages than a block still say enough for the first checks
    let image = add_spare(&[0u8; PAGE_SIZE], MetaType::BigBlock)?;
    assert_eq!(detect_meta_type_in(&image)?, MetaType::BigBlock);

    let image = vec![0xFFu8; RAW_PAGE_SIZE * 4];
    assert!(matches!(detect_meta_type_in(&image), Err(Error::BlankImage)));

    // A lone small-block page cannot be told apart from its sibling layout
    let image = add_spare(&[0u8; PAGE_SIZE * 4], MetaType::SmallBlock)?;
    assert!(matches!(
        detect_meta_type_in(&image),
        Err(Error::UnrecognizedImage)
    ));
    Ok(())
}
