//! Generating and repairing spare areas.
//!
//! Each page gets its logical address and bad-block marker written at the positions its meta type
//! dictates, and is then sealed with a freshly computed ECC. A page is always sealed immediately
//! after its metadata is written, so an image is never left with a page whose ECC is stale.

use bytes::{BufMut, BytesMut};

use super::{MetaType, SpareLayout};
use crate::ecc::write_ecc;
use crate::error::{Error, Result};
use crate::{PAGE_SIZE, PAGES_PER_BLOCK, RAW_BLOCK_SIZE, RAW_PAGE_SIZE, SPARE_SIZE};

/// Ensure that a run of `pages` pages starting at page `first_page` of the image is addressable
fn check_addressable(first_page: u32, pages: usize, meta_type: MetaType) -> Result<()> {
    let Some(last) = pages.checked_sub(1) else {
        return Ok(());
    };
    let last_page = u32::try_from(last)
        .ok()
        .and_then(|last| first_page.checked_add(last))
        .unwrap_or(u32::MAX);

    meta_type.lba_for_page(last_page).map(drop)
}

/// Turn plain page data (a multiple of 512 bytes) into a raw image, with a spare for each page.
pub fn add_spare(data: &[u8], meta_type: MetaType) -> Result<Vec<u8>> {
    Error::check_len(data.len(), PAGE_SIZE)?;

    let layout = meta_type.layout();
    let pages = data.len() / PAGE_SIZE;
    check_addressable(0, pages, meta_type)?;

    let mut image = BytesMut::with_capacity(pages * RAW_PAGE_SIZE);
    for (page_index, page_data) in (0u32..).zip(data.chunks_exact(PAGE_SIZE)) {
        let mut spare = [0u8; SPARE_SIZE];
        layout.stamp(&mut spare, meta_type.lba_for_page(page_index)?);

        let start = image.len();
        image.put_slice(page_data);
        image.put_slice(&spare);
        write_ecc(&mut image[start..]);
    }

    Ok(image.into())
}

/// Remove the spare from every page of a raw image, leaving only the page data.
pub fn strip_spare(image: &[u8]) -> Result<Vec<u8>> {
    Error::check_len(image.len(), RAW_PAGE_SIZE)?;

    let mut data = BytesMut::with_capacity(image.len() / RAW_PAGE_SIZE * PAGE_SIZE);
    for page in image.chunks_exact(RAW_PAGE_SIZE) {
        data.put_slice(&page[..PAGE_SIZE]);
    }

    Ok(data.into())
}

/// Repair the spare of one page, whose index within the image is `page_index`.
///
/// The address and bad-block marker are only rewritten when the stored address is wrong; the ECC
/// is rewritten either way.
fn correct_page(page: &mut [u8], lba: u16, layout: &SpareLayout) {
    let spare = &mut page[PAGE_SIZE..RAW_PAGE_SIZE];
    if !layout.lba_matches(spare, lba) {
        layout.stamp(spare, lba);
    }

    write_ecc(page);
}

/// Repair the spares of a run of raw pages, the first of which is page `first_page` of the image.
pub fn correct_pages(pages: &mut [u8], first_page: u32, meta_type: MetaType) -> Result<()> {
    Error::check_len(pages.len(), RAW_PAGE_SIZE)?;
    check_addressable(first_page, pages.len() / RAW_PAGE_SIZE, meta_type)?;

    let layout = meta_type.layout();
    for (page_index, page) in (first_page..).zip(pages.chunks_exact_mut(RAW_PAGE_SIZE)) {
        correct_page(page, meta_type.lba_for_page(page_index)?, layout);
    }

    Ok(())
}

/// Repair the spares of the 32 pages of `block` within a raw image.
pub fn correct_block(image: &mut [u8], block: u32, meta_type: MetaType) -> Result<()> {
    Error::check_len(image.len(), RAW_PAGE_SIZE)?;

    let blocks = (image.len() / RAW_BLOCK_SIZE) as u32;
    let begin = block as usize * RAW_BLOCK_SIZE;
    let pages = image
        .get_mut(begin..begin + RAW_BLOCK_SIZE)
        .ok_or(Error::BlockOutOfRange { block, blocks })?;

    correct_pages(pages, block * PAGES_PER_BLOCK as u32, meta_type)
}

/// Repair the spares of every page of a raw image, block by block.
pub fn correct_image(image: &mut [u8], meta_type: MetaType) -> Result<()> {
    Error::check_len(image.len(), RAW_PAGE_SIZE)?;
    check_addressable(0, image.len() / RAW_PAGE_SIZE, meta_type)?;

    for (block, pages) in (0u32..).zip(image.chunks_mut(RAW_BLOCK_SIZE)) {
        correct_pages(pages, block * PAGES_PER_BLOCK as u32, meta_type)?;
    }

    Ok(())
}

#[cfg(test)]
const ALL_META_TYPES: [MetaType; 3] = [
    MetaType::SmallBlock,
    MetaType::BigOnSmall,
    MetaType::BigBlock,
];

#[cfg(test)]
fn test_data(pages: usize) -> Vec<u8> {
    (0..pages * PAGE_SIZE).map(|i| (i / 3) as u8).collect()
}

#[test]
fn test_add_spare() -> anyhow::Result<()> {
    use crate::ecc::check_ecc;
    use crate::spare::MetaData;

    let data = test_data(600);
    for meta_type in ALL_META_TYPES {
        let image = add_spare(&data, meta_type)?;
        assert_eq!(image.len(), 600 * RAW_PAGE_SIZE);

        for (page_index, page) in image.chunks_exact(RAW_PAGE_SIZE).enumerate() {
            assert!(check_ecc(page));
            assert_eq!(page[..PAGE_SIZE], data[page_index * PAGE_SIZE..][..PAGE_SIZE]);

            let meta = MetaData::parse(&page[PAGE_SIZE..], meta_type)?;
            assert_eq!(meta.lba, meta_type.lba_for_page(page_index as u32)?);
            assert!(!meta.is_bad());
        }
    }
    Ok(())
}

#[test]
fn test_add_spare_layout() -> anyhow::Result<()> {
    let image = add_spare(&test_data(33), MetaType::SmallBlock)?;
    assert_eq!(image[32 * RAW_PAGE_SIZE + PAGE_SIZE..][..6], [1, 0, 0, 0, 0, 0xFF]);

    let image = add_spare(&test_data(33), MetaType::BigOnSmall)?;
    assert_eq!(image[32 * RAW_PAGE_SIZE + PAGE_SIZE..][..6], [0, 1, 0, 0, 0, 0xFF]);

    let image = add_spare(&test_data(257), MetaType::BigBlock)?;
    assert_eq!(image[PAGE_SIZE..][..6], [0xFF, 0, 0, 0, 0, 0]);
    assert_eq!(image[256 * RAW_PAGE_SIZE + PAGE_SIZE..][..6], [0xFF, 1, 0, 0, 0, 0]);
    Ok(())
}

#[test]
fn test_add_spare_bad_length() {
    assert!(matches!(
        add_spare(&[0u8; PAGE_SIZE + 1], MetaType::SmallBlock),
        Err(Error::InvalidLength { .. })
    ));
    assert!(add_spare(&[], MetaType::SmallBlock).unwrap().is_empty());
}

#[test]
fn test_strip_spare() -> anyhow::Result<()> {
    let data = test_data(40);
    let image = add_spare(&data, MetaType::BigOnSmall)?;
    assert_eq!(strip_spare(&image)?, data);
    assert!(strip_spare(&image[..RAW_PAGE_SIZE - 1]).is_err());
    Ok(())
}

#[test]
fn test_correct_image() -> anyhow::Result<()> {
    use crate::ecc::verify_image;

    for meta_type in ALL_META_TYPES {
        let expected = add_spare(&test_data(512), meta_type)?;

        // Damage the address, the marker and the ECC of every page
        let layout = meta_type.layout();
        let mut image = expected.clone();
        for page in image.chunks_exact_mut(RAW_PAGE_SIZE) {
            let spare = &mut page[PAGE_SIZE..];
            spare[layout.lba..layout.lba + 2].fill(0xEE);
            spare[layout.bad_block] = 0x00;
            spare[12..].fill(0);
        }
        assert!(!verify_image(&image)?.is_empty());

        correct_image(&mut image, meta_type)?;
        assert_eq!(image, expected);
    }
    Ok(())
}

#[test]
fn test_correct_idempotent() -> anyhow::Result<()> {
    let mut image = add_spare(&test_data(96), MetaType::SmallBlock)?;

    // Scribble over some user data and filesystem fields
    image[10] ^= 0xFF;
    image[RAW_PAGE_SIZE * 40 + PAGE_SIZE + 9] = 0x1D;

    correct_image(&mut image, MetaType::SmallBlock)?;
    let once = image.clone();
    correct_image(&mut image, MetaType::SmallBlock)?;
    assert_eq!(image, once);
    Ok(())
}

#[test]
fn test_correct_preserves_matching_metadata() -> anyhow::Result<()> {
    use crate::ecc::check_ecc;

    let mut image = add_spare(&test_data(64), MetaType::BigOnSmall)?;

    // A retired block keeps its marker as long as its address is right...
    let spare = RAW_BLOCK_SIZE + PAGE_SIZE;
    image[spare + 5] = 0x00;
    image[spare + 12] |= 0x15;
    correct_block(&mut image, 1, MetaType::BigOnSmall)?;
    assert_eq!(image[spare + 5], 0x00);
    assert_eq!(image[spare + 12] & 0x3F, 0x15);
    assert!(check_ecc(&image[RAW_BLOCK_SIZE..][..RAW_PAGE_SIZE]));

    // ...but a wrong address rewrites both
    image[spare + 1] = 0x07;
    correct_block(&mut image, 1, MetaType::BigOnSmall)?;
    assert_eq!(image[spare + 1..][..2], [0x01, 0x00]);
    assert_eq!(image[spare + 5], 0xFF);
    assert!(check_ecc(&image[RAW_BLOCK_SIZE..][..RAW_PAGE_SIZE]));
    Ok(())
}

#[test]
fn test_correct_block_only_touches_block() -> anyhow::Result<()> {
    let mut image = vec![0u8; RAW_BLOCK_SIZE * 3];
    correct_block(&mut image, 1, MetaType::SmallBlock)?;

    assert!(image[..RAW_BLOCK_SIZE].iter().all(|&x| x == 0));
    assert!(image[RAW_BLOCK_SIZE * 2..].iter().all(|&x| x == 0));
    assert_eq!(image[RAW_BLOCK_SIZE + PAGE_SIZE..][..6], [1, 0, 0, 0, 0, 0xFF]);

    assert!(matches!(
        correct_block(&mut image, 3, MetaType::SmallBlock),
        Err(Error::BlockOutOfRange { block: 3, blocks: 3 })
    ));
    assert!(matches!(
        correct_image(&mut image[1..], MetaType::SmallBlock),
        Err(Error::InvalidLength { .. })
    ));
    Ok(())
}

#[test]
fn test_correct_big_block_addresses() -> anyhow::Result<()> {
    use crate::spare::MetaData;

    let mut image = vec![0xAAu8; RAW_PAGE_SIZE * 600];
    correct_image(&mut image, MetaType::BigBlock)?;

    for page_index in [0u32, 255, 256, 511, 512, 599] {
        let meta = MetaData::from_page(&image, page_index, MetaType::BigBlock)?;
        assert_eq!(meta.lba, (page_index / 256) as u16);
        assert_eq!(meta.bad_block, 0xFF);
    }

    // Block 9 (pages 288..320) belongs to logical block 1
    correct_block(&mut image, 9, MetaType::BigBlock)?;
    assert_eq!(MetaData::from_page(&image, 300, MetaType::BigBlock)?.lba, 1);
    Ok(())
}

#[test]
fn test_address_limit() -> anyhow::Result<()> {
    use crate::spare::{MetaData, MAX_LBA};

    for meta_type in ALL_META_TYPES {
        let addressable = 0x1000 * meta_type.pages_per_lba() as usize;
        assert!(check_addressable(0, 0, meta_type).is_ok());
        assert!(check_addressable(0, addressable, meta_type).is_ok());
        assert!(matches!(
            check_addressable(0, addressable + 1, meta_type),
            Err(Error::ImageTooLarge { lba: 0x1000, .. })
        ));
        assert!(check_addressable(1, usize::MAX, meta_type).is_err());

        // The last addressable page still carries its own address
        let last_page = addressable as u32 - 1;
        let mut page = add_spare(&test_data(1), meta_type)?;
        correct_pages(&mut page, last_page, meta_type)?;
        assert_eq!(MetaData::parse(&page[PAGE_SIZE..], meta_type)?.lba, MAX_LBA);

        // A run reaching past it is refused before anything is written
        let mut pages = add_spare(&test_data(2), meta_type)?;
        let before = pages.clone();
        assert!(matches!(
            correct_pages(&mut pages, last_page, meta_type),
            Err(Error::ImageTooLarge { lba: 0x1000, .. })
        ));
        assert_eq!(pages, before);
    }
    Ok(())
}
