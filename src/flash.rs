//! Writing raw images to (and reading them back from) a NAND device.
//!
//! The image is written one erase block at a time. Before a block is programmed, the spare of every
//! non-erased page is corrected for the page's position in the image, so images built by other
//! tools (or edited by hand) always land on flash with valid addresses and ECCs.

use std::io::{Read, Write};

use anyhow::ensure;
use retry::{delay::NoDelay, retry, OperationResult};

use crate::nand::{Nand, NandBlock, PageUtil};
use crate::spare::codec::correct_pages;
use crate::spare::MetaType;

/// Attempts at programming a block before it is retired
const BLOCK_ATTEMPTS: usize = 5;

/// Determine how much of a block already holds `data`.
///
/// `data` must be a whole number of pages, no longer than the block. Returns the index of the first
/// page that still needs programming, or None if the block holds something else and must be erased
/// first.
fn resume_point<B: NandBlock>(block: &B, data: &[u8]) -> Option<u32> {
    let mut content = vec![0; block.page_size() * block.page_count() as usize];

    // Read errors are considered "needs erase"
    block.read(0, &mut content).ok()?;

    let pages: Vec<&[u8]> = content.chunks_exact(block.page_size()).collect();
    let matching = pages
        .iter()
        .zip(data.chunks_exact(block.page_size()))
        .take_while(|(have, want)| **have == *want)
        .count();

    // Every page from the first one not holding its data on must be erased to be programmable
    pages[matching..]
        .iter()
        .all(|page| page.is_erased())
        .then_some(matching as u32)
}

/// Update the specified block's contents, resuming from a partial write if possible.
fn update_block<B: NandBlock>(block: &mut B, data: &[u8]) -> anyhow::Result<()> {
    let start_page = match resume_point(block, data) {
        None => {
            block.erase()?;
            0
        }
        Some(page) => page,
    };

    let start = start_page as usize * block.page_size();
    block.program(start_page, &data[start..])
}

/// Write a raw image (pages with spare) to the NAND flash device, correcting the spare of every
/// page on the way. Returns the number of erase blocks written.
///
/// This operation is idempotent; blocks that already hold their data are left alone.
///
/// The `skip_bad` parameter will cause bad blocks to be skipped over; the data intended for a bad
/// block goes to the next good one. If this is `false`, encountering a bad block is an error.
pub fn write_image<N: Nand, R: Read>(
    nand: &mut N,
    image: &mut R,
    meta_type: MetaType,
    skip_bad: bool,
) -> anyhow::Result<u32> {
    let layout = nand.get_layout();
    let rpt = howudoin::new()
        .label("Writing blocks")
        .set_len(u64::from(layout.blocks));

    let mut data = Vec::with_capacity(layout.block_size());
    let mut block_index: u32 = 0;
    let mut written: u32 = 0;
    loop {
        data.clear();
        image
            .by_ref()
            .take(layout.block_size() as u64)
            .read_to_end(&mut data)?;
        if data.is_empty() {
            // EOF encountered means the write is complete
            break;
        }
        ensure!(
            data.len() % layout.bytes_per_page == 0,
            "image does not end on a page boundary"
        );

        // Spares are addressed by position in the image, whichever block the data lands in
        let first_page = written * layout.pages_per_block;
        let data = &mut data[..];
        for (page_index, page) in (first_page..).zip(data.chunks_exact_mut(layout.bytes_per_page)) {
            if !page.is_erased() {
                correct_pages(page, page_index, meta_type)?;
            }
        }
        let data: &[u8] = data;

        'find_block_and_write: loop {
            ensure!(
                block_index < layout.blocks,
                "image does not fit on the NAND ({} blocks)",
                layout.blocks
            );
            let block = nand.block(block_index)?;
            block_index += 1;
            rpt.inc();

            if let Some(mut block) = block {
                let outcome = retry(NoDelay.take(BLOCK_ATTEMPTS - 1), || {
                    match update_block(&mut block, data) {
                        Ok(()) => OperationResult::Ok(()),
                        Err(err) => match block.erase() {
                            Ok(()) => OperationResult::Retry(err),
                            Err(err) => OperationResult::Err(err),
                        },
                    }
                });

                if outcome.is_ok() {
                    break 'find_block_and_write;
                }

                // Block must have gone bad
                block.mark_bad()?;
            }

            // Block is bad; if we can't tolerate it, bail. Otherwise, loop to find a good one.
            ensure!(
                skip_bad,
                "unhandled bad block {} encountered",
                block_index - 1
            );
        }

        written += 1;
    }

    rpt.close();
    Ok(written)
}

/// Read the whole NAND out as a raw image. Bad blocks read as all zeroes, which carries a bad-block
/// marker in every spare layout.
pub fn read_image<N: Nand, W: Write>(nand: &mut N, write: &mut W) -> anyhow::Result<()> {
    let layout = nand.get_layout();
    let mut buf = vec![0; layout.block_size()];

    for index in 0..layout.blocks {
        match nand.block(index)? {
            None => buf.fill(0x00),
            Some(block) => block.read(0, &mut buf)?,
        }
        write.write_all(&buf)?;
    }

    Ok(())
}

#[cfg(test)]
fn test_image(blocks: usize, meta_type: MetaType) -> Vec<u8> {
    use crate::nand::TEST_LAYOUT;
    use crate::spare::codec::add_spare;
    use crate::PAGE_SIZE;

    let data: Vec<u8> = (0..blocks * TEST_LAYOUT.pages_per_block as usize * PAGE_SIZE)
        .map(|i| (i % 251) as u8)
        .collect();
    add_spare(&data, meta_type).unwrap()
}

#[test]
fn test_resume_point() -> anyhow::Result<()> {
    use crate::nand::{SimNand, TEST_LAYOUT};
    use crate::RAW_PAGE_SIZE;

    let image = test_image(1, MetaType::SmallBlock);
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut block = nand.block(0)?.unwrap();

    assert_eq!(resume_point(&block, &[]), Some(0));
    assert_eq!(resume_point(&block, &image), Some(0));

    block.program(0, &image[..10 * RAW_PAGE_SIZE])?;
    assert_eq!(resume_point(&block, &image), Some(10));
    assert_eq!(resume_point(&block, &image[..5 * RAW_PAGE_SIZE]), None);

    block.program(10, &image[10 * RAW_PAGE_SIZE..])?;
    assert_eq!(resume_point(&block, &image), Some(32));

    let mut other = image.clone();
    other[3 * RAW_PAGE_SIZE] ^= 1;
    assert_eq!(resume_point(&block, &other), None);
    Ok(())
}

#[test]
fn test_write_image() -> anyhow::Result<()> {
    use crate::ecc::verify_image;
    use crate::nand::{SimNand, TEST_LAYOUT};
    use crate::PAGE_SIZE;

    let expected = test_image(4, MetaType::BigOnSmall);

    // Damage the spare of a page; the writer puts it right
    let mut image = expected.clone();
    image[TEST_LAYOUT.block_size() + PAGE_SIZE + 1] = 0x55;
    image[TEST_LAYOUT.block_size() + PAGE_SIZE + 14] = 0x55;

    let mut nand = SimNand::new(TEST_LAYOUT);
    assert_eq!(write_image(&mut nand, &mut &image[..], MetaType::BigOnSmall, false)?, 4);

    let mut out = Vec::new();
    read_image(&mut nand, &mut out)?;
    assert_eq!(out[..expected.len()], expected[..]);
    assert!(out[expected.len()..].is_erased());
    assert!(verify_image(&out)?.is_empty());

    // Writing it again changes nothing
    assert_eq!(write_image(&mut nand, &mut &image[..], MetaType::BigOnSmall, false)?, 4);
    let mut again = Vec::new();
    read_image(&mut nand, &mut again)?;
    assert_eq!(again, out);
    Ok(())
}

#[test]
fn test_write_image_skip_bad() -> anyhow::Result<()> {
    use crate::nand::{SimNand, TEST_LAYOUT};
    use crate::spare::MetaData;
    use crate::RAW_PAGE_SIZE;

    let image = test_image(3, MetaType::SmallBlock);

    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.block(1)?.unwrap().mark_bad()?;
    assert!(write_image(&mut nand, &mut &image[..], MetaType::SmallBlock, false).is_err());

    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.block(1)?.unwrap().mark_bad()?;
    assert_eq!(write_image(&mut nand, &mut &image[..], MetaType::SmallBlock, true)?, 3);

    let mut out = Vec::new();
    read_image(&mut nand, &mut out)?;
    let block_size = TEST_LAYOUT.block_size();
    assert!(out[block_size..2 * block_size].iter().all(|&x| x == 0));
    assert_eq!(out[2 * block_size..3 * block_size], image[block_size..2 * block_size]);

    // The relocated block keeps the address of its position in the image
    let meta = MetaData::from_page(&out, 2 * 32, MetaType::SmallBlock)?;
    assert_eq!(meta.lba, 1);
    assert!(MetaData::from_page(&out, 32, MetaType::SmallBlock)?.is_bad());
    assert_eq!(out.len() % RAW_PAGE_SIZE, 0);
    Ok(())
}

#[test]
fn test_write_image_too_large() {
    use crate::nand::{SimNand, TEST_LAYOUT};

    let image = test_image(TEST_LAYOUT.blocks as usize + 1, MetaType::SmallBlock);
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(write_image(&mut nand, &mut &image[..], MetaType::SmallBlock, false).is_err());
}

#[test]
fn test_write_image_partial_page() {
    use crate::nand::{SimNand, TEST_LAYOUT};

    let image = test_image(1, MetaType::SmallBlock);
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(write_image(&mut nand, &mut &image[..100], MetaType::SmallBlock, false).is_err());
}
