//! This module contains code to scan NAND blocks and characterize their contents from the spare.

use crate::ecc::check_ecc;
use crate::nand::{Nand, NandBlock, PageUtil};
use crate::spare::{MetaData, MetaType};

/// These are the states that a given erase block may be detected in
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockContent {
    /// The device reports the block as bad, and it cannot be accessed
    Bad,

    /// The block is fully erased
    Erased,

    /// The block is readable, but its spare carries a bad-block marker
    Retired(MetaData),

    /// A written page of the block fails its ECC check
    Corrupt {
        /// Index of the first failing page within the block
        page: u32,
    },

    /// The block holds data; this is the metadata of its first page
    Data(MetaData),
}

impl BlockContent {
    /// Read a NAND block and characterize its content
    fn scan_block<B: NandBlock>(block: &B, meta_type: MetaType) -> anyhow::Result<Self> {
        let mut buf = vec![0; block.page_size() * block.page_count() as usize];
        block.read(0, &mut buf)?;

        let mut pages = buf.chunks_exact(block.page_size());
        let first = match pages.next() {
            Some(page) if !page.is_erased() => page,
            // An erased first page means nothing else was programmed (pages are written in order)
            _ => return Ok(Self::Erased),
        };

        let meta = MetaData::parse(first.spare(), meta_type)?;
        if meta.is_bad() {
            return Ok(Self::Retired(meta));
        }

        let failing = std::iter::once(first)
            .chain(pages)
            .position(|page| !page.is_erased() && !check_ecc(page));
        if let Some(page) = failing {
            return Ok(Self::Corrupt { page: page as u32 });
        }

        Ok(Self::Data(meta))
    }

    /// Is this block holding usable data?
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }
}

/// The (B)ad (b)lock (t)able: the state of every erase block as determined by [scan_blocks]
pub type Bbt = Box<[BlockContent]>;

/// Read all blocks of the NAND, return the [Bbt]
pub fn scan_blocks<N: Nand>(nand: &mut N, meta_type: MetaType) -> anyhow::Result<Bbt> {
    let block_count = nand.get_layout().blocks;
    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(u64::from(block_count));

    let mut bbt = Vec::with_capacity(block_count as usize);
    for index in 0..block_count {
        let content = match nand.block(index)? {
            None => BlockContent::Bad,
            Some(block) => BlockContent::scan_block(&block, meta_type)?,
        };
        rpt.inc();
        bbt.push(content);
    }

    rpt.close();

    Ok(bbt.into())
}

#[test]
fn test_scan() -> anyhow::Result<()> {
    use crate::nand::{SimNand, TEST_LAYOUT};
    use crate::spare::codec::add_spare;
    use crate::{BLOCK_SIZE, PAGE_SIZE, RAW_PAGE_SIZE};

    let meta_type = MetaType::BigOnSmall;
    let mut nand = SimNand::new(TEST_LAYOUT);

    // Confirm that, on a fresh NAND, every block scans as "erased"
    let blocks = scan_blocks(&mut nand, meta_type)?;
    assert_eq!(blocks.len(), TEST_LAYOUT.blocks as usize);
    assert!(blocks.iter().all(|&x| x == BlockContent::Erased));

    let image = add_spare(&vec![0xC3u8; BLOCK_SIZE * 5], meta_type)?;
    let block_image = |n: usize| &image[n * TEST_LAYOUT.block_size()..][..TEST_LAYOUT.block_size()];

    // 0: data, 1: bad, 2: retired, 3: corrupt at page 4, 4: half-written data, rest erased
    nand.block(0)?.unwrap().program(0, block_image(0))?;
    nand.block(1)?.unwrap().mark_bad()?;

    let mut retired = block_image(2).to_vec();
    retired[PAGE_SIZE + 5] = 0x00;
    nand.block(2)?.unwrap().program(0, &retired)?;

    let mut corrupt = block_image(3).to_vec();
    corrupt[4 * RAW_PAGE_SIZE + 17] ^= 0x40;
    nand.block(3)?.unwrap().program(0, &corrupt)?;

    nand.block(4)?
        .unwrap()
        .program(0, &block_image(4)[..16 * RAW_PAGE_SIZE])?;

    let blocks = scan_blocks(&mut nand, meta_type)?;

    let data = |n: usize| MetaData::from_page(&image, (n * 32) as u32, meta_type);
    assert_eq!(blocks[0], BlockContent::Data(data(0)?));
    assert_eq!(blocks[1], BlockContent::Bad);
    assert!(matches!(blocks[2], BlockContent::Retired(meta) if meta.lba == 2));
    assert_eq!(blocks[3], BlockContent::Corrupt { page: 4 });
    assert_eq!(blocks[4], BlockContent::Data(data(4)?));
    assert!(blocks[5..].iter().all(|&x| x == BlockContent::Erased));
    assert_eq!(blocks.iter().filter(|x| x.is_data()).count(), 2);

    Ok(())
}
