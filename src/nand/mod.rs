//! Abstractions over a NAND flash device that exposes raw pages (user data followed by spare).

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

use crate::geometry::Geometry;
use crate::spare::{MetaData, MetaType};
use crate::{PAGE_SIZE, RAW_PAGE_SIZE};

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// The spare of a raw page
    fn spare(&self) -> &[u8];
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }

    fn spare(&self) -> &[u8] {
        &self[PAGE_SIZE..RAW_PAGE_SIZE]
    }
}

/// A pub-fields struct describing the raw data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    /// Number of erase blocks
    pub blocks: u32,
    pub pages_per_block: u32,

    /// Bytes per page including the spare
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// Bytes per erase block including the spares
    pub fn block_size(&self) -> usize {
        self.pages_per_block as usize * self.bytes_per_page
    }
}

impl From<&Geometry> for NandLayout {
    fn from(geometry: &Geometry) -> Self {
        Self {
            blocks: geometry.total_blocks,
            pages_per_block: geometry.pages_per_block,
            bytes_per_page: geometry.page_size + geometry.spare_size,
        }
    }
}

/// Parse strings like "BLOCKSxPAGES", with raw 528-byte pages, or "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = s.split('x').collect();
        let (blocks, pages_per_block, bytes_per_page) = match fields.as_slice() {
            [blocks, pages] => (*blocks, *pages, None),
            [blocks, pages, bytes] => (*blocks, *pages, Some(*bytes)),
            _ => anyhow::bail!("expected #x# or #x#x#"),
        };

        let layout = NandLayout {
            blocks: blocks.parse()?,
            pages_per_block: pages_per_block.parse()?,
            bytes_per_page: bytes_per_page.map_or(Ok(RAW_PAGE_SIZE), str::parse)?,
        };
        ensure!(
            layout.bytes_per_page == RAW_PAGE_SIZE,
            "raw pages are {RAW_PAGE_SIZE} bytes"
        );
        Ok(layout)
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents an erase block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many raw bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of raw pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified raw pages, beginning at the specified page
    ///
    /// Pages must be programmed in ascending order: writing a page makes it and all skipped pages
    /// nonwritable until the next erase.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// A simulated in-memory NAND flash, for testing and for working on image files
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// An erase block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all programmed pages; only ever appended to until erased
    data: Vec<u8>,

    page_count: u32,
    page_size: usize,
    retired: bool,
}

impl SimNand {
    /// Create an erased SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    /// Fill the NAND from a raw image.
    ///
    /// A block whose first page is not erased and carries a bad-block marker (as laid out for
    /// `meta_type`) is retired, just as the controller would treat it.
    pub fn load<R: Read>(&mut self, read: &mut R, meta_type: MetaType) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for mut block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            block.data.clear();
            block.retired = false;

            let first_page = &buf[..block.page_size];
            if !first_page.is_erased() && MetaData::parse(first_page.spare(), meta_type)?.is_bad() {
                block.retired = true;
                continue;
            }

            block.program(0, &buf)?;
        }

        Ok(())
    }

    /// Write the whole NAND out as a raw image, the counterpart of [SimNand::load]
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        crate::flash::read_image(self, write)
    }
}

impl SimBlock {
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            retired: false,
        }
    }

    fn check_page(&self, index: u32, content: &[u8]) -> anyhow::Result<usize> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page {index} out of bounds");
        Ok(index as usize * self.page_size)
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        let begin = self.check_page(index, content)?;
        ensure!(begin >= self.data.len(), "page {index} already programmed");

        // Programming all-1s leaves the page erased
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let begin = self.check_page(index, content)?;

        match self.data.get(begin..begin + self.page_size) {
            Some(page) => content.copy_from_slice(page),
            None => content.fill(0xFF),
        }

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|block| Some(block).filter(|block| !block.retired))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        for (page, chunk) in (start_page..).zip(content.chunks_mut(self.page_size)) {
            self.read_page(page, chunk)?;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        for (page, chunk) in (start_page..).zip(content.chunks(self.page_size)) {
            self.write_page(page, chunk)?;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        self.data.clear();
        Ok(())
    }

    fn mark_bad(mut self) -> anyhow::Result<()> {
        self.erase()?;
        self.retired = true;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 32,
    bytes_per_page: RAW_PAGE_SIZE,
};

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    assert_eq!("8x32".parse::<NandLayout>()?, TEST_LAYOUT);
    assert_eq!("8x32x528".parse::<NandLayout>()?, TEST_LAYOUT);
    assert!("8x32x512".parse::<NandLayout>().is_err());
    assert!("8".parse::<NandLayout>().is_err());
    assert!("8xyx528".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_layout_from_geometry() -> anyhow::Result<()> {
    let geometry = Geometry::decode(0x10)?;
    let layout = NandLayout::from(&geometry);
    assert_eq!(layout.blocks, 0x400);
    assert_eq!(layout.pages_per_block, 32);
    assert_eq!(layout.block_size(), 0x4200);
    Ok(())
}

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.block(3).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(3).unwrap().is_none());
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0x5Au8; RAW_PAGE_SIZE];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0)?.unwrap();
    block.program(2, &data_in)?;
    assert!(block.program(1, &data_in).is_err());

    block.read(1, &mut data_out)?;
    assert!(data_out.is_erased());

    block.read(2, &mut data_out)?;
    assert_eq!(data_out, data_in);

    block.erase()?;
    block.read(2, &mut data_out)?;
    assert!(data_out.is_erased());
    Ok(())
}

#[test]
fn test_sim_load_save() -> anyhow::Result<()> {
    use crate::spare::codec::add_spare;

    let data = vec![0x33u8; TEST_LAYOUT.blocks as usize * 32 * PAGE_SIZE];
    let mut image = add_spare(&data, MetaType::SmallBlock)?;

    // Retire block 2 through its spare
    image[2 * TEST_LAYOUT.block_size() + PAGE_SIZE + 5] = 0x00;

    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut &image[..], MetaType::SmallBlock)?;
    assert!(nand.block(2)?.is_none());

    let mut page = vec![0; RAW_PAGE_SIZE];
    nand.block(1)?.unwrap().read(0, &mut page)?;
    assert_eq!(page, image[TEST_LAYOUT.block_size()..][..RAW_PAGE_SIZE]);

    let mut saved = Vec::new();
    nand.save(&mut saved)?;
    assert_eq!(saved.len(), image.len());
    assert_eq!(saved[..2 * TEST_LAYOUT.block_size()], image[..2 * TEST_LAYOUT.block_size()]);
    assert!(saved[2 * TEST_LAYOUT.block_size()..][..TEST_LAYOUT.block_size()]
        .iter()
        .all(|&x| x == 0));
    Ok(())
}
