//! A command-line tool for inspecting and preparing raw NAND images.
//!
//! Images are raw dumps: 512-byte pages each followed by their 16-byte spare. Commands that need
//! to know the spare layout take `--meta-type`, and otherwise detect it from the image.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::{self, File};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};

use sfc_nand::{
    detect_meta_type, detect_meta_type_in,
    ecc::verify_image,
    flash::write_image,
    nand::{NandLayout, SimNand},
    scan::scan_blocks,
    spare::codec::{add_spare, correct_block, correct_image, strip_spare},
    Geometry, MetaData, MetaType, RAW_PAGE_SIZE,
};

/// Parse a config register value, in hex with or without a leading "0x"
fn parse_register(s: &str) -> Result<u32, ParseIntError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16)
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct LayoutOptions {
    /// The flash controller's config register, e.g. 0x00023010
    #[clap(long, value_parser = parse_register)]
    config: Option<u32>,

    /// Layout of the NAND, as BLOCKSxPAGES (pages per erase block)
    #[clap(long)]
    layout: Option<NandLayout>,
}

impl LayoutOptions {
    /// The NAND layout, and the meta type implied by the config register (if given)
    fn resolve(&self) -> Result<(NandLayout, Option<MetaType>)> {
        if let Some(layout) = self.layout {
            return Ok((layout, None));
        }

        let config = self.config.context("no layout given")?;
        let geometry = Geometry::decode(config)?;
        Ok((NandLayout::from(&geometry), Some(geometry.meta_type)))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a flash controller config register
    Geometry {
        #[clap(value_parser = parse_register)]
        config: u32,
    },

    /// Detect the spare layout of an image
    Detect { image: PathBuf },

    /// Print the spare fields of one page
    Spare {
        image: PathBuf,
        page: u32,

        #[clap(long)]
        meta_type: Option<MetaType>,
    },

    /// Add a spare to every page of a plain (512-byte page) image
    AddSpare {
        input: PathBuf,
        output: PathBuf,

        #[clap(long)]
        meta_type: MetaType,
    },

    /// Rewrite the addresses and ECCs of an image's spares, in place
    FixSpare {
        image: PathBuf,

        #[clap(long)]
        meta_type: Option<MetaType>,

        /// Only fix this (32-page) block
        #[clap(long)]
        block: Option<u32>,
    },

    /// Drop the spares of an image, leaving plain 512-byte pages
    StripSpare { input: PathBuf, output: PathBuf },

    /// List the pages whose ECC does not match
    Verify { image: PathBuf },

    /// Print a summary of the content of each erase block; this is a read-only operation
    Scan {
        image: PathBuf,

        #[clap(flatten)]
        layout: LayoutOptions,

        #[clap(long)]
        meta_type: Option<MetaType>,
    },

    /// Write an image onto a NAND image file, as the flasher would onto the device
    Write {
        /// The NAND image to modify (created erased if missing)
        target: PathBuf,

        /// The raw image to write
        source: PathBuf,

        #[clap(flatten)]
        layout: LayoutOptions,

        #[clap(long)]
        meta_type: Option<MetaType>,

        /// Whether to skip over (thereby tolerating) any bad blocks encountered
        #[clap(long)]
        skip_bad: bool,
    },
}

/// Use the given meta type, or else detect it from the image at `path`
fn meta_type_for(meta_type: Option<MetaType>, path: &Path) -> Result<MetaType> {
    match meta_type {
        Some(meta_type) => Ok(meta_type),
        None => {
            let mut file = File::open(path)?;
            detect_meta_type(&mut file)
                .with_context(|| format!("cannot detect meta type of {}", path.display()))
        }
    }
}

fn print_geometry(geometry: &Geometry) {
    println!("config:             {:#010x}", geometry.config);
    println!("controller type:    {}", geometry.controller_type);
    println!("block kind:         {}", geometry.block_kind);
    println!("meta type:          {}", u8::from(geometry.meta_type));
    println!("block size:         {:#x}", geometry.block_size);
    println!("pages per block:    {}", geometry.pages_per_block);
    println!("raw block size:     {:#x}", geometry.raw_block_size);
    println!("blocks:             {:#x}", geometry.total_blocks);
    println!("filesystem blocks:  {:#x}", geometry.fs_reserved_blocks);
    println!("small blocks:       {:#x}", geometry.small_block_count);
    println!("size:               {:#x} ({} MiB)", geometry.total_size, geometry.total_size >> 20);
    println!("raw size:           {:#x}", geometry.total_raw_size);
}

fn print_meta(meta: &MetaData) {
    println!("meta type:          {}", u8::from(meta.meta_type));
    println!("lba:                {:#x}", meta.lba);
    println!("bad block:          {:#04x}", meta.bad_block);
    println!("fs block type:      {:#04x}", meta.fs_block_type);
    println!("fs free pages:      {}", meta.fs_free_pages);
    println!("fs sequence:        {:#x}", meta.fs_sequence);
    println!("fs size:            {:#x}", meta.fs_size);
}

impl Command {
    fn execute(self) -> Result<()> {
        match self {
            Command::Geometry { config } => {
                let geometry = Geometry::decode(config)?;
                print_geometry(&geometry);
            }

            Command::Detect { image } => {
                let image = fs::read(image)?;
                let meta_type = detect_meta_type_in(&image)?;
                println!("meta type {} ({meta_type:?})", u8::from(meta_type));
            }

            Command::Spare {
                image,
                page,
                meta_type,
            } => {
                let meta_type = meta_type_for(meta_type, &image)?;
                let image = fs::read(image)?;
                print_meta(&MetaData::from_page(&image, page, meta_type)?);
            }

            Command::AddSpare {
                input,
                output,
                meta_type,
            } => {
                let data = fs::read(input)?;
                fs::write(output, add_spare(&data, meta_type)?)?;
            }

            Command::FixSpare {
                image: path,
                meta_type,
                block,
            } => {
                let meta_type = meta_type_for(meta_type, &path)?;
                let mut image = fs::read(&path)?;
                match block {
                    Some(block) => correct_block(&mut image, block, meta_type)?,
                    None => correct_image(&mut image, meta_type)?,
                }
                fs::write(path, image)?;
            }

            Command::StripSpare { input, output } => {
                let image = fs::read(input)?;
                fs::write(output, strip_spare(&image)?)?;
            }

            Command::Verify { image } => {
                let image = fs::read(image)?;
                let failing = verify_image(&image)?;
                for page in &failing {
                    println!("page {page:#x} (block {:#x}): ECC mismatch", page / 32);
                }
                println!(
                    "{} of {} pages failed",
                    failing.len(),
                    image.len() / RAW_PAGE_SIZE
                );
            }

            Command::Scan {
                image: path,
                layout,
                meta_type,
            } => {
                let (layout, implied) = layout.resolve()?;
                let meta_type = meta_type_for(meta_type.or(implied), &path)?;

                let mut nand = SimNand::new(layout);
                nand.load(&mut File::open(&path)?, meta_type)?;
                let bbt = scan_blocks(&mut nand, meta_type)?;

                for (i, content) in bbt.iter().enumerate() {
                    println!("{i:4} => {content:?}");
                }
            }

            Command::Write {
                target,
                source,
                layout,
                meta_type,
                skip_bad,
            } => {
                let (layout, implied) = layout.resolve()?;
                let meta_type = meta_type_for(meta_type.or(implied), &source)?;

                let mut nand = SimNand::new(layout);
                if target.exists() {
                    nand.load(&mut File::open(&target)?, meta_type)?;
                }

                let written = write_image(&mut nand, &mut File::open(&source)?, meta_type, skip_bad)?;
                nand.save(&mut File::create(&target)?)?;
                eprintln!("Wrote {written} blocks");
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    args.cmd.execute()
}
