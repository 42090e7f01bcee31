use std::io;

use thiserror::Error;

use crate::geometry::GeometryError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the spare codec, the reader, and the meta type detector.
///
/// None of these are retryable: they describe the shape or content of the bytes handed in.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The buffer is not made of whole pages (or whole blocks, where those are required)
    #[error("buffer of {len:#x} bytes is not a multiple of {granularity:#x}")]
    InvalidLength { len: usize, granularity: usize },

    #[error("block {block} out of range (image has {blocks} blocks)")]
    BlockOutOfRange { block: u32, blocks: u32 },

    #[error("page {page} out of range (image has {pages} pages)")]
    PageOutOfRange { page: u32, pages: u32 },

    /// The logical address field is 12 bits wide
    #[error("page {page} would need logical address {lba:#x}, beyond {max:#x}", max = crate::spare::MAX_LBA)]
    ImageTooLarge { page: u32, lba: u32 },

    /// Only meta types 0, 1 and 2 exist
    #[error("unsupported meta type {0}")]
    UnsupportedMetaType(u8),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// The first spare of the image is erased, so there is nothing to classify
    #[error("image is blank")]
    BlankImage,

    /// None of the meta type heuristics matched
    #[error("image not recognized")]
    UnrecognizedImage,

    #[error("I/O error reading image")]
    Io(#[from] io::Error),
}

impl Error {
    /// Ensure that `len` is a whole multiple of `granularity`
    pub(crate) fn check_len(len: usize, granularity: usize) -> Result<()> {
        if len % granularity == 0 {
            Ok(())
        } else {
            Err(Self::InvalidLength { len, granularity })
        }
    }
}
