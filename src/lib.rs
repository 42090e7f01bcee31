//! Tools for raw NAND images taken from the console's serial flash controller (SFC).
//!
//! Every 512-byte page of these images is followed by a 16-byte spare area carrying a logical
//! block address, a bad-block marker, some filesystem bookkeeping, and a 26-bit ECC. Where those
//! fields sit inside the spare depends on the hardware generation (the "meta type"), which can be
//! derived from the controller's config register ([geometry]) or guessed from an image
//! ([detect]).
//!
//! The [ecc], [spare], [geometry] and [detect] modules are pure functions over caller-owned
//! buffers. The [nand], [flash] and [scan] modules build on them to drive a flash device.

pub mod detect;
pub mod ecc;
pub mod error;
pub mod flash;
pub mod geometry;
pub mod nand;
pub mod scan;
pub mod spare;

pub use detect::{detect_meta_type, detect_meta_type_in};
pub use error::{Error, Result};
pub use geometry::{Geometry, GeometryError};
pub use spare::{MetaData, MetaType};

/// Bytes of user data in a page
pub const PAGE_SIZE: usize = 0x200;

/// Bytes of spare ("out-of-band") data following each page
pub const SPARE_SIZE: usize = 0x10;

/// Bytes of a page as it appears in a raw image: user data and spare
pub const RAW_PAGE_SIZE: usize = PAGE_SIZE + SPARE_SIZE;

/// Pages sharing one logical address on small-block parts
pub const PAGES_PER_BLOCK: usize = 32;

/// Bytes of user data in a (small) block
pub const BLOCK_SIZE: usize = PAGE_SIZE * PAGES_PER_BLOCK;

/// Bytes of a (small) block as it appears in a raw image
pub const RAW_BLOCK_SIZE: usize = RAW_PAGE_SIZE * PAGES_PER_BLOCK;
