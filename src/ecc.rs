//! The 26-bit error detection code ("ECD") stored at the end of every spare.
//!
//! The code is a bit-serial LFSR over the first 0x1066 bits of the raw page: the 512 bytes of user
//! data, the first 12 spare bytes, and the low 6 bits of spare byte 12 (the filesystem block
//! type). The remaining 26 bits of the spare hold the code itself.

use bytes::Buf;

use crate::error::{Error, Result};
use crate::nand::PageUtil;
use crate::RAW_PAGE_SIZE;
#[cfg(test)]
use crate::PAGE_SIZE;

pub const ECC_SIZE: usize = 4;

/// Offset of the ECC within the raw page
const ECC_OFFSET: usize = RAW_PAGE_SIZE - ECC_SIZE;

/// Number of page bits covered by the code
const ECC_BITS: usize = 0x1066;

const ECC_POLY: u32 = 0x0695_4559;

/// Bits of the first ECC byte that belong to the code; the rest is the filesystem block type
const ECC_BYTE0_MASK: u8 = 0xC0;

/// Compute the ECC of a raw page. Only the first [RAW_PAGE_SIZE] bytes of `page` are considered.
///
/// # Panics
///
/// If `page` is shorter than a raw page.
pub fn calc_ecc(page: &[u8]) -> [u8; ECC_SIZE] {
    let mut data = &page[..RAW_PAGE_SIZE];
    let mut val: u32 = 0;
    let mut v: u32 = 0;

    for i in 0..ECC_BITS {
        if i % 32 == 0 {
            v = !data.get_u32_le();
        }
        val ^= v & 1;
        v >>= 1;
        if val & 1 != 0 {
            val ^= ECC_POLY;
        }
        val >>= 1;
    }

    let val = !val;
    [
        (val << 6) as u8,
        (val >> 2) as u8,
        (val >> 10) as u8,
        (val >> 18) as u8,
    ]
}

/// Compute the ECC of the raw page beginning at `offset` within `buf`
pub fn calc_ecc_at(buf: &[u8], offset: usize) -> Result<[u8; ECC_SIZE]> {
    let page = buf
        .get(offset..)
        .filter(|page| page.len() >= RAW_PAGE_SIZE)
        .ok_or(Error::InvalidLength {
            len: buf.len().saturating_sub(offset),
            granularity: RAW_PAGE_SIZE,
        })?;
    Ok(calc_ecc(page))
}

/// Compute the ECC of a raw page and store it in the page's spare
///
/// The filesystem block type sharing the first ECC byte is preserved.
///
/// # Panics
///
/// If `page` is shorter than a raw page.
pub fn write_ecc(page: &mut [u8]) {
    let ecc = calc_ecc(page);
    let stored = &mut page[ECC_OFFSET..RAW_PAGE_SIZE];
    stored[0] = (stored[0] & !ECC_BYTE0_MASK) | ecc[0];
    stored[1..].copy_from_slice(&ecc[1..]);
}

/// Does the ECC stored in this raw page match its content?
///
/// # Panics
///
/// If `page` is shorter than a raw page.
pub fn check_ecc(page: &[u8]) -> bool {
    let ecc = calc_ecc(page);
    let stored = &page[ECC_OFFSET..RAW_PAGE_SIZE];
    stored[0] & ECC_BYTE0_MASK == ecc[0] && stored[1..] == ecc[1..]
}

/// Check every page of a raw image, returning the indices of pages whose ECC does not match.
///
/// Erased pages carry no ECC and are skipped.
pub fn verify_image(image: &[u8]) -> Result<Vec<u32>> {
    Error::check_len(image.len(), RAW_PAGE_SIZE)?;

    Ok(image
        .chunks_exact(RAW_PAGE_SIZE)
        .enumerate()
        .filter(|(_, page)| !page.is_erased() && !check_ecc(page))
        .map(|(index, _)| index as u32)
        .collect())
}

#[cfg(test)]
fn test_page() -> Vec<u8> {
    (0..RAW_PAGE_SIZE).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
fn test_known_values() {
    assert_eq!(calc_ecc(&[0u8; RAW_PAGE_SIZE]), [0x80, 0xF8, 0x6C, 0x77]);
    assert_eq!(calc_ecc(&[0xFFu8; RAW_PAGE_SIZE]), [0xC0, 0xFF, 0xFF, 0xFF]);
    assert_eq!(calc_ecc(&test_page()), [0x80, 0x27, 0x22, 0xAC]);

    let mut page = [0u8; RAW_PAGE_SIZE];
    page[PAGE_SIZE + 5] = 0xFF;
    assert_eq!(calc_ecc(&page), [0xC0, 0xB8, 0x88, 0x22]);
}

#[test]
fn test_calc_ecc_at() {
    let mut buf = vec![0xA5u8; 3];
    buf.extend(test_page());
    assert_eq!(calc_ecc_at(&buf, 3).unwrap(), calc_ecc(&test_page()));
    assert!(calc_ecc_at(&buf, 4).is_err());
    assert!(calc_ecc_at(&buf, buf.len() + 1).is_err());
}

#[test]
fn test_write_check() {
    let mut page = test_page();
    assert!(!check_ecc(&page));

    let block_type = page[ECC_OFFSET] & 0x3F;
    write_ecc(&mut page);
    assert!(check_ecc(&page));
    assert_eq!(page[ECC_OFFSET] & 0x3F, block_type);

    // The code is a function of the protected bits only
    let ecc = calc_ecc(&page);
    page[ECC_OFFSET + 1] ^= 0xFF;
    assert_eq!(calc_ecc(&page), ecc);
    assert!(!check_ecc(&page));
}

#[test]
fn test_erased_page_is_valid() {
    assert!(check_ecc(&[0xFFu8; RAW_PAGE_SIZE]));
}

#[test]
fn test_single_bit_sensitivity() {
    let mut page = test_page();
    write_ecc(&mut page);
    let ecc = calc_ecc(&page);

    for bit in 0..ECC_BITS {
        page[bit / 8] ^= 1 << (bit % 8);
        assert_ne!(calc_ecc(&page), ecc, "flipping bit {bit} went unnoticed");
        assert!(!check_ecc(&page));
        page[bit / 8] ^= 1 << (bit % 8);
    }
}

#[test]
fn test_verify_image() -> anyhow::Result<()> {
    let mut image = vec![0xFFu8; RAW_PAGE_SIZE * 4];
    for page in image.chunks_exact_mut(RAW_PAGE_SIZE).take(3) {
        page[..PAGE_SIZE].fill(0x11);
        write_ecc(page);
    }
    assert!(verify_image(&image)?.is_empty());

    image[RAW_PAGE_SIZE + 100] ^= 0x08;
    assert_eq!(verify_image(&image)?, [1]);

    assert!(verify_image(&image[1..]).is_err());
    Ok(())
}
