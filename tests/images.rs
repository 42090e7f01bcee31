//! End-to-end checks over whole images: generate, damage, repair, detect, write, scan.

use pretty_assertions::assert_eq;

use sfc_nand::{
    detect_meta_type_in,
    ecc::{check_ecc, verify_image},
    flash::{read_image, write_image},
    nand::{NandLayout, SimNand},
    scan::{scan_blocks, BlockContent},
    spare::codec::{add_spare, correct_image, strip_spare},
    Error, Geometry, MetaData, MetaType, BLOCK_SIZE, PAGE_SIZE, RAW_BLOCK_SIZE, RAW_PAGE_SIZE,
};

const META_TYPES: [MetaType; 3] = [
    MetaType::SmallBlock,
    MetaType::BigOnSmall,
    MetaType::BigBlock,
];

fn user_data(blocks: usize) -> Vec<u8> {
    (0..blocks * BLOCK_SIZE)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).to_be_bytes()[0])
        .collect()
}

#[test]
fn generated_images_round_trip() -> anyhow::Result<()> {
    let data = user_data(24);

    for meta_type in META_TYPES {
        let image = add_spare(&data, meta_type)?;
        assert_eq!(image.len(), data.len() / PAGE_SIZE * RAW_PAGE_SIZE);
        assert!(verify_image(&image)?.is_empty());
        assert_eq!(detect_meta_type_in(&image)?, meta_type);
        assert_eq!(strip_spare(&image)?, data);

        for page in [0u32, 31, 32, 300, 767] {
            let meta = MetaData::from_page(&image, page, meta_type)?;
            assert_eq!(meta.lba, meta_type.lba_for_page(page)?);
        }
    }
    Ok(())
}

#[test]
fn repair_is_idempotent() -> anyhow::Result<()> {
    for meta_type in META_TYPES {
        let mut image = add_spare(&user_data(8), meta_type)?;

        // Corrupt the user data of a page; repair re-seals it rather than reporting it
        image[5 * RAW_PAGE_SIZE + 3] ^= 0x01;
        assert_eq!(verify_image(&image)?, [5]);

        correct_image(&mut image, meta_type)?;
        let once = image.clone();
        correct_image(&mut image, meta_type)?;
        assert_eq!(image, once);
        assert!(image.chunks_exact(RAW_PAGE_SIZE).all(check_ecc));
    }
    Ok(())
}

#[test]
fn blank_media_is_rejected() {
    let image = vec![0xFFu8; RAW_BLOCK_SIZE * 8];
    assert!(matches!(detect_meta_type_in(&image), Err(Error::BlankImage)));
}

#[test]
fn flash_from_config_register() -> anyhow::Result<()> {
    // A 16 MiB part on the newer controller: meta type 1
    let geometry = Geometry::decode((1 << 17) | (1 << 4))?;
    assert_eq!(geometry.meta_type, MetaType::BigOnSmall);

    // Only simulate the first few blocks of the part
    let layout = NandLayout {
        blocks: 16,
        ..NandLayout::from(&geometry)
    };
    let image = add_spare(&user_data(10), geometry.meta_type)?;

    let mut nand = SimNand::new(layout);
    assert_eq!(write_image(&mut nand, &mut &image[..], geometry.meta_type, false)?, 10);

    let bbt = scan_blocks(&mut nand, geometry.meta_type)?;
    for (block, content) in bbt.iter().enumerate() {
        match content {
            BlockContent::Data(meta) => assert_eq!(usize::from(meta.lba), block),
            content => {
                assert!(block >= 10);
                assert_eq!(*content, BlockContent::Erased);
            }
        }
    }

    let mut dump = Vec::new();
    read_image(&mut nand, &mut dump)?;
    assert_eq!(&dump[..image.len()], &image[..]);
    assert_eq!(detect_meta_type_in(&dump)?, MetaType::BigOnSmall);
    Ok(())
}
