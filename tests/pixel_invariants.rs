//! Pixel-pipeline invariants exercised through the public API.

use framegrab::pixel::{checked_rgba_len, convert_bgra_to_rgba, swap_channels_inplace};
use framegrab::{ImageData, Region};

#[test]
fn in_place_swap_of_a_known_pixel() {
    let mut buf = [100u8, 150, 200, 255];
    swap_channels_inplace(&mut buf, 1);
    assert_eq!(buf, [200, 150, 100, 255]);
}

#[test]
fn conversion_produces_canonical_order() {
    // A BGRA source pixel {B, G, R, A} must appear as {R, G, B, A}.
    let src = [0x10u8, 0x20, 0x30, 0x40];
    let mut dst = [0u8; 4];
    convert_bgra_to_rgba(&src, &mut dst);
    assert_eq!(dst, [0x30, 0x20, 0x10, 0x40]);
}

#[test]
fn oversized_allocation_is_refused_with_a_named_operation() {
    let err = checked_rgba_len(usize::MAX / 4 + 1, 1).unwrap_err();
    assert!(err.to_string().contains("pixel buffer allocation"));
}

#[test]
fn delivered_image_size_matches_dimensions() {
    let image = ImageData::alloc(100, 100).unwrap();
    assert_eq!(image.pixels.len(), 100 * 100 * 4);
    assert_eq!(image.pixels.len(), 40_000);
}

#[test]
fn partially_off_screen_region_clamps_to_the_intersection() {
    let region = Region::new(-10.0, 1070.0, 50.0, 50.0);
    assert_eq!(region.clamp_to(1920, 1080), Some((0, 1070, 40, 10)));
}

#[test]
fn fully_off_screen_region_yields_nothing() {
    assert_eq!(Region::new(5000.0, 5000.0, 10.0, 10.0).clamp_to(1920, 1080), None);
}
