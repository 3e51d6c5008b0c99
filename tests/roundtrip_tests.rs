//! Encode then decode through one sandbox, for each pixel format and for
//! the metadata the encoder carries (palette alpha, color keys, profiles,
//! pass-through chunks).

mod common;

use common::{chunk_data, chunk_types, decode_bytes, encode_bytes, sandbox};
use pngbox::{
    Chromaticities, Chunk, ChunkLocation, ChunkStore, ColorProfile, EncodeOptions, GrayAlpha, Image, ImgVec,
    Palette, PixelFormat, Rgb, Rgba, TransparentColorKey,
};

fn rgba_image(format: PixelFormat, pixels: Vec<Rgba<u8>>, width: usize, height: usize) -> Image {
    Image::new(format, ImgVec::new(pixels, width, height).into())
}

fn gray_image(format: PixelFormat, pixels: Vec<GrayAlpha<u8>>, width: usize, height: usize) -> Image {
    Image::new(format, ImgVec::new(pixels, width, height).into())
}

fn gradient(width: usize, height: usize, alpha: impl Fn(usize) -> u8) -> Vec<Rgba<u8>> {
    (0..width * height)
        .map(|i| Rgba::new((i * 7) as u8, (i * 13) as u8, (i * 29) as u8, alpha(i)))
        .collect()
}

// =============================================================================
// Pixel formats
// =============================================================================

#[test]
fn two_by_two_rgba_keeps_every_sample() {
    let sb = sandbox();
    let pixels = vec![
        Rgba::new(255, 0, 0, 255),
        Rgba::new(0, 255, 0, 255),
        Rgba::new(0, 0, 255, 255),
        Rgba::new(0, 0, 0, 0),
    ];
    let image = rgba_image(PixelFormat::Rgba, pixels.clone(), 2, 2);
    let (bytes, written) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(written.format(), PixelFormat::Rgba);
    assert_eq!(written.bytes_written(), bytes.len() as u64);
    assert_eq!(&bytes[..8], &common::SIGNATURE);

    let decoded = decode_bytes(&sb, &bytes).unwrap();
    assert!(decoded.is_complete());
    let out = decoded.image();
    assert_eq!(out.format, PixelFormat::Rgba);
    assert!(out.has_alpha);
    assert_eq!((out.width(), out.height()), (2, 2));
    let got: Vec<_> = out.pixels.as_rgba8().unwrap().pixels().collect();
    assert_eq!(got, pixels);
}

#[test]
fn opaque_rgb_decodes_with_full_alpha() {
    let sb = sandbox();
    let pixels = gradient(5, 3, |_| 255);
    let image = rgba_image(PixelFormat::Rgb, pixels.clone(), 5, 3);
    let (bytes, written) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(written.format(), PixelFormat::Rgb);

    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert_eq!(out.format, PixelFormat::Rgb);
    assert!(!out.has_alpha);
    assert!(out.transparent_key.is_none());
    let got: Vec<_> = out.pixels.as_rgba8().unwrap().pixels().collect();
    assert_eq!(got, pixels);
}

#[test]
fn rgb_with_alpha_flag_is_written_as_rgba() {
    let sb = sandbox();
    let pixels = gradient(4, 4, |i| if i == 5 { 100 } else { 255 });
    let image = rgba_image(PixelFormat::Rgb, pixels.clone(), 4, 4).with_alpha(true);
    let (bytes, written) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(written.format(), PixelFormat::Rgba);

    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert_eq!(out.format, PixelFormat::Rgba);
    let got: Vec<_> = out.pixels.as_rgba8().unwrap().pixels().collect();
    assert_eq!(got, pixels);
}

#[test]
fn grayscale_and_gray_alpha_round_trip() {
    let sb = sandbox();
    let gray: Vec<_> = (0..12u8).map(|v| GrayAlpha::new(v * 20, 255)).collect();
    let image = gray_image(PixelFormat::Grayscale, gray.clone(), 4, 3);
    let (bytes, written) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(written.format(), PixelFormat::Grayscale);
    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert_eq!(out.format, PixelFormat::Grayscale);
    assert!(!out.has_alpha);
    let got: Vec<_> = out.pixels.as_gray_alpha8().unwrap().pixels().collect();
    assert_eq!(got, gray);

    let with_alpha: Vec<_> = (0..12u8).map(|v| GrayAlpha::new(v * 20, 255 - v)).collect();
    let image = gray_image(PixelFormat::GrayscaleAlpha, with_alpha.clone(), 3, 4);
    let (bytes, written) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(written.format(), PixelFormat::GrayscaleAlpha);
    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert_eq!(out.format, PixelFormat::GrayscaleAlpha);
    assert!(out.has_alpha);
    let got: Vec<_> = out.pixels.as_gray_alpha8().unwrap().pixels().collect();
    assert_eq!(got, with_alpha);
}

#[test]
fn indexed_keeps_palette_and_indices() {
    let sb = sandbox();
    let palette = Palette::opaque([Rgb::new(255, 0, 0), Rgb::new(0, 255, 0), Rgb::new(0, 0, 255)]);
    let indices = vec![0u8, 1, 2, 2, 1, 0];
    let image = Image::new(PixelFormat::Indexed, ImgVec::new(indices.clone(), 3, 2).into())
        .with_palette(palette.clone());
    let (bytes, written) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(written.format(), PixelFormat::Indexed);
    assert!(chunk_data(&bytes, b"tRNS").is_none());

    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert_eq!(out.format, PixelFormat::Indexed);
    assert!(!out.has_alpha);
    assert_eq!(out.palette.as_ref().unwrap().entries, palette.entries);
    assert_eq!(out.palette.as_ref().unwrap().mask_index, None);
    let got: Vec<_> = out.pixels.as_indexed8().unwrap().pixels().collect();
    assert_eq!(got, indices);
}

#[test]
fn palette_mask_becomes_transparent() {
    let sb = sandbox();
    let palette = Palette::opaque([Rgb::new(9, 9, 9), Rgb::new(200, 100, 50)]).with_mask_index(1);
    let image = Image::new(PixelFormat::Indexed, ImgVec::new(vec![0u8, 1, 1, 0], 2, 2).into()).with_palette(palette);
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(chunk_data(&bytes, b"tRNS").unwrap(), &[255, 0]);

    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert!(out.has_alpha);
    let palette = out.palette.unwrap();
    assert_eq!(palette.entries[1], Rgba::new(200, 100, 50, 0));
    assert_eq!(palette.mask_index, Some(1));
}

#[test]
fn visible_background_keeps_mask_entry_opaque() {
    let sb = sandbox();
    let palette = Palette::opaque([Rgb::new(1, 2, 3), Rgb::new(4, 5, 6)]).with_mask_index(0);
    let image = Image::new(PixelFormat::Indexed, ImgVec::new(vec![0u8, 1], 2, 1).into())
        .with_palette(palette)
        .with_background(true);
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert!(chunk_data(&bytes, b"tRNS").is_none());

    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert!(!out.has_alpha);
    assert_eq!(out.palette.unwrap().entries[0], Rgba::new(1, 2, 3, 255));
}

#[test]
fn translucent_palette_entries_survive() {
    let sb = sandbox();
    let palette = Palette {
        entries: vec![Rgba::new(0, 0, 0, 255), Rgba::new(50, 60, 70, 128), Rgba::new(1, 1, 1, 255)],
        mask_index: None,
    };
    let image = Image::new(PixelFormat::Indexed, ImgVec::new(vec![2u8, 1, 0], 3, 1).into()).with_palette(palette);
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert!(out.has_alpha);
    let palette = out.palette.unwrap();
    assert_eq!(palette.entries[1].a, 128);
    assert_eq!(palette.mask_index, None);
}

#[test]
fn empty_palette_is_padded_to_one_entry() {
    let sb = sandbox();
    let image = Image::new(PixelFormat::Indexed, ImgVec::new(vec![0u8; 4], 2, 2).into()).with_palette(Palette::default());
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(chunk_data(&bytes, b"PLTE").unwrap(), &[0, 0, 0]);
    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert_eq!(out.palette.unwrap().len(), 1);
}

// =============================================================================
// Color keys
// =============================================================================

#[test]
fn rgb_key_is_written_and_marks_matching_pixels() {
    let sb = sandbox();
    let key = Rgb::new(10, 20, 30);
    let pixels = vec![
        Rgba::new(10, 20, 30, 255),
        Rgba::new(1, 2, 3, 255),
        Rgba::new(10, 20, 31, 255),
        Rgba::new(10, 20, 30, 255),
    ];
    let image = rgba_image(PixelFormat::Rgb, pixels, 2, 2)
        .with_alpha(true)
        .with_transparent_key(TransparentColorKey::Rgb(key));
    let (bytes, written) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(written.format(), PixelFormat::Rgb);
    assert_eq!(chunk_data(&bytes, b"tRNS").unwrap(), &[0, 10, 0, 20, 0, 30]);

    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert_eq!(out.format, PixelFormat::Rgb);
    assert!(out.has_alpha);
    assert_eq!(out.transparent_key, Some(TransparentColorKey::Rgb(key)));
    let alpha: Vec<u8> = out.pixels.as_rgba8().unwrap().pixels().map(|p| p.a).collect();
    assert_eq!(alpha, [0, 255, 255, 0]);
}

#[test]
fn unmatched_key_leaves_image_opaque() {
    let sb = sandbox();
    let image = gray_image(PixelFormat::Grayscale, vec![GrayAlpha::new(5, 255); 6], 3, 2)
        .with_transparent_key(TransparentColorKey::Gray(200));
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert_eq!(out.transparent_key, Some(TransparentColorKey::Gray(200)));
    assert!(!out.has_alpha);
    assert!(!out.pixels.any_translucent());
}

#[test]
fn gray_key_marks_matching_pixels() {
    let sb = sandbox();
    let pixels = vec![GrayAlpha::new(7, 255), GrayAlpha::new(8, 255), GrayAlpha::new(7, 255)];
    let image = gray_image(PixelFormat::Grayscale, pixels, 3, 1).with_transparent_key(TransparentColorKey::Gray(7));
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(chunk_data(&bytes, b"tRNS").unwrap(), &[0, 7]);
    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert!(out.has_alpha);
    let alpha: Vec<u8> = out.pixels.as_gray_alpha8().unwrap().pixels().map(|p| p.a).collect();
    assert_eq!(alpha, [0, 255, 0]);
}

// =============================================================================
// Single alpha pixel
// =============================================================================

#[test]
fn forced_alpha_marks_bottom_right_pixel() {
    let sb = sandbox();
    let pixels = gradient(3, 2, |_| 255);
    let image = rgba_image(PixelFormat::Rgb, pixels.clone(), 3, 2);
    let options = EncodeOptions::default().with_force_single_alpha_pixel(true);
    let (bytes, written) = encode_bytes(&sb, &image, options);
    assert_eq!(written.format(), PixelFormat::Rgba);

    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    assert_eq!(out.format, PixelFormat::Rgba);
    assert!(out.has_alpha);
    let got: Vec<_> = out.pixels.as_rgba8().unwrap().pixels().collect();
    assert_eq!(&got[..5], &pixels[..5]);
    assert_eq!(got[5].a, 254);
    assert_eq!((got[5].r, got[5].g, got[5].b), (pixels[5].r, pixels[5].g, pixels[5].b));
}

#[test]
fn forced_alpha_leaves_translucent_rows_alone() {
    let sb = sandbox();
    let pixels = vec![Rgba::new(1, 1, 1, 255), Rgba::new(2, 2, 2, 40), Rgba::new(3, 3, 3, 255)];
    let image = rgba_image(PixelFormat::Rgba, pixels.clone(), 3, 1);
    let options = EncodeOptions::default().with_force_single_alpha_pixel(true);
    let (bytes, _) = encode_bytes(&sb, &image, options);
    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    let got: Vec<_> = out.pixels.as_rgba8().unwrap().pixels().collect();
    assert_eq!(got, pixels);
}

#[test]
fn forced_alpha_promotes_indexed_to_rgba() {
    let sb = sandbox();
    let palette = Palette::opaque([Rgb::new(10, 0, 0), Rgb::new(0, 10, 0)]);
    let image = Image::new(PixelFormat::Indexed, ImgVec::new(vec![0u8, 1, 1, 0], 2, 2).into()).with_palette(palette);
    let options = EncodeOptions::default().with_force_single_alpha_pixel(true);
    let (bytes, written) = encode_bytes(&sb, &image, options);
    assert_eq!(written.format(), PixelFormat::Rgba);
    assert!(chunk_data(&bytes, b"PLTE").is_none());

    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    let got: Vec<_> = out.pixels.as_rgba8().unwrap().pixels().collect();
    assert_eq!(got[0], Rgba::new(10, 0, 0, 255));
    assert_eq!(got[1], Rgba::new(0, 10, 0, 255));
    assert_eq!(got[3], Rgba::new(10, 0, 0, 254));
}

#[test]
fn forced_alpha_on_gray_writes_gray_alpha() {
    let sb = sandbox();
    let image = gray_image(PixelFormat::Grayscale, vec![GrayAlpha::new(90, 255); 4], 2, 2);
    let options = EncodeOptions::default().with_force_single_alpha_pixel(true);
    let (bytes, written) = encode_bytes(&sb, &image, options);
    assert_eq!(written.format(), PixelFormat::GrayscaleAlpha);
    let out = decode_bytes(&sb, &bytes).unwrap().into_image();
    let alpha: Vec<u8> = out.pixels.as_gray_alpha8().unwrap().pixels().map(|p| p.a).collect();
    assert_eq!(alpha, [255, 255, 255, 254]);
}

// =============================================================================
// Color profiles
// =============================================================================

fn tiny_rgb() -> Image {
    rgba_image(PixelFormat::Rgb, gradient(2, 2, |_| 255), 2, 2)
}

#[test]
fn icc_profile_round_trips_with_name() {
    let sb = sandbox();
    let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    let profile = ColorProfile::Icc {
        name: "Display P3".to_owned(),
        data: data.clone(),
    };
    let image = tiny_rgb().with_color_profile(profile.clone());
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert!(chunk_data(&bytes, b"iCCP").unwrap().starts_with(b"Display P3\0\0"));

    let decoded = decode_bytes(&sb, &bytes).unwrap();
    assert!(decoded.has_embedded_profile());
    assert_eq!(decoded.image().color_profile, profile);
}

#[test]
fn profile_is_dropped_without_preserve() {
    let sb = sandbox();
    let image = tiny_rgb().with_color_profile(ColorProfile::Icc {
        name: "x".to_owned(),
        data: vec![1, 2, 3],
    });
    let options = EncodeOptions::default().with_preserve_color_profile(false);
    let (bytes, _) = encode_bytes(&sb, &image, options);
    assert!(chunk_data(&bytes, b"iCCP").is_none());

    let decoded = decode_bytes(&sb, &bytes).unwrap();
    assert!(!decoded.has_embedded_profile());
    assert_eq!(decoded.image().color_profile, ColorProfile::SRGB);
}

#[test]
fn srgb_marker_round_trips() {
    let sb = sandbox();
    let image = tiny_rgb().with_color_profile(ColorProfile::SRGB);
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert!(chunk_data(&bytes, b"sRGB").is_some());
    let decoded = decode_bytes(&sb, &bytes).unwrap();
    assert!(decoded.has_embedded_profile());
    assert_eq!(decoded.image().color_profile, ColorProfile::SRGB);
}

#[test]
fn bare_gamma_round_trips() {
    let sb = sandbox();
    let image = tiny_rgb().with_color_profile(ColorProfile::Srgb { gamma: Some(1.8) });
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert!(chunk_data(&bytes, b"sRGB").is_none());
    let decoded = decode_bytes(&sb, &bytes).unwrap();
    let ColorProfile::Srgb { gamma: Some(gamma) } = decoded.image().color_profile else {
        panic!("expected a gamma-only profile, got {:?}", decoded.image().color_profile);
    };
    assert!((gamma - 1.8).abs() < 1e-3, "gamma {gamma}");
}

#[test]
fn chromaticities_without_gamma_round_trip() {
    let sb = sandbox();
    let image = tiny_rgb().with_color_profile(ColorProfile::RgbPrimaries {
        primaries: Chromaticities::SRGB,
        gamma: None,
    });
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert!(chunk_data(&bytes, b"cHRM").is_some());
    assert!(chunk_data(&bytes, b"gAMA").is_none());

    let decoded = decode_bytes(&sb, &bytes).unwrap();
    let ColorProfile::RgbPrimaries { primaries, gamma } = decoded.image().color_profile else {
        panic!("expected primaries, got {:?}", decoded.image().color_profile);
    };
    assert_eq!(gamma, None);
    assert!((primaries.red_x - 0.64).abs() < 1e-5);
    assert!((primaries.white_y - 0.3290).abs() < 1e-5);
}

#[test]
fn missing_profile_uses_document_profile() {
    let sb = sandbox();
    let (bytes, _) = encode_bytes(&sb, &tiny_rgb(), EncodeOptions::default());
    let document = ColorProfile::Srgb { gamma: Some(2.2) };
    let mut input = bytes.as_slice();
    let decoded = pngbox::DecoderConfig::new()
        .job()
        .with_document_profile(&document)
        .decode_from(&sb, &mut input)
        .unwrap();
    assert!(!decoded.has_embedded_profile());
    assert_eq!(decoded.image().color_profile, document);
}

// =============================================================================
// Pass-through chunks
// =============================================================================

#[test]
fn unknown_chunks_replay_in_order_and_place() {
    let sb = sandbox();
    let chunks: ChunkStore = [
        Chunk::new(*b"prVa", ChunkLocation::BeforePalette, b"first".to_vec()),
        Chunk::new(*b"prVb", ChunkLocation::BeforePalette, vec![0, 1, 2, 255]),
        Chunk::new(*b"prVc", ChunkLocation::AfterImageData, Vec::new()),
    ]
    .into_iter()
    .map(Option::unwrap)
    .collect();
    let image = tiny_rgb().with_chunks(chunks.clone());
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());

    let types = chunk_types(&bytes);
    let pos = |kind: &[u8; 4]| types.iter().position(|t| t == kind).unwrap();
    assert!(pos(b"IHDR") < pos(b"prVa"));
    assert!(pos(b"prVa") < pos(b"prVb"));
    assert!(pos(b"prVb") < pos(b"IDAT"));
    assert!(pos(b"IDAT") < pos(b"prVc"));
    assert!(pos(b"prVc") < pos(b"IEND"));

    let decoded = decode_bytes(&sb, &bytes).unwrap();
    assert_eq!(decoded.image().chunks, chunks);

    // Without the defaulted profile, a second pass writes the same file.
    let mut image = decoded.into_image();
    image.color_profile = ColorProfile::None;
    let (again, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    assert_eq!(again, bytes);
}

#[test]
fn chunks_between_palette_and_data_keep_their_place() {
    let sb = sandbox();
    let chunk = Chunk::new(*b"ruLe", ChunkLocation::BeforeImageData, b"mid".to_vec()).unwrap();
    let image = Image::new(PixelFormat::Indexed, ImgVec::new(vec![0u8], 1, 1).into())
        .with_palette(Palette::opaque([Rgb::new(3, 3, 3)]))
        .with_chunks([chunk.clone()].into_iter().collect());
    let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
    let types = chunk_types(&bytes);
    let pos = |kind: &[u8; 4]| types.iter().position(|t| t == kind).unwrap();
    assert!(pos(b"PLTE") < pos(b"ruLe"));
    assert!(pos(b"ruLe") < pos(b"IDAT"));

    let decoded = decode_bytes(&sb, &bytes).unwrap();
    let back: Vec<_> = decoded.image().chunks.iter().cloned().collect();
    assert_eq!(back, [chunk]);
}

// =============================================================================
// Domain bookkeeping
// =============================================================================

#[test]
fn sessions_leave_no_allocations_or_callbacks() {
    let sb = sandbox();
    let image = rgba_image(PixelFormat::Rgba, gradient(7, 5, |i| (i * 9) as u8), 7, 5);
    for _ in 0..3 {
        let (bytes, _) = encode_bytes(&sb, &image, EncodeOptions::default());
        assert_eq!(sb.stats().live(), 0);
        assert_eq!(sb.active_callbacks(), 0);
        assert!(!sb.session_active());

        decode_bytes(&sb, &bytes).unwrap();
        assert_eq!(sb.stats().live(), 0);
        assert_eq!(sb.active_callbacks(), 0);
        assert!(!sb.session_active());
    }
    assert!(!sb.is_poisoned());
}

#[test]
fn progress_reaches_one() {
    let sb = sandbox();
    let image = rgba_image(PixelFormat::Rgb, gradient(3, 4, |_| 255), 3, 4);
    let seen = std::cell::RefCell::new(Vec::new());
    let record = |fraction: f64| seen.borrow_mut().push(fraction);

    let mut bytes = Vec::new();
    pngbox::EncoderConfig::new()
        .job()
        .with_progress(&record)
        .encode_to(&sb, &image, &mut bytes)
        .unwrap();
    assert_eq!(seen.borrow().len(), 4);
    assert_eq!(seen.borrow().last().copied(), Some(1.0));

    seen.borrow_mut().clear();
    let mut input = bytes.as_slice();
    pngbox::DecoderConfig::new()
        .job()
        .with_progress(&record)
        .decode_from(&sb, &mut input)
        .unwrap();
    let seen = seen.into_inner();
    assert_eq!(seen.len(), 4);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last().copied(), Some(1.0));
}
