use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, ImageDecoder, ImageReader, RgbImage};
use std::io::Cursor;
use std::path::Path;

use crate::engine::SkipReason;

/// Loads a source image, applies its EXIF orientation and flattens it onto
/// white RGB. Failures come back as the skip reason the batch records.
pub fn load_normalized(path: &Path) -> std::result::Result<RgbImage, SkipReason> {
    let unreadable = |e: &dyn std::fmt::Display| SkipReason::UnreadableImage { detail: e.to_string() };

    let reader = ImageReader::open(path)
        .map_err(|e| unreadable(&e))?
        .with_guessed_format()
        .map_err(|e| unreadable(&e))?;
    if reader.format().is_none() {
        return Err(SkipReason::UnsupportedFormat { detail: format!("unrecognised format for {}", path.display()) });
    }
    let mut decoder = reader.into_decoder().map_err(classify)?;
    let orientation = decoder.orientation().map_err(classify)?;
    let mut img = DynamicImage::from_decoder(decoder).map_err(classify)?;
    img.apply_orientation(orientation);
    Ok(flatten_rgb(img))
}

fn classify(e: image::ImageError) -> SkipReason {
    match e {
        image::ImageError::Unsupported(u) => SkipReason::UnsupportedFormat { detail: u.to_string() },
        other => SkipReason::UnreadableImage { detail: other.to_string() },
    }
}

/// Composites any alpha channel over white.
pub fn flatten_rgb(img: DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u32 * a as u32 + 255 * (255 - a as u32)) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Shrinks `img` to fit inside `max` while keeping its aspect ratio. Never upscales.
pub fn fit_within(img: RgbImage, max: (u32, u32)) -> RgbImage {
    let (w, h) = img.dimensions();
    let (nw, nh) = target_size(w, h, max);
    if (nw, nh) == (w, h) {
        return img;
    }
    image::imageops::resize(&img, nw, nh, FilterType::Lanczos3)
}

fn target_size(w: u32, h: u32, (max_w, max_h): (u32, u32)) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let ratio = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    let nw = ((w as f64) * ratio).round().max(1.0) as u32;
    let nh = ((h as f64) * ratio).round().max(1.0) as u32;
    (nw, nh)
}

/// Encodes as baseline JPEG at `quality` (clamped to 1..=100).
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut enc = JpegEncoder::new_with_quality(Cursor::new(&mut out), quality.clamp(1, 100));
        enc.encode_image(img)?;
    }
    Ok(out)
}
