use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, warp, Interpolation, Projection};

use crate::error::{Result, VariantError};
use crate::recipe::RecipeSpec;

/// Pixels kept clear of the source border after rotation or warping.
const EDGE_MARGIN: f32 = 3.0;

/// Transform boundary. Given the same image and recipe, output must be identical,
/// and it must have the source's dimensions.
pub trait ImageTransform: Send + Sync {
    fn apply(&self, img: &RgbImage, recipe: &RecipeSpec) -> Result<RgbImage>;
}

/// Crops, rotations, warps and colour jitter built on `image` and `imageproc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeometricTransform;

impl ImageTransform for GeometricTransform {
    fn apply(&self, img: &RgbImage, recipe: &RecipeSpec) -> Result<RgbImage> {
        let (w, h) = img.dimensions();
        if w < 8 || h < 8 {
            return Err(fail(recipe, format!("image {w}x{h} is too small to transform")));
        }
        let out = match *recipe {
            RecipeSpec::MicroCrop { fraction } => {
                let (cw, ch) = (w as f32 * (1.0 - fraction), h as f32 * (1.0 - fraction));
                crop_resize(img, (w as f32 - cw) / 2.0, (h as f32 - ch) / 2.0, cw, ch)
            }
            RecipeSpec::MicroRotate { degrees } => rotate_trimmed(img, degrees),
            RecipeSpec::MicroPerspective { insets } => perspective(img, insets)
                .ok_or_else(|| fail(recipe, "degenerate perspective control points".into()))?,
            RecipeSpec::CropRotate { fraction, degrees } => {
                let (cw, ch) = (w as f32 * (1.0 - fraction), h as f32 * (1.0 - fraction));
                let cropped = crop_resize(img, (w as f32 - cw) / 2.0, (h as f32 - ch) / 2.0, cw, ch);
                rotate_trimmed(&cropped, degrees)
            }
            RecipeSpec::AsymmetricCrop { left, right, top, bottom } => {
                let x = w as f32 * left;
                let y = h as f32 * top;
                let cw = w as f32 * (1.0 - left - right);
                let ch = h as f32 * (1.0 - top - bottom);
                crop_resize(img, x, y, cw, ch)
            }
            RecipeSpec::ScaleShift { scale, shift_x, shift_y } => {
                let (cw, ch) = (w as f32 / scale, h as f32 / scale);
                let x = ((w as f32 - cw) / 2.0 + shift_x * w as f32).clamp(0.0, w as f32 - cw);
                let y = ((h as f32 - ch) / 2.0 + shift_y * h as f32).clamp(0.0, h as f32 - ch);
                crop_resize(img, x, y, cw, ch)
            }
            RecipeSpec::ColorNoise { brightness, contrast, noise_sigma, noise_seed } => {
                let adjusted = imageops::contrast(&imageops::brighten(img, brightness), contrast);
                imageproc::noise::gaussian_noise(&adjusted, 0.0, noise_sigma as f64, noise_seed)
            }
        };
        if out.dimensions() != (w, h) {
            return Err(fail(recipe, format!("produced {:?}, expected {w}x{h}", out.dimensions())));
        }
        Ok(out)
    }
}

fn fail(recipe: &RecipeSpec, detail: String) -> VariantError {
    VariantError::Transform { family: recipe.family().name().to_string(), detail }
}

/// Crops the window at (x, y, cw, ch) and scales it back to the source size.
fn crop_resize(img: &RgbImage, x: f32, y: f32, cw: f32, ch: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    let x = (x.round().max(0.0) as u32).min(w - 1);
    let y = (y.round().max(0.0) as u32).min(h - 1);
    let cw = (cw.round().max(1.0) as u32).min(w - x);
    let ch = (ch.round().max(1.0) as u32).min(h - y);
    let window = imageops::crop_imm(img, x, y, cw, ch).to_image();
    imageops::resize(&window, w, h, FilterType::Lanczos3)
}

/// Rotates about the centre, then zooms just enough that no empty corner remains.
fn rotate_trimmed(img: &RgbImage, degrees: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    let theta = degrees.to_radians();
    let rotated = rotate_about_center(img, theta, Interpolation::Bilinear, Rgb([0, 0, 0]));

    let aspect = (w as f32 / h as f32).max(h as f32 / w as f32);
    let zoom = theta.cos().abs() + theta.sin().abs() * aspect;
    // Extra margin keeps interpolation at the rotated edge out of the window.
    let cw = (w as f32 / zoom - 2.0 * EDGE_MARGIN).max(1.0);
    let ch = (h as f32 / zoom - 2.0 * EDGE_MARGIN).max(1.0);
    crop_resize(&rotated, (w as f32 - cw) / 2.0, (h as f32 - ch) / 2.0, cw, ch)
}

/// Maps an inset quadrilateral of the source onto the full frame.
fn perspective(img: &RgbImage, insets: [[f32; 2]; 4]) -> Option<RgbImage> {
    let (w, h) = (img.width() as f32, img.height() as f32);
    let (r, b) = (w - 1.0, h - 1.0);
    let (sr, sb) = (w - EDGE_MARGIN, h - EDGE_MARGIN);
    let from = [
        (insets[0][0] * w, insets[0][1] * h),
        (sr - insets[1][0] * w, insets[1][1] * h),
        (sr - insets[2][0] * w, sb - insets[2][1] * h),
        (insets[3][0] * w, sb - insets[3][1] * h),
    ];
    let to = [(0.0, 0.0), (r, 0.0), (r, b), (0.0, b)];
    let projection = Projection::from_control_points(from, to)?;
    Some(warp(img, &projection, Interpolation::Bilinear, Rgb([0, 0, 0])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::textured_image;
    use crate::recipe::{sample, RecipeFamily};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn every_family_preserves_dimensions() {
        let img = textured_image(97, 61, 2);
        let mut rng = StdRng::seed_from_u64(11);
        for family in RecipeFamily::ALL {
            for _ in 0..5 {
                let spec = sample(family, &mut rng);
                let out = GeometricTransform.apply(&img, &spec).unwrap();
                assert_eq!(out.dimensions(), img.dimensions(), "{spec:?}");
            }
        }
    }

    #[test]
    fn same_recipe_gives_same_pixels() {
        let img = textured_image(64, 64, 5);
        let mut rng = StdRng::seed_from_u64(99);
        for family in RecipeFamily::ALL {
            let spec = sample(family, &mut rng);
            let a = GeometricTransform.apply(&img, &spec).unwrap();
            let b = GeometricTransform.apply(&img, &spec).unwrap();
            assert_eq!(a, b, "{spec:?}");
        }
    }

    #[test]
    fn transforms_change_the_image() {
        let img = textured_image(80, 80, 4);
        let spec = RecipeSpec::MicroCrop { fraction: 0.08 };
        assert_ne!(GeometricTransform.apply(&img, &spec).unwrap(), img);
    }

    #[test]
    fn rotation_leaves_no_black_corners() {
        let img = RgbImage::from_pixel(100, 60, Rgb([200, 200, 200]));
        let out = GeometricTransform.apply(&img, &RecipeSpec::MicroRotate { degrees: 4.0 }).unwrap();
        for (x, y) in [(0, 0), (99, 0), (0, 59), (99, 59)] {
            assert!(out.get_pixel(x, y).0[0] > 100, "corner ({x},{y}) is {:?}", out.get_pixel(x, y));
        }
    }

    #[test]
    fn tiny_images_are_refused() {
        let img = RgbImage::new(4, 4);
        let err = GeometricTransform.apply(&img, &RecipeSpec::MicroCrop { fraction: 0.05 }).unwrap_err();
        assert!(matches!(err, VariantError::Transform { .. }));
    }
}
