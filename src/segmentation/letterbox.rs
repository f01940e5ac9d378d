use super::types::{BoxPrompt, Point};
use crate::error::SegmentError;
use image::{imageops, DynamicImage, GenericImageView, Rgba, RgbaImage};

/// Fill used for the padding around the scaled image.
pub const PAD_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Scale and offset between original image space and the square model space.
///
/// Computed once per prepared image; the forward mapping is
/// `model = original * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateTransform {
    pub target_size: u32,
    pub scale: f64,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
}

impl CoordinateTransform {
    /// Fit the longer side of `original_width x original_height` exactly into
    /// `target_size` and center the result.
    pub fn new(
        original_width: u32,
        original_height: u32,
        target_size: u32,
    ) -> Result<Self, SegmentError> {
        if original_width == 0 || original_height == 0 {
            return Err(SegmentError::InvalidImage(format!(
                "image has no pixels ({}x{})",
                original_width, original_height
            )));
        }
        if target_size == 0 {
            return Err(SegmentError::InvalidImage(
                "target size must be positive".to_string(),
            ));
        }

        let scale = target_size as f64 / original_width.max(original_height) as f64;
        let scaled_width = scaled_side(original_width, scale, target_size);
        let scaled_height = scaled_side(original_height, scale, target_size);

        Ok(Self {
            target_size,
            scale,
            offset_x: (target_size - scaled_width) / 2,
            offset_y: (target_size - scaled_height) / 2,
            original_width,
            original_height,
            scaled_width,
            scaled_height,
        })
    }

    /// Original image coordinates to model space.
    pub fn to_model(&self, point: Point) -> Point {
        Point::new(
            (point.x as f64 * self.scale + self.offset_x as f64) as f32,
            (point.y as f64 * self.scale + self.offset_y as f64) as f32,
        )
    }

    /// Model space coordinates back to the original image.
    pub fn to_original(&self, point: Point) -> Point {
        Point::new(
            ((point.x as f64 - self.offset_x as f64) / self.scale) as f32,
            ((point.y as f64 - self.offset_y as f64) / self.scale) as f32,
        )
    }

    pub fn box_to_model(&self, top_left: Point, bottom_right: Point) -> BoxPrompt {
        BoxPrompt::new(self.to_model(top_left), self.to_model(bottom_right))
    }

    /// Crop the scaled image region out of a model space mask and resize it to
    /// the original image size.
    ///
    /// Masks may come back at a resolution other than `target_size`; the crop
    /// rectangle is scaled to the mask's own resolution first.
    pub fn mask_to_original(&self, mask: &RgbaImage) -> RgbaImage {
        let _span = tracing::debug_span!("mask_to_original").entered();

        let (mask_width, mask_height) = mask.dimensions();
        let ratio_x = mask_width as f64 / self.target_size as f64;
        let ratio_y = mask_height as f64 / self.target_size as f64;

        let x = ((self.offset_x as f64 * ratio_x).round() as u32).min(mask_width - 1);
        let y = ((self.offset_y as f64 * ratio_y).round() as u32).min(mask_height - 1);
        let width = ((self.scaled_width as f64 * ratio_x).round() as u32)
            .clamp(1, mask_width - x);
        let height = ((self.scaled_height as f64 * ratio_y).round() as u32)
            .clamp(1, mask_height - y);

        let cropped = imageops::crop_imm(mask, x, y, width, height).to_image();
        if cropped.dimensions() == (self.original_width, self.original_height) {
            return cropped;
        }

        // Nearest keeps the mask binary: every pixel is either the mask color or transparent.
        imageops::resize(
            &cropped,
            self.original_width,
            self.original_height,
            imageops::FilterType::Nearest,
        )
    }
}

fn scaled_side(side: u32, scale: f64, target_size: u32) -> u32 {
    ((side as f64 * scale).round() as u32).clamp(1, target_size)
}

/// An image drawn centered onto a square canvas of the model's input size.
#[derive(Debug, Clone)]
pub struct LetterboxedImage {
    pub canvas: RgbaImage,
    pub transform: CoordinateTransform,
}

/// Scale `image` to fit a `target_size` square, padding the rest with [`PAD_COLOR`].
pub fn letterbox(image: &DynamicImage, target_size: u32) -> Result<LetterboxedImage, SegmentError> {
    let _span = tracing::debug_span!("letterbox").entered();

    let (width, height) = image.dimensions();
    let transform = CoordinateTransform::new(width, height, target_size)?;

    let rgba = image.to_rgba8();
    let scaled = if (transform.scaled_width, transform.scaled_height) != (width, height) {
        imageops::resize(
            &rgba,
            transform.scaled_width,
            transform.scaled_height,
            imageops::FilterType::Triangle,
        )
    } else {
        rgba
    };

    // Translucent pixels are composited over the opaque black padding
    let mut canvas = RgbaImage::from_pixel(target_size, target_size, PAD_COLOR);
    imageops::overlay(
        &mut canvas,
        &scaled,
        transform.offset_x as i64,
        transform.offset_y as i64,
    );

    tracing::debug!(
        "Letterboxed {}x{} -> {}x{} at ({}, {}), scale={:.4}",
        width,
        height,
        transform.scaled_width,
        transform.scaled_height,
        transform.offset_x,
        transform.offset_y,
        transform.scale
    );

    Ok(LetterboxedImage { canvas, transform })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn landscape_image_is_padded_vertically() {
        let t = CoordinateTransform::new(800, 600, 1024).unwrap();
        assert!((t.scale - 1.28).abs() < 1e-12);
        assert_eq!(t.scaled_width, 1024);
        assert_eq!(t.scaled_height, 768);
        assert_eq!(t.offset_x, 0);
        assert_eq!(t.offset_y, 128);
    }

    #[test]
    fn portrait_image_is_padded_horizontally() {
        let t = CoordinateTransform::new(300, 1000, 1024).unwrap();
        assert_eq!(t.scaled_height, 1024);
        assert_eq!(t.scaled_width, 307);
        assert_eq!(t.offset_x, 358);
        assert_eq!(t.offset_y, 0);
    }

    #[test]
    fn square_image_at_target_size_has_no_offset() {
        let t = CoordinateTransform::new(1024, 1024, 1024).unwrap();
        assert_eq!(t.scale, 1.0);
        assert_eq!((t.offset_x, t.offset_y), (0, 0));
        assert_eq!(t.to_model(Point::new(10.5, 20.0)), Point::new(10.5, 20.0));
    }

    #[test]
    fn scale_is_exact_and_sides_round_trip_within_a_pixel() {
        for (w, h) in [(800, 600), (1, 1), (4000, 3), (333, 777), (1920, 1080), (17, 1024)] {
            let t = CoordinateTransform::new(w, h, 1024).unwrap();
            assert_eq!(t.scale, 1024.0 / w.max(h) as f64);
            assert!((t.scaled_width as f64 / t.scale - w as f64).abs() <= 1.0);
            assert!((t.scaled_height as f64 / t.scale - h as f64).abs() <= 1.0);
        }
    }

    #[test]
    fn inverse_then_forward_is_idempotent() {
        let t = CoordinateTransform::new(800, 600, 1024).unwrap();
        for p in [Point::new(0.0, 128.0), Point::new(512.3, 600.7), Point::new(1023.0, 895.0)] {
            let back = t.to_model(t.to_original(p));
            assert!((back.x - p.x).abs() < 1e-3);
            assert!((back.y - p.y).abs() < 1e-3);
        }
    }

    #[test]
    fn zero_sized_image_is_rejected() {
        assert!(matches!(
            CoordinateTransform::new(0, 10, 1024),
            Err(SegmentError::InvalidImage(_))
        ));
    }

    #[test]
    fn letterbox_pads_with_black() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(8, 4, Rgb([200, 100, 50])));
        let boxed = letterbox(&img, 16).unwrap();
        assert_eq!(boxed.canvas.dimensions(), (16, 16));
        assert_eq!(boxed.transform.offset_y, 4);
        assert_eq!(*boxed.canvas.get_pixel(0, 0), PAD_COLOR);
        assert_eq!(*boxed.canvas.get_pixel(0, 15), PAD_COLOR);
        assert_eq!(*boxed.canvas.get_pixel(8, 8), Rgba([200, 100, 50, 255]));
    }

    #[test]
    fn transparent_pixels_become_black() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 0])));
        let boxed = letterbox(&img, 4).unwrap();
        assert!(boxed.canvas.pixels().all(|p| *p == PAD_COLOR));
    }

    #[test]
    fn translucent_pixels_are_composited_over_black() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([200, 100, 50, 128])));
        let boxed = letterbox(&img, 4).unwrap();
        for p in boxed.canvas.pixels() {
            assert_eq!(p[3], 255);
            for (c, expected) in [100i32, 50, 25].into_iter().enumerate() {
                assert!((p[c] as i32 - expected).abs() <= 2, "{:?}", p);
            }
        }
    }

    #[test]
    fn mask_is_cropped_and_resized_to_original() {
        let t = CoordinateTransform::new(8, 4, 16).unwrap();
        let on = Rgba([0, 114, 189, 255]);
        let mut mask = RgbaImage::new(16, 16);
        // Left half of the image region only.
        for y in 4..12 {
            for x in 0..8 {
                mask.put_pixel(x, y, on);
            }
        }
        // Padding must be dropped.
        mask.put_pixel(0, 0, on);

        let original = t.mask_to_original(&mask);
        assert_eq!(original.dimensions(), (8, 4));
        assert_eq!(*original.get_pixel(0, 0), on);
        assert_eq!(*original.get_pixel(3, 3), on);
        assert_eq!(original.get_pixel(4, 0)[3], 0);
        assert_eq!(original.get_pixel(7, 3)[3], 0);
    }
}
