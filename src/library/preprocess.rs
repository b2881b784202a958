//! Image preprocessing for the image encoder.
//!
//! Decodes any format the `image` crate understands, scales the image so it
//! covers a `target_size` square and crops the center.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;

/// CLIP ViT-B/32 input resolution
pub const DEFAULT_TARGET_SIZE: u32 = 224;

/// Square RGB image ready for the image encoder.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    pixels: RgbImage,
}

impl PreprocessedImage {
    pub fn new(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn size(&self) -> u32 {
        self.pixels.width()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// Re-encode as PNG, for encoders that take encoded image bytes.
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(self.pixels.clone()).write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }
}

/// Decode `data` and produce a `target_size` x `target_size` center crop.
pub fn preprocess_image(data: &[u8], target_size: u32) -> Result<PreprocessedImage, image::ImageError> {
    let img = image::load_from_memory(data)?;

    // resize_to_fill keeps aspect ratio and crops the overflow around the center
    let filled = img.resize_to_fill(target_size, target_size, FilterType::CatmullRom);

    Ok(PreprocessedImage::new(filled.to_rgb8()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_output_is_square_target() {
        let result = preprocess_image(&png_bytes(640, 480), 224).unwrap();
        assert_eq!(result.pixels().dimensions(), (224, 224));
        assert_eq!(result.size(), 224);
    }

    #[test]
    fn test_small_images_are_upscaled() {
        let result = preprocess_image(&png_bytes(10, 30), 64).unwrap();
        assert_eq!(result.pixels().dimensions(), (64, 64));
    }

    #[test]
    fn test_invalid_data_fails() {
        assert!(preprocess_image(b"definitely not an image", 224).is_err());
    }

    #[test]
    fn test_png_reencode_decodes() {
        let result = preprocess_image(&png_bytes(50, 50), 32).unwrap();
        let png = result.to_png().unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 32);
    }
}
