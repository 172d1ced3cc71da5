//! Target image decoding.

use crate::error::ImageError;
use crate::model::{Color, EncodedImage, TRANSPARENT};

/// Decoded target image in column-major layout: `pixels[x * height + y]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    pixels: Vec<Color>,
}

impl TargetImage {
    /// Decodes a row-major base-36 image, rejecting colors outside the palette.
    pub fn decode(image: &EncodedImage, palette_size: u8) -> Result<Self, ImageError> {
        let EncodedImage { width, height, data } = image;
        let (width, height) = (*width, *height);
        if width == 0 || height == 0 {
            return Err(ImageError::Empty { width, height });
        }
        let expected = width as usize * height as usize;
        let source = data.as_bytes();
        if source.len() != expected {
            return Err(ImageError::SizeMismatch {
                expected,
                got: data.chars().count(),
            });
        }

        let mut row_major = Vec::with_capacity(expected);
        for (index, &byte) in source.iter().enumerate() {
            let color = decode_pixel(byte).ok_or(ImageError::InvalidPixel {
                ch: byte as char,
                index,
            })?;
            if color != TRANSPARENT && color >= palette_size {
                return Err(ImageError::ColorOutOfPalette {
                    color,
                    index,
                    palette_size,
                });
            }
            row_major.push(color);
        }

        let (w, h) = (width as usize, height as usize);
        let mut pixels = Vec::with_capacity(expected);
        for x in 0..w {
            for y in 0..h {
                pixels.push(row_major[y * w + x]);
            }
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Color wanted at image-local `(dx, dy)`; `None` outside the image.
    pub fn get(&self, dx: u32, dy: u32) -> Option<Color> {
        if dx >= self.width || dy >= self.height {
            return None;
        }
        self.pixels
            .get(dx as usize * self.height as usize + dy as usize)
            .copied()
    }

    /// Column-major pixels.
    pub fn pixels(&self) -> &[Color] {
        &self.pixels
    }
}

/// Base-36 digit to color, `.` to [`TRANSPARENT`].
pub fn decode_pixel(byte: u8) -> Option<Color> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'z' => Some(byte - b'a' + 10),
        b'.' => Some(TRANSPARENT),
        _ => None,
    }
}
