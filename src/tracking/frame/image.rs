//! 8-bit image buffers handed in by the host, and the grayscale image the
//! feature pipeline works on.

use crate::error::SlamError;

/// Borrowed, width/height-tagged 8-bit image with interleaved channels.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// 1 (gray), 3 (RGB) or 4 (RGBA).
    pub channels: u8,
}

impl<'a> ImageView<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32, channels: u8) -> Self {
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    /// Check the buffer against its declared dimensions.
    pub fn validate(&self) -> Result<(), SlamError> {
        if self.width == 0 || self.height == 0 {
            return Err(SlamError::InvalidParameter(format!(
                "image size must be non-zero ({}x{})",
                self.width, self.height
            )));
        }
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(SlamError::UnsupportedFormat(format!(
                "{} channels (expected 1, 3 or 4)",
                self.channels
            )));
        }
        let expected = self.width as usize * self.height as usize * self.channels as usize;
        if self.data.len() != expected {
            return Err(SlamError::InvalidParameter(format!(
                "buffer holds {} bytes, {}x{}x{} needs {}",
                self.data.len(),
                self.width,
                self.height,
                self.channels,
                expected
            )));
        }
        Ok(())
    }

    /// Convert to grayscale using integer BT.601 luma weights.
    pub fn to_gray(&self) -> Result<GrayImage, SlamError> {
        self.validate()?;
        let data = match self.channels {
            1 => self.data.to_vec(),
            c => self
                .data
                .chunks_exact(c as usize)
                .map(|px| {
                    let luma = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
                    ((luma + 500) / 1000) as u8
                })
                .collect(),
        };
        Ok(GrayImage {
            width: self.width as usize,
            height: self.height as usize,
            data,
        })
    }
}

/// Owned single-channel image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    /// Pixel at signed coordinates; caller guarantees they are in bounds.
    #[inline]
    pub fn at(&self, x: i32, y: i32) -> u8 {
        self.data[y as usize * self.width + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    /// Separable 5-tap binomial blur ([1 4 6 4 1] / 16) with clamped borders.
    pub fn blurred(&self) -> GrayImage {
        const KERNEL: [u32; 5] = [1, 4, 6, 4, 1];
        let (w, h) = (self.width, self.height);
        if w == 0 || h == 0 {
            return self.clone();
        }
        let mut tmp = vec![0u16; w * h];
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0u32;
                for (k, weight) in KERNEL.iter().enumerate() {
                    let xx = (x as isize + k as isize - 2).clamp(0, w as isize - 1) as usize;
                    acc += weight * self.data[y * w + xx] as u32;
                }
                tmp[y * w + x] = acc as u16;
            }
        }
        let mut out = GrayImage::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let mut acc = 0u32;
                for (k, weight) in KERNEL.iter().enumerate() {
                    let yy = (y as isize + k as isize - 2).clamp(0, h as isize - 1) as usize;
                    acc += weight * tmp[yy * w + x] as u32;
                }
                out.data[y * w + x] = ((acc + 128) / 256) as u8;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;

    #[test]
    fn test_rgb_to_gray() {
        let data = [255, 255, 255, 0, 0, 0, 255, 0, 0];
        let img = ImageView::new(&data, 3, 1, 3).to_gray().unwrap();
        assert_eq!(img.data, vec![255, 0, 76]);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let data = [0u8; 10];
        let err = ImageView::new(&data, 4, 4, 1).validate().unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidParameter);
    }

    #[test]
    fn test_two_channels_unsupported() {
        let data = [0u8; 32];
        let err = ImageView::new(&data, 4, 4, 2).validate().unwrap_err();
        assert_eq!(err.code(), ResultCode::UnsupportedFormat);
    }

    #[test]
    fn test_blur_preserves_constant_image() {
        let mut img = GrayImage::new(8, 6);
        img.data.iter_mut().for_each(|v| *v = 100);
        assert_eq!(img.blurred(), img);
    }
}
