use image::{RgbImage, RgbaImage};

use crate::config::IMAGE_SIZE;
use crate::error::{PipelineError, PipelineResult};
use crate::ImageTensor;

/// Pixel layouts a host may hand over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    /// RGBA, 8 bits per channel; alpha is written opaque.
    Rgba8888,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb8 => 3,
            Self::Rgba8888 => 4,
            Self::Rgb565 => 2,
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, Self::Rgb8 | Self::Rgba8888)
    }
}

/// A caller-owned buffer the pipeline fills with the generated image.
pub trait PixelTarget {
    fn format(&self) -> PixelFormat;
    /// `(width, height)`.
    fn dimensions(&self) -> (u32, u32);
    fn pixels_mut(&mut self) -> &mut [u8];
}

impl PixelTarget for RgbImage {
    fn format(&self) -> PixelFormat {
        PixelFormat::Rgb8
    }

    fn dimensions(&self) -> (u32, u32) {
        RgbImage::dimensions(self)
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl PixelTarget for RgbaImage {
    fn format(&self) -> PixelFormat {
        PixelFormat::Rgba8888
    }

    fn dimensions(&self) -> (u32, u32) {
        RgbaImage::dimensions(self)
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// Raw host memory with an explicit format, e.g. a locked platform bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl PixelBuffer {
    /// Zero-filled buffer of the right length for `format`.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            data: vec![0; len],
        }
    }
}

impl PixelTarget for PixelBuffer {
    fn format(&self) -> PixelFormat {
        self.format
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Rejects targets the pipeline cannot fill completely.
pub(crate) fn check_target<T: PixelTarget + ?Sized>(target: &mut T) -> PipelineResult<()> {
    let format = target.format();
    if !format.is_supported() {
        return Err(PipelineError::invalid_request(format!(
            "unsupported target format {format:?}"
        )));
    }
    let (width, height) = target.dimensions();
    if (width as usize, height as usize) != (IMAGE_SIZE, IMAGE_SIZE) {
        return Err(PipelineError::invalid_request(format!(
            "target is {width}x{height}, expected {IMAGE_SIZE}x{IMAGE_SIZE}"
        )));
    }
    let expected = IMAGE_SIZE * IMAGE_SIZE * format.bytes_per_pixel();
    let actual = target.pixels_mut().len();
    if actual != expected {
        return Err(PipelineError::invalid_request(format!(
            "target holds {actual} bytes, expected {expected}"
        )));
    }
    Ok(())
}

/// Copies a finished image into a target that already passed `check_target`.
pub(crate) fn write_image<T: PixelTarget + ?Sized>(
    image: &ImageTensor,
    target: &mut T,
) -> PipelineResult<()> {
    let rgb = image.to_bytes()?;
    let format = target.format();
    let pixels = target.pixels_mut();
    match format {
        PixelFormat::Rgb8 if pixels.len() == rgb.len() => pixels.copy_from_slice(&rgb),
        PixelFormat::Rgba8888 if pixels.len() / 4 == rgb.len() / 3 => {
            for (dst, src) in pixels.chunks_exact_mut(4).zip(rgb.chunks_exact(3)) {
                dst[..3].copy_from_slice(src);
                dst[3] = u8::MAX;
            }
        }
        _ => {
            return Err(PipelineError::contract(format!(
                "image of {} bytes does not fit a {format:?} target of {} bytes",
                rgb.len(),
                pixels.len()
            )))
        }
    }
    Ok(())
}
