// THEORY:
// A `LineSource` is the upstream collaborator: something that hands over one
// raw scan line at a time, pixel-major (`width * band_count` reflectances,
// all bands of pixel 0 first). A live camera driver and an offline file both
// fit behind it, so the rest of the pipeline never knows which one it is fed by.
//
// `ImageLineSource` is the offline simulation source: each row of a decoded
// image is one scan line and each colour channel one band, scaled to 0..1.

use crate::core_modules::spectrum::Reflectance;
use crate::error::SourceError;
use std::path::Path;
use tracing::info;

pub trait LineSource: Send {
    /// Pixels per line.
    fn width(&self) -> usize;

    /// Raw bands per pixel.
    fn band_count(&self) -> usize;

    /// Fills `line` with the next scan line. Returns `false` at end of input.
    fn next_line(&mut self, line: &mut [Reflectance]) -> Result<bool, SourceError>;

    /// Starts again from the first line.
    fn rewind(&mut self);

    fn line_len(&self) -> usize {
        self.width() * self.band_count()
    }
}

fn check_buffer(expected: usize, line: &[Reflectance]) -> Result<(), SourceError> {
    if line.len() == expected {
        Ok(())
    } else {
        Err(SourceError::BufferSize {
            expected,
            actual: line.len(),
        })
    }
}

/// Replays a fixed set of lines held in memory.
#[derive(Debug, Clone)]
pub struct MemoryLineSource {
    width: usize,
    band_count: usize,
    data: Vec<Reflectance>,
    cursor: usize,
}

impl MemoryLineSource {
    /// `data` holds whole lines back to back.
    pub fn new(width: usize, band_count: usize, data: Vec<Reflectance>) -> Result<Self, SourceError> {
        let line_len = width * band_count;
        if line_len == 0 || data.is_empty() {
            return Err(SourceError::Empty);
        }
        if data.len() % line_len != 0 {
            return Err(SourceError::BufferSize {
                expected: (data.len() / line_len + 1) * line_len,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            band_count,
            data,
            cursor: 0,
        })
    }

    pub fn line_count(&self) -> usize {
        self.data.len() / self.line_len()
    }
}

impl LineSource for MemoryLineSource {
    fn width(&self) -> usize {
        self.width
    }

    fn band_count(&self) -> usize {
        self.band_count
    }

    fn next_line(&mut self, line: &mut [Reflectance]) -> Result<bool, SourceError> {
        let line_len = self.line_len();
        check_buffer(line_len, line)?;
        let Some(next) = self.data.get(self.cursor..self.cursor + line_len) else {
            return Ok(false);
        };
        line.copy_from_slice(next);
        self.cursor += line_len;
        Ok(true)
    }

    fn rewind(&mut self) {
        self.cursor = 0;
    }
}

/// Reads scan lines from the rows of an image file.
#[derive(Debug)]
pub struct ImageLineSource {
    width: usize,
    band_count: usize,
    height: usize,
    pixels: Vec<u8>,
    row: usize,
}

impl ImageLineSource {
    /// Decodes any format the `image` crate understands. Grey images give one
    /// band, colour images three, images with alpha keep it as a fourth.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let decoded = image::open(path.as_ref())?;
        let source = Self::from_image(decoded)?;
        info!(
            path = %path.as_ref().display(),
            width = source.width,
            lines = source.height,
            bands = source.band_count,
            "opened image line source"
        );
        Ok(source)
    }

    pub fn from_image(decoded: image::DynamicImage) -> Result<Self, SourceError> {
        let width = decoded.width() as usize;
        let height = decoded.height() as usize;
        if width == 0 || height == 0 {
            return Err(SourceError::Empty);
        }
        let (band_count, pixels) = match decoded.color().channel_count() {
            1 | 2 => (1, decoded.into_luma8().into_raw()),
            3 => (3, decoded.into_rgb8().into_raw()),
            _ => (4, decoded.into_rgba8().into_raw()),
        };
        Ok(Self {
            width,
            band_count,
            height,
            pixels,
            row: 0,
        })
    }

    pub fn line_count(&self) -> usize {
        self.height
    }
}

impl LineSource for ImageLineSource {
    fn width(&self) -> usize {
        self.width
    }

    fn band_count(&self) -> usize {
        self.band_count
    }

    fn next_line(&mut self, line: &mut [Reflectance]) -> Result<bool, SourceError> {
        let line_len = self.line_len();
        check_buffer(line_len, line)?;
        if self.row >= self.height {
            return Ok(false);
        }
        let start = self.row * line_len;
        for (value, &byte) in line.iter_mut().zip(&self.pixels[start..start + line_len]) {
            *value = Reflectance::from(byte) / 255.0;
        }
        self.row += 1;
        Ok(true)
    }

    fn rewind(&mut self) {
        self.row = 0;
    }
}
