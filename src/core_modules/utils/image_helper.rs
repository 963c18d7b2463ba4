use crate::core_modules::classification::ClassLabelLine;
use image::ImageEncoder;
use std::path::Path;

const PALETTE: [[u8; 4]; 8] = [
    [230, 25, 75, 255],
    [60, 180, 75, 255],
    [255, 225, 25, 255],
    [0, 130, 200, 255],
    [245, 130, 48, 255],
    [145, 30, 180, 255],
    [70, 240, 240, 255],
    [240, 50, 230, 255],
];
const BACKGROUND: [u8; 4] = [0, 0, 0, 255];

/// RGBA colour for a class label. Background is black.
pub fn label_colour(label: i32) -> [u8; 4] {
    if label < 0 {
        BACKGROUND
    } else {
        PALETTE[label as usize % PALETTE.len()]
    }
}

/// Writes an RGBA buffer as a PNG.
pub fn save(path: impl AsRef<Path>, width: u32, height: u32, buffer: &[u8]) -> Result<(), image::ImageError> {
    let output = std::fs::File::create(path)?;
    let encoder = image::codecs::png::PngEncoder::new(output);

    encoder.write_image(buffer, width, height, image::ExtendedColorType::Rgba8)?;

    Ok(())
}

/// Renders label lines top to bottom, one image row per line.
pub fn render_labels<'a>(lines: impl IntoIterator<Item = &'a ClassLabelLine>) -> (u32, u32, Vec<u8>) {
    let mut width = 0usize;
    let mut height = 0u32;
    let mut buffer = Vec::new();
    for line in lines {
        width = width.max(line.width());
        for &label in line.as_slice() {
            buffer.extend_from_slice(&label_colour(label));
        }
        height += 1;
    }
    (width as u32, height, buffer)
}

/// Dumps a window of label lines to a PNG. Every line must share one width.
pub fn save_labels<'a>(
    path: impl AsRef<Path>,
    lines: impl IntoIterator<Item = &'a ClassLabelLine>,
) -> Result<(), image::ImageError> {
    let (width, height, buffer) = render_labels(lines);
    save(path, width, height, &buffer)
}
