//! Semi-transparent labeled band composited onto free-plan advanced outputs.

use image::{imageops, DynamicImage, GenericImageView, Rgba, RgbaImage};

pub const LABEL: &str = "PREVIEW";

/// Band height as a percentage of the image height.
const BAND_PERCENT: u32 = 12;
const BAND_COLOR: Rgba<u8> = Rgba([0, 0, 0, 140]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 210]);

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

/// 5x7 bitmaps, one byte per row, high bit on the left.
fn glyph(c: char) -> Option<[u8; 7]> {
    let rows = match c {
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        _ => return None,
    };
    Some(rows)
}

/// Composite the band across the bottom of `img`. Dimensions are preserved.
pub fn apply(img: DynamicImage) -> DynamicImage {
    let (width, height) = img.dimensions();
    let band_height = (height * BAND_PERCENT / 100).max(GLYPH_HEIGHT + 2).min(height);

    let mut band = RgbaImage::from_pixel(width, band_height, BAND_COLOR);
    draw_label(&mut band, LABEL);

    let mut base = img.to_rgba8();
    imageops::overlay(&mut base, &band, 0, (height - band_height) as i64);
    DynamicImage::ImageRgba8(base)
}

/// Centered label at the largest integer scale that fits; skipped if even
/// scale 1 does not fit.
fn draw_label(band: &mut RgbaImage, label: &str) {
    let (width, height) = band.dimensions();
    let chars = label.chars().count() as u32;
    if chars == 0 {
        return;
    }
    // Glyph cell is the glyph plus one column of spacing.
    let unscaled_width = chars * (GLYPH_WIDTH + 1) - 1;
    let scale = (height.saturating_sub(2) / GLYPH_HEIGHT).min(width / unscaled_width);
    if scale == 0 {
        return;
    }

    let text_width = unscaled_width * scale;
    let origin_x = (width - text_width) / 2;
    let origin_y = (height - GLYPH_HEIGHT * scale) / 2;

    for (index, c) in label.chars().enumerate() {
        let Some(rows) = glyph(c) else { continue };
        let cell_x = origin_x + index as u32 * (GLYPH_WIDTH + 1) * scale;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let x = cell_x + col * scale + dx;
                        let y = origin_y + row as u32 * scale + dy;
                        band.put_pixel(x, y, TEXT_COLOR);
                    }
                }
            }
        }
    }
}
