/// Set-of-marks support.
///
/// Interactive elements are labelled `tag_1`, `tag_2`, … so the model may
/// refer to them instead of coordinates. The legend handed to the executor
/// binds every tag to the centre of its box; the overlay draws the numbers
/// onto the screenshot the model sees.
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};

/// Element box in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl Tag {
    pub fn center(&self) -> (i64, i64) {
        (
            self.x + self.width.div_euclid(2),
            self.y + self.height.div_euclid(2),
        )
    }
}

/// `tag_<n>=(cx, cy)` per line, numbered from 1.
pub fn tag_legend(tags: &[Tag]) -> String {
    tags.iter()
        .enumerate()
        .map(|(i, t)| {
            let (cx, cy) = t.center();
            format!("tag_{}=({cx}, {cy})", i + 1)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// Roles that only group other elements.
const CONTAINER_ROLES: [&str; 8] = [
    "application",
    "desktop-frame",
    "filler",
    "frame",
    "panel",
    "scroll-pane",
    "section",
    "window",
];

fn element_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([A-Za-z][\w.-]*)(\s[^>]*)?>").expect("static regex"))
}

fn coord_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?:\w+:)?screencoord="\((-?\d+), ?(-?\d+)\)""#).expect("static regex"))
}

fn size_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?:\w+:)?size="\((-?\d+), ?(-?\d+)\)""#).expect("static regex"))
}

/// Boxes of the visible, non-container elements of an accessibility tree
/// (AT-SPI XML), in document order. Repeated boxes are kept once.
pub fn tags_from_accessibility_tree(xml: &str) -> Vec<Tag> {
    let mut tags: Vec<Tag> = Vec::new();
    for element in element_regex().captures_iter(xml) {
        let role = element[1].rsplit(':').next().unwrap_or_default();
        if CONTAINER_ROLES.contains(&role) {
            continue;
        }
        let Some(attrs) = element.get(2).map(|a| a.as_str()) else {
            continue;
        };
        let (Some(coord), Some(size)) = (coord_regex().captures(attrs), size_regex().captures(attrs)) else {
            continue;
        };
        let number = |caps: &regex::Captures<'_>, i: usize| caps[i].parse::<i64>().ok();
        let (Some(x), Some(y), Some(width), Some(height)) =
            (number(&coord, 1), number(&coord, 2), number(&size, 1), number(&size, 2))
        else {
            continue;
        };
        let tag = Tag { x, y, width, height };
        if x < 0 || y < 0 || width <= 0 || height <= 0 || tags.contains(&tag) {
            continue;
        }
        tags.push(tag);
    }
    tags
}

// ── 5×5 digit glyphs ─────────────────────────────────────────────────────────
// bit4 = leftmost pixel
const DIGITS_5X5: [[u8; 5]; 10] = [
    [0b01110, 0b10001, 0b10001, 0b10001, 0b01110],
    [0b00100, 0b01100, 0b00100, 0b00100, 0b01110],
    [0b01110, 0b10001, 0b00110, 0b01000, 0b11111],
    [0b11110, 0b00001, 0b00110, 0b00001, 0b11110],
    [0b00110, 0b01010, 0b10010, 0b11111, 0b00010],
    [0b11111, 0b10000, 0b11110, 0b00001, 0b11110],
    [0b01110, 0b10000, 0b11110, 0b10001, 0b01110],
    [0b11111, 0b00001, 0b00010, 0b00100, 0b00100],
    [0b01110, 0b10001, 0b01110, 0b10001, 0b01110],
    [0b01110, 0b10001, 0b01111, 0b00001, 0b01110],
];

const MARK_COLOR: [u8; 3] = [255, 40, 40];

fn put(canvas: &mut image::RgbaImage, x: i64, y: i64, rgb: [u8; 3]) {
    let (w, h) = canvas.dimensions();
    if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
        return;
    }
    let p = canvas.get_pixel_mut(x as u32, y as u32);
    p[0] = rgb[0];
    p[1] = rgb[1];
    p[2] = rgb[2];
    p[3] = 255;
}

fn draw_number(canvas: &mut image::RgbaImage, n: usize, px: i64, py: i64, scale: i64) {
    let label = n.to_string();
    let step = 5 * scale + 1;
    let width = label.len() as i64 * step + 1;

    // dark plate behind the digits
    for dy in -1..=5 * scale {
        for dx in -1..width {
            put(canvas, px + dx, py + dy, [0, 0, 0]);
        }
    }

    for (i, c) in label.chars().enumerate() {
        let Some(glyph) = c.to_digit(10).map(|d| &DIGITS_5X5[d as usize]) else {
            continue;
        };
        let ox = px + i as i64 * step;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..5i64 {
                if (bits >> (4 - col)) & 1 == 0 {
                    continue;
                }
                for sy in 0..scale {
                    for sx in 0..scale {
                        put(
                            canvas,
                            ox + col * scale + sx,
                            py + row as i64 * scale + sy,
                            [255, 255, 255],
                        );
                    }
                }
            }
        }
    }
}

/// Outline every tag and print its number at the top-left corner. Returns
/// PNG bytes.
pub fn draw_marks(src_bytes: &[u8], tags: &[Tag]) -> HarnessResult<Vec<u8>> {
    let img = image::load_from_memory(src_bytes)
        .map_err(|e| HarnessError::Perception(format!("load image: {e}")))?;
    let mut canvas = img.to_rgba8();

    for (i, tag) in tags.iter().enumerate() {
        let (x0, y0) = (tag.x, tag.y);
        let (x1, y1) = (tag.x + tag.width, tag.y + tag.height);
        for x in x0..=x1 {
            put(&mut canvas, x, y0, MARK_COLOR);
            put(&mut canvas, x, y1, MARK_COLOR);
        }
        for y in y0..=y1 {
            put(&mut canvas, x0, y, MARK_COLOR);
            put(&mut canvas, x1, y, MARK_COLOR);
        }
        let scale = if tag.height >= 24 { 2 } else { 1 };
        draw_number(&mut canvas, i + 1, x0 + 2, y0 + 2, scale);
    }

    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(canvas)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| HarnessError::Perception(format!("PNG encode: {e}")))?;
    Ok(out)
}
