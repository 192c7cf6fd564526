//! Draw instructions for the live preview.
//!
//! Built from the latest batch only; nothing carries over between frames.

use std::path::Path;

use anyhow::{Context, Result};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Rgb, RgbImage};
use serde::Serialize;

use crate::models::{BoundingBox, Frame, MatchResult, MatchScore};

pub const RECOGNIZED_COLOR: [u8; 3] = [0, 200, 0];
pub const UNKNOWN_COLOR: [u8; 3] = [255, 165, 0];

const OUTLINE_THICKNESS: u32 = 3;
const LABEL_BAR_HEIGHT: u32 = 12;
const LABEL_TEXT_COLOR: [u8; 3] = [255, 255, 255];
const LABEL_PADDING: i64 = 2;
const GLYPH_SIZE: i64 = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayInstruction {
    pub rect: BoundingBox,
    pub label: String,
    pub color: [u8; 3],
}

pub fn build_overlay(batch: &[MatchResult]) -> Vec<OverlayInstruction> {
    batch
        .iter()
        .map(|result| {
            let (label, color) = match &result.identity {
                Some(identity) => (
                    format!("{} ({})", identity.display_name, score_text(result.score)),
                    RECOGNIZED_COLOR,
                ),
                None => (result.label().to_string(), UNKNOWN_COLOR),
            };
            OverlayInstruction {
                rect: result.bounding_box,
                label,
                color,
            }
        })
        .collect()
}

fn score_text(score: MatchScore) -> String {
    match score {
        MatchScore::Confidence(confidence) => format!("{confidence:.0}%"),
        MatchScore::Distance(distance) => format!("{distance:.2}"),
    }
}

/// Burns the outlines and labels into `image`, clipped to its bounds. The
/// label bar sits above the box, or inside its top edge when there is no
/// room; text that does not fit the box width is cut off.
pub fn draw_overlay(image: &mut RgbImage, instructions: &[OverlayInstruction]) {
    for instruction in instructions {
        let color = Rgb(instruction.color);
        let rect = instruction.rect;
        let (x0, y0) = (rect.x as i64, rect.y as i64);
        let (x1, y1) = (x0 + rect.width as i64, y0 + rect.height as i64);
        let t = OUTLINE_THICKNESS as i64;

        fill(image, x0, y0, x1, y0 + t, color);
        fill(image, x0, y1 - t, x1, y1, color);
        fill(image, x0, y0, x0 + t, y1, color);
        fill(image, x1 - t, y0, x1, y1, color);

        let bar = LABEL_BAR_HEIGHT as i64;
        let bar_top = if y0 - bar >= 0 { y0 - bar } else { y0 };
        fill(image, x0, bar_top, x1, bar_top + bar, color);
        draw_text(image, &instruction.label, x0 + LABEL_PADDING, bar_top + LABEL_PADDING, x1);
    }
}

/// Decodes `frame` and draws `instructions` over it.
pub fn render_preview(frame: &Frame, instructions: &[OverlayInstruction]) -> Result<RgbImage> {
    let mut image = frame.decode()?.to_rgb8();
    draw_overlay(&mut image, instructions);
    Ok(image)
}

/// Renders and saves the preview; the format follows the file extension.
pub fn write_preview(frame: &Frame, instructions: &[OverlayInstruction], path: &Path) -> Result<()> {
    render_preview(frame, instructions)?
        .save(path)
        .with_context(|| format!("failed to write preview to {}", path.display()))
}

fn draw_text(image: &mut RgbImage, text: &str, left: i64, top: i64, right: i64) {
    let color = Rgb(LABEL_TEXT_COLOR);
    let mut x = left;
    for ch in text.chars() {
        if x + GLYPH_SIZE > right {
            break;
        }
        // Characters outside basic ASCII leave a blank cell.
        if let Some(glyph) = BASIC_FONTS.get(ch) {
            for (row, bits) in glyph.iter().enumerate() {
                for col in 0..GLYPH_SIZE {
                    if bits & (1u8 << col) != 0 {
                        put(image, x + col, top + row as i64, color);
                    }
                }
            }
        }
        x += GLYPH_SIZE;
    }
}

fn fill(image: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>) {
    let (width, height) = (image.width() as i64, image.height() as i64);
    for y in y0.max(0)..y1.min(height) {
        for x in x0.max(0)..x1.min(width) {
            put(image, x, y, color);
        }
    }
}

fn put(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && x < image.width() as i64 && y < image.height() as i64 {
        image.put_pixel(x as u32, y as u32, color);
    }
}
