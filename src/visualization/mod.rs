//! Box annotation of the processed camera image.
//!
//! Detections are outlined in red, fused detections in green with their
//! distance (`12.3m`) written under the box. The result is re-encoded as PNG
//! for the response.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};
use thiserror::Error;

use crate::processors::detector::Detection2D;
use crate::processors::fusion::FusedObject;

/// Errors that can occur while decoding or encoding images.
#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("could not encode PNG: {0}")]
    Encode(#[source] image::ImageError),

    #[error("image has zero width or height")]
    EmptyImage,
}

/// Result type for annotation operations.
pub type Result<T> = std::result::Result<T, AnnotateError>;

pub const DETECTION_COLOR: Rgb<u8> = Rgb([228, 26, 28]);

pub const FUSED_COLOR: Rgb<u8> = Rgb([77, 175, 74]);

/// Outline thickness in pixels.
const LINE_WIDTH: u32 = 2;

/// Distance labels use a 3x5 bitmap font scaled by this factor.
const LABEL_SCALE: u32 = 2;

/// Gap between a box's bottom edge and its label.
const LABEL_GAP: u32 = 5;

/// Rows of a 3x5 glyph, most significant of the low three bits leftmost.
fn glyph(c: char) -> [u8; 5] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        'm' => [0b000, 0b000, 0b110, 0b111, 0b101],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        _ => [0; 5],
    }
}

/// Pixel width of `text` as drawn by [`draw_label`].
fn label_width(text: &str) -> u32 {
    let n = text.chars().count() as u32;
    (n * 4).saturating_sub(1) * LABEL_SCALE
}

/// Write `text` with its top-left corner at `(x, y)`; pixels outside the
/// image are skipped.
pub fn draw_label(img: &mut RgbImage, text: &str, x: i64, y: i64, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    let scale = LABEL_SCALE as i64;
    for (i, c) in text.chars().enumerate() {
        let left = x + i as i64 * 4 * scale;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..3i64 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = left + col * scale + dx;
                        let py = y + row as i64 * scale + dy;
                        if px >= 0 && py >= 0 && px < w as i64 && py < h as i64 {
                            img.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
    }
}

/// Decode an uploaded image (PNG or JPEG) to 8-bit RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory(bytes)
        .map_err(AnnotateError::Decode)?
        .into_rgb8();
    if img.width() == 0 || img.height() == 0 {
        return Err(AnnotateError::EmptyImage);
    }
    Ok(img)
}

/// Outline each `[x_min, y_min, x_max, y_max]` box, clipped to the image.
pub fn draw_boxes<I>(img: &mut RgbImage, boxes: I, color: Rgb<u8>)
where
    I: IntoIterator<Item = [f64; 4]>,
{
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp = |v: f64, hi: u32| -> Option<u32> {
        if !v.is_finite() {
            return None;
        }
        Some(v.round().clamp(0.0, (hi - 1) as f64) as u32)
    };

    for b in boxes {
        if b[2] < 0.0 || b[3] < 0.0 || b[0] >= w as f64 || b[1] >= h as f64 {
            continue;
        }
        let (Some(x0), Some(y0), Some(x1), Some(y1)) =
            (clamp(b[0], w), clamp(b[1], h), clamp(b[2], w), clamp(b[3], h))
        else {
            continue;
        };

        for t in 0..LINE_WIDTH {
            for x in x0..=x1 {
                img.put_pixel(x, (y0 + t).min(h - 1), color);
                img.put_pixel(x, y1.saturating_sub(t), color);
            }
            for y in y0..=y1 {
                img.put_pixel((x0 + t).min(w - 1), y, color);
                img.put_pixel(x1.saturating_sub(t), y, color);
            }
        }
    }
}

/// Draw detections and fused objects over `base`.
///
/// When the detector already rendered its detections, pass that rendering
/// as `base` and `detections` as empty.
pub fn annotate(base: &RgbImage, detections: &[Detection2D], fused: &[FusedObject]) -> RgbImage {
    let mut img = base.clone();
    draw_boxes(&mut img, detections.iter().map(|d| d.bbox), DETECTION_COLOR);
    draw_boxes(&mut img, fused.iter().map(|f| f.bbox2d), FUSED_COLOR);
    for f in fused {
        let b = f.bbox2d;
        if !f.distance.is_finite() || b.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let text = format!("{:.1}m", f.distance);
        // Centered under the box
        let x = ((b[0] + b[2]) / 2.0).round() as i64 - label_width(&text) as i64 / 2;
        let y = b[3].round() as i64 + LABEL_GAP as i64;
        draw_label(&mut img, &text, x, y, FUSED_COLOR);
    }
    img
}

/// Encode an image as PNG bytes.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(AnnotateError::Encode)?;
    Ok(buf.into_inner())
}

/// PNG-encode and base64 the image for a JSON response.
pub fn encode_png_base64(img: &RgbImage) -> Result<String> {
    Ok(STANDARD.encode(encode_png(img)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(bbox: [f64; 4]) -> Detection2D {
        Detection2D {
            bbox,
            class_id: 0,
            label: None,
            confidence: 0.5,
        }
    }

    #[test]
    fn test_draw_boxes_outline_only() {
        let mut img = RgbImage::new(50, 50);
        draw_boxes(&mut img, [[10.0, 10.0, 30.0, 30.0]], DETECTION_COLOR);

        assert_eq!(*img.get_pixel(10, 10), DETECTION_COLOR);
        assert_eq!(*img.get_pixel(30, 20), DETECTION_COLOR);
        assert_eq!(*img.get_pixel(20, 20), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_boxes_clips_and_skips() {
        let mut img = RgbImage::new(20, 20);
        draw_boxes(
            &mut img,
            [
                [-5.0, -5.0, 100.0, 100.0],
                [50.0, 50.0, 60.0, 60.0],
                [f64::NAN, 0.0, 5.0, 5.0],
            ],
            FUSED_COLOR,
        );
        assert_eq!(*img.get_pixel(0, 0), FUSED_COLOR);
        assert_eq!(*img.get_pixel(19, 19), FUSED_COLOR);
        assert_eq!(*img.get_pixel(10, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_annotate_fused_drawn_over_detection() {
        let base = RgbImage::new(40, 40);
        let det = detection([5.0, 5.0, 20.0, 20.0]);
        let fused = FusedObject {
            bbox2d: det.bbox,
            bbox3d: [0.0; 6],
            category: "car".into(),
            confidence: 0.5,
            distance: 1.0,
            position: [0.0, 0.0, 1.0],
            cluster_id: 0,
            num_points: 3,
        };
        let img = annotate(&base, &[det], &[fused]);
        assert_eq!(*img.get_pixel(5, 5), FUSED_COLOR);
    }

    #[test]
    fn test_draw_label_glyph_pixels() {
        let mut img = RgbImage::new(20, 12);
        draw_label(&mut img, "1", 0, 0, FUSED_COLOR);
        // Top row of '1' is 010, scaled by two
        assert_eq!(*img.get_pixel(2, 0), FUSED_COLOR);
        assert_eq!(*img.get_pixel(3, 1), FUSED_COLOR);
        assert_eq!(*img.get_pixel(0, 0), Rgb([0, 0, 0]));
        // Bottom row is 111
        assert_eq!(*img.get_pixel(0, 9), FUSED_COLOR);
        assert_eq!(*img.get_pixel(5, 9), FUSED_COLOR);

        // Off-image text is clipped, not a panic
        draw_label(&mut img, "88.8m", -7, 8, FUSED_COLOR);
        draw_label(&mut img, "8", 1000, 1000, FUSED_COLOR);
    }

    #[test]
    fn test_annotate_writes_distance_under_fused_box() {
        let base = RgbImage::new(80, 60);
        let fused = FusedObject {
            bbox2d: [10.0, 5.0, 70.0, 20.0],
            bbox3d: [0.0; 6],
            category: "car".into(),
            confidence: 0.5,
            distance: 12.3,
            position: [0.0, 0.0, 12.3],
            cluster_id: 0,
            num_points: 3,
        };
        let img = annotate(&base, &[], &[fused]);

        let label_rows = 25..35;
        let green = (0..80)
            .flat_map(|x| label_rows.clone().map(move |y| (x, y)))
            .filter(|&(x, y)| *img.get_pixel(x, y) == FUSED_COLOR)
            .count();
        assert!(green > 0);
        // Nothing between the box and the label
        assert!((0..80).all(|x| *img.get_pixel(x, 23) == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_png_round_trip_and_base64() {
        let mut img = RgbImage::new(8, 6);
        img.put_pixel(3, 2, Rgb([1, 2, 3]));

        let png = encode_png(&img).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
        let decoded = decode_image(&png).unwrap();
        assert_eq!(decoded.dimensions(), (8, 6));
        assert_eq!(*decoded.get_pixel(3, 2), Rgb([1, 2, 3]));

        let b64 = encode_png_base64(&img).unwrap();
        assert_eq!(STANDARD.decode(b64).unwrap(), png);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode_image(b"not an image"),
            Err(AnnotateError::Decode(_))
        ));
    }
}
