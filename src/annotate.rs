//! Prediction images: kept boxes and labels drawn over the source image.

use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{ImageReader, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::RawDetection;

/// Prefix of written prediction images (`pred_<file>`).
pub const PREDICTION_PREFIX: &str = "pred_";

/// Fonts tried when no label font is given explicitly.
const SYSTEM_FONT_PATHS: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
];

const LABEL_FONT_SIZE: f32 = 16.0;
const BOX_THICKNESS: u32 = 2;
const PALETTE_SIZE: u32 = 16;

pub struct Annotator {
    /// Without a font only boxes are drawn.
    font: Option<FontArc>,
    scale: PxScale,
}

impl Default for Annotator {
    fn default() -> Self {
        Self {
            font: None,
            scale: PxScale::from(LABEL_FONT_SIZE),
        }
    }
}

impl Annotator {
    pub fn with_font(font: FontArc) -> Self {
        Self {
            font: Some(font),
            ..Self::default()
        }
    }

    pub fn from_font_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontArc::try_from_vec(data)
            .map_err(|_| anyhow!("invalid font file {}", path.display()))?;
        Ok(Self::with_font(font))
    }

    /// Uses the first readable system font, or draws boxes only.
    pub fn with_system_font() -> Self {
        for candidate in SYSTEM_FONT_PATHS {
            let path = Path::new(candidate);
            if !path.is_file() {
                continue;
            }
            match Self::from_font_file(path) {
                Ok(annotator) => return annotator,
                Err(err) => log::debug!("skipping font {}: {:#}", candidate, err),
            }
        }
        log::warn!("no label font found; prediction images will carry boxes only");
        Self::default()
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draws each detection's box, and its `class confidence` label when a
    /// font is available.
    pub fn draw(&self, image: &mut RgbImage, detections: &[RawDetection]) {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return;
        }
        let max_x = (width - 1) as f32;
        let max_y = (height - 1) as f32;

        for det in detections {
            let color = class_color(det.class_id);
            let x1 = det.bbox.x1.floor().clamp(0.0, max_x) as i32;
            let y1 = det.bbox.y1.floor().clamp(0.0, max_y) as i32;
            let x2 = det.bbox.x2.ceil().clamp(0.0, max_x) as i32;
            let y2 = det.bbox.y2.ceil().clamp(0.0, max_y) as i32;
            if x2 <= x1 || y2 <= y1 {
                continue;
            }

            for inset in 0..BOX_THICKNESS as i32 {
                let w = x2 - x1 + 1 - 2 * inset;
                let h = y2 - y1 + 1 - 2 * inset;
                if w <= 0 || h <= 0 {
                    break;
                }
                let rect = Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32);
                draw_hollow_rect_mut(image, rect, color);
            }

            if let Some(font) = &self.font {
                let label = format!("{} {:.2}", det.class_name, det.confidence);
                let (text_w, text_h) = text_size(self.scale, font, &label);
                if text_w == 0 || text_h == 0 {
                    continue;
                }
                let label_y = (y1 - text_h as i32 - 2).max(0);
                let band = Rect::at(x1, label_y).of_size(text_w + 4, text_h + 2);
                draw_filled_rect_mut(image, band, color);
                draw_text_mut(
                    image,
                    Rgb([255, 255, 255]),
                    x1 + 2,
                    label_y + 1,
                    self.scale,
                    font,
                    &label,
                );
            }
        }
    }

    /// Decodes `source`, draws `detections` and saves `pred_<file>` under
    /// `output_dir`. The format follows the source file's extension.
    pub fn write_prediction(
        &self,
        source: &Path,
        detections: &[RawDetection],
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let file_name = source
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", source.display()))?;
        let mut image = ImageReader::open(source)
            .with_context(|| format!("failed to open image {}", source.display()))?
            .with_guessed_format()
            .with_context(|| format!("failed to guess format of {}", source.display()))?
            .decode()
            .with_context(|| format!("failed to decode image {}", source.display()))?
            .to_rgb8();

        self.draw(&mut image, detections);

        let dest = output_dir.join(format!(
            "{PREDICTION_PREFIX}{}",
            file_name.to_string_lossy()
        ));
        image
            .save(&dest)
            .with_context(|| format!("failed to write prediction {}", dest.display()))?;
        Ok(dest)
    }
}

/// Stable per-class box color from a small HSV wheel.
pub fn class_color(class_id: u32) -> Rgb<u8> {
    let hue = (class_id % PALETTE_SIZE) as f32 / PALETTE_SIZE as f32 * 360.0;
    hsv_to_rgb(hue, 0.85, 0.95)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h {
        h if h < 60.0 => (c, x, 0.0),
        h if h < 120.0 => (x, c, 0.0),
        h if h < 180.0 => (0.0, c, x),
        h if h < 240.0 => (0.0, x, c),
        h if h < 300.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    Rgb([
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    ])
}
