//! Product-card rendering: source photo, price tag, discount badge,
//! watermark, composed into one square JPEG.

use crate::errors::ApiError;
use ab_glyph::{FontVec, PxScale};
use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut, draw_text_mut, text_size,
    Blend,
};
use imageproc::rect::Rect;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_CARD_SIZE: u32 = 1080;
const JPEG_QUALITY: u8 = 95;

// Palette
const DISCOUNT_BADGE_COLOR: Rgba<u8> = Rgba([220, 38, 38, 255]);
const DISCOUNT_TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const PRICE_TAG_BG: Rgba<u8> = Rgba([255, 215, 0, 255]);
const PRICE_TAG_BORDER: Rgba<u8> = Rgba([255, 140, 0, 255]);
const NEW_PRICE_COLOR: Rgba<u8> = Rgba([220, 38, 38, 255]);
const OLD_PRICE_COLOR: Rgba<u8> = Rgba([100, 100, 100, 255]);
const STRIKETHROUGH_COLOR: Rgba<u8> = Rgba([220, 38, 38, 255]);
const CURRENCY_COLOR: Rgba<u8> = Rgba([50, 50, 50, 255]);
const WATERMARK_COLOR: Rgba<u8> = Rgba([255, 255, 255, 160]);
const BADGE_SHADOW: Rgba<u8> = Rgba([0, 0, 0, 100]);

// Type sizes
const OLD_PRICE_FONT_SIZE: f32 = 56.0;
const NEW_PRICE_FONT_SIZE: f32 = 96.0;
const DISCOUNT_FONT_SIZE: f32 = 56.0;
const WATERMARK_FONT_SIZE: f32 = 28.0;
const CURRENCY_FONT_SIZE: f32 = 48.0;

// Geometry
const BADGE_PADDING: i32 = 20;
const BADGE_RADIUS: i32 = 16;
const BADGE_MARGIN: i32 = 24;
const PRICE_TAG_HEIGHT: i32 = 180;
const PRICE_TAG_MARGIN: i32 = 30;
const PRICE_TAG_RADIUS: i32 = 24;
const WATERMARK_MARGIN: i32 = 20;

const WATERMARK_TEXT: &str = "Karavan Express";
const CURRENCY_TEXT: &str = "сом";

/// System fonts with Cyrillic coverage, tried in order.
const CYRILLIC_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:/Windows/Fonts/arialbd.ttf",
    "C:/Windows/Fonts/arial.ttf",
];

/// Renderer contract; the orchestrator substitutes the raw photo when a
/// card cannot be produced.
pub trait CardRenderer: Send + Sync {
    fn render(
        &self,
        image_path: &Path,
        price_local: i64,
        old_price_local: i64,
        discount_pct: i32,
    ) -> Result<PathBuf, ApiError>;
}

/// Thousands separated by thin spaces, the local convention.
pub fn format_price(value: i64) -> String {
    let digits: Vec<char> = value.abs().to_string().chars().collect();
    let mut out = String::new();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(*c);
    }
    if value < 0 {
        format!("-{out}")
    } else {
        out
    }
}

fn find_font() -> Result<FontVec> {
    for path in CYRILLIC_FONTS {
        if Path::new(path).exists() {
            let bytes = std::fs::read(path).with_context(|| format!("reading font {path}"))?;
            if let Ok(font) = FontVec::try_from_vec(bytes) {
                return Ok(font);
            }
        }
    }
    bail!("no Cyrillic-capable font found on this system");
}

/// Filled rectangle with rounded corners: a cross of two rects plus four
/// corner circles.
fn draw_rounded_rect(canvas: &mut Blend<RgbaImage>, x: i32, y: i32, w: i32, h: i32, radius: i32, color: Rgba<u8>) {
    let r = radius.min(w / 2).min(h / 2).max(0);

    draw_filled_rect_mut(
        canvas,
        Rect::at(x + r, y).of_size((w - 2 * r).max(1) as u32, h.max(1) as u32),
        color,
    );
    draw_filled_rect_mut(
        canvas,
        Rect::at(x, y + r).of_size(w.max(1) as u32, (h - 2 * r).max(1) as u32),
        color,
    );

    for (cx, cy) in [
        (x + r, y + r),
        (x + w - r - 1, y + r),
        (x + r, y + h - r - 1),
        (x + w - r - 1, y + h - r - 1),
    ] {
        draw_filled_circle_mut(canvas, (cx, cy), r, color);
    }
}

pub struct CardCompositor {
    output_dir: PathBuf,
    card_size: u32,
    font: FontVec,
}

impl CardCompositor {
    pub fn new(output_dir: PathBuf, card_size: u32) -> Result<Self> {
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
        Ok(Self {
            output_dir,
            card_size,
            font: find_font()?,
        })
    }

    fn measure(&self, text: &str, size: f32) -> (i32, i32) {
        let (w, h) = text_size(PxScale::from(size), &self.font, text);
        (w as i32, h as i32)
    }

    /// Right-truncate with an ellipsis until the text fits `max_width`.
    fn fit_text(&self, text: &str, size: f32, max_width: i32) -> String {
        if self.measure(text, size).0 <= max_width {
            return text.to_string();
        }
        let mut chars: Vec<char> = text.chars().collect();
        while chars.len() > 1 {
            chars.pop();
            let candidate: String = chars.iter().collect::<String>() + "…";
            if self.measure(&candidate, size).0 <= max_width {
                return candidate;
            }
        }
        "…".to_string()
    }

    /// Normalise colour space and flatten any alpha onto white.
    fn normalise(&self, img: DynamicImage) -> RgbaImage {
        let rgba = img.to_rgba8();
        let mut flattened = RgbaImage::from_pixel(rgba.width(), rgba.height(), Rgba([255, 255, 255, 255]));
        image::imageops::overlay(&mut flattened, &rgba, 0, 0);
        flattened
    }

    /// Centre-crop to square, bilinear resample to the card size, sharpen
    /// when the source needed upscaling by more than ~30%.
    fn smart_resize(&self, img: RgbaImage) -> RgbaImage {
        let (width, height) = (img.width(), img.height());
        let side = width.min(height);
        let x = (width - side) / 2;
        let y = (height - side) / 2;

        let img = DynamicImage::ImageRgba8(img);
        let cropped = img.crop_imm(x, y, side, side);

        if side == self.card_size {
            return cropped.to_rgba8();
        }

        let resized = cropped.resize_exact(self.card_size, self.card_size, FilterType::Triangle);

        if (side as f32) < self.card_size as f32 * 0.7 {
            // Heavy upscale: recover perceived sharpness and punch
            return resized.unsharpen(1.5, 2).adjust_contrast(10.0).to_rgba8();
        }
        resized.to_rgba8()
    }

    fn draw_price_tag(&self, canvas: &mut Blend<RgbaImage>, price_local: i64, old_price_local: i64) {
        let size = self.card_size as i32;
        let tag_w = size - PRICE_TAG_MARGIN * 2;
        let tag_h = PRICE_TAG_HEIGHT;
        let tag_x = PRICE_TAG_MARGIN;
        let tag_y = size - tag_h - PRICE_TAG_MARGIN;

        draw_rounded_rect(
            canvas,
            tag_x - 3,
            tag_y - 3,
            tag_w + 6,
            tag_h + 6,
            PRICE_TAG_RADIUS + 3,
            PRICE_TAG_BORDER,
        );
        draw_rounded_rect(canvas, tag_x, tag_y, tag_w, tag_h, PRICE_TAG_RADIUS, PRICE_TAG_BG);

        let max_text_width = tag_w - 2 * PRICE_TAG_RADIUS;
        let old_text = self.fit_text(&format_price(old_price_local), OLD_PRICE_FONT_SIZE, max_text_width / 3);
        let new_text = self.fit_text(&format_price(price_local), NEW_PRICE_FONT_SIZE, max_text_width / 2);

        let (old_w, _) = self.measure(&old_text, OLD_PRICE_FONT_SIZE);
        let (new_w, _) = self.measure(&new_text, NEW_PRICE_FONT_SIZE);
        let (curr_w, _) = self.measure(CURRENCY_TEXT, CURRENCY_FONT_SIZE);

        let arrow_width = 40;
        let gap = 16;
        let total = old_w + 8 + arrow_width + new_w + gap + curr_w;

        let start_x = tag_x + (tag_w - total).max(0) / 2;
        let center_y = tag_y + tag_h / 2;

        // Old price, struck through
        let old_y = center_y - (OLD_PRICE_FONT_SIZE as i32) / 2;
        draw_text_mut(
            canvas,
            OLD_PRICE_COLOR,
            start_x,
            old_y,
            PxScale::from(OLD_PRICE_FONT_SIZE),
            &self.font,
            &old_text,
        );
        let strike_y = (old_y + OLD_PRICE_FONT_SIZE as i32 / 2) as f32;
        draw_line_segment_mut(
            canvas,
            ((start_x - 4) as f32, strike_y),
            ((start_x + old_w + 4) as f32, strike_y),
            STRIKETHROUGH_COLOR,
        );
        draw_line_segment_mut(
            canvas,
            ((start_x - 4) as f32, strike_y + 1.0),
            ((start_x + old_w + 4) as f32, strike_y + 1.0),
            STRIKETHROUGH_COLOR,
        );

        // Arrow
        let arrow_x = start_x + old_w + 8;
        draw_text_mut(
            canvas,
            NEW_PRICE_COLOR,
            arrow_x,
            center_y - 20,
            PxScale::from(OLD_PRICE_FONT_SIZE),
            &self.font,
            "→",
        );

        // New price
        let new_x = arrow_x + arrow_width;
        draw_text_mut(
            canvas,
            NEW_PRICE_COLOR,
            new_x,
            center_y - (NEW_PRICE_FONT_SIZE as i32) / 2 - 5,
            PxScale::from(NEW_PRICE_FONT_SIZE),
            &self.font,
            &new_text,
        );

        // Currency literal
        draw_text_mut(
            canvas,
            CURRENCY_COLOR,
            new_x + new_w + gap,
            center_y - (CURRENCY_FONT_SIZE as i32) / 2 + 5,
            PxScale::from(CURRENCY_FONT_SIZE),
            &self.font,
            CURRENCY_TEXT,
        );
    }

    fn draw_discount_badge(&self, canvas: &mut Blend<RgbaImage>, discount_pct: i32) {
        let text = format!("-{discount_pct}%");
        let (text_w, text_h) = self.measure(&text, DISCOUNT_FONT_SIZE);

        let badge_w = text_w + BADGE_PADDING * 2;
        let badge_h = text_h + BADGE_PADDING * 2;
        let badge_x = self.card_size as i32 - badge_w - BADGE_MARGIN;
        let badge_y = BADGE_MARGIN;

        draw_rounded_rect(canvas, badge_x + 4, badge_y + 4, badge_w, badge_h, BADGE_RADIUS, BADGE_SHADOW);
        draw_rounded_rect(canvas, badge_x, badge_y, badge_w, badge_h, BADGE_RADIUS, DISCOUNT_BADGE_COLOR);

        draw_text_mut(
            canvas,
            DISCOUNT_TEXT_COLOR,
            badge_x + BADGE_PADDING,
            badge_y + BADGE_PADDING - 4,
            PxScale::from(DISCOUNT_FONT_SIZE),
            &self.font,
            &text,
        );
    }

    fn draw_watermark(&self, canvas: &mut Blend<RgbaImage>) {
        let (_, text_h) = self.measure(WATERMARK_TEXT, WATERMARK_FONT_SIZE);
        let y = self.card_size as i32 - PRICE_TAG_HEIGHT - PRICE_TAG_MARGIN - text_h - WATERMARK_MARGIN;
        draw_text_mut(
            canvas,
            WATERMARK_COLOR,
            WATERMARK_MARGIN,
            y,
            PxScale::from(WATERMARK_FONT_SIZE),
            &self.font,
            WATERMARK_TEXT,
        );
    }

    fn render_inner(
        &self,
        image_path: &Path,
        price_local: i64,
        old_price_local: i64,
        discount_pct: i32,
    ) -> Result<PathBuf> {
        if price_local <= 0 {
            bail!("price must be positive: {price_local}");
        }
        if !(0..=100).contains(&discount_pct) {
            bail!("discount must be within 0-100: {discount_pct}");
        }

        let source = image::open(image_path)
            .with_context(|| format!("opening {}", image_path.display()))?;
        let base = self.smart_resize(self.normalise(source));

        let mut canvas = Blend(base);
        self.draw_price_tag(&mut canvas, price_local, old_price_local.max(price_local));
        if discount_pct > 0 {
            self.draw_discount_badge(&mut canvas, discount_pct);
        }
        self.draw_watermark(&mut canvas);

        let output_path = self
            .output_dir
            .join(format!("{}_card.jpg", uuid::Uuid::new_v4().simple()));

        let rgb = DynamicImage::ImageRgba8(canvas.0).to_rgb8();
        let file = File::create(&output_path)
            .with_context(|| format!("creating {}", output_path.display()))?;
        let mut writer = BufWriter::new(file);
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
        DynamicImage::ImageRgb8(rgb)
            .write_with_encoder(encoder)
            .context("encoding card jpeg")?;

        info!(
            "card rendered: {} ({} -> {} som, -{}%)",
            output_path.display(),
            old_price_local,
            price_local,
            discount_pct
        );
        Ok(output_path)
    }
}

impl CardRenderer for CardCompositor {
    fn render(
        &self,
        image_path: &Path,
        price_local: i64,
        old_price_local: i64,
        discount_pct: i32,
    ) -> Result<PathBuf, ApiError> {
        self.render_inner(image_path, price_local, old_price_local, discount_pct)
            .map_err(|e| {
                warn!("card rendering failed for {}: {e:#}", image_path.display());
                ApiError::BusinessRule(format!("card rendering: {e}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prices_format_with_thin_spaces() {
        assert_eq!(format_price(999), "999");
        assert_eq!(format_price(1299), "1 299");
        assert_eq!(format_price(120999), "120 999");
        assert_eq!(format_price(1000000), "1 000 000");
    }

    fn compositor() -> Option<CardCompositor> {
        let dir = std::env::temp_dir().join("karavan-card-tests");
        CardCompositor::new(dir, 320).ok()
    }

    fn sample_photo(dir: &Path) -> PathBuf {
        let path = dir.join("sample.png");
        let img = RgbaImage::from_fn(400, 300, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn renders_a_square_jpeg_card() {
        // Skips quietly on systems without a Cyrillic-capable font
        let Some(compositor) = compositor() else { return };
        let dir = tempfile::tempdir().unwrap();
        let photo = sample_photo(dir.path());

        let card = compositor.render(&photo, 1299, 1999, 35).unwrap();
        assert!(card.extension().map(|e| e == "jpg").unwrap_or(false));

        let rendered = image::open(&card).unwrap();
        assert_eq!(rendered.width(), 320);
        assert_eq!(rendered.height(), 320);
    }

    #[test]
    fn zero_discount_skips_the_badge_but_renders() {
        let Some(compositor) = compositor() else { return };
        let dir = tempfile::tempdir().unwrap();
        let photo = sample_photo(dir.path());
        assert!(compositor.render(&photo, 499, 499, 0).is_ok());
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let Some(compositor) = compositor() else { return };
        let dir = tempfile::tempdir().unwrap();
        let photo = sample_photo(dir.path());

        assert!(compositor.render(&photo, 0, 100, 10).is_err());
        assert!(compositor.render(&photo, 100, 140, 150).is_err());
        assert!(compositor
            .render(Path::new("/nonexistent/photo.jpg"), 100, 140, 10)
            .is_err());
    }

    #[test]
    fn fit_text_truncates_with_ellipsis() {
        let Some(compositor) = compositor() else { return };
        let long = "очень длинная строка с ценой 1 299 сом";
        let fitted = compositor.fit_text(long, 56.0, 120);
        assert!(fitted.ends_with('…'));
        assert!(compositor.measure(&fitted, 56.0).0 <= 120);

        assert_eq!(compositor.fit_text("99", 56.0, 10_000), "99");
    }
}
