//! Side-by-side preview: thermal panel with overlays, mirrored color panel.
//!
//! Everything here works on copies. Persisted frames are never touched.

use crate::alignment::{AlignmentTransform, ThermalRect};
use crate::radiometry::{self, TemperatureStats, TemperatureUnit};
use crate::types::FramePair;
use ab_glyph::{FontVec, PxScale};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use thermsync_hw::FrameShape;

/// Overlay color for the alignment box and labels: azure blue
/// (`#0096FF`), the BGR accent (255, 150, 0) in RGB channel order.
pub const ACCENT: Rgb<u8> = Rgb([0, 150, 255]);

/// Alignment rectangle used when no calibration transform is configured.
pub const DEFAULT_ALIGNMENT_RECT: ThermalRect = ThermalRect {
    x0: 40,
    y0: 10,
    x1: 120,
    y1: 110,
};

const LABEL_X: i32 = 3;

#[derive(Debug, Clone)]
pub struct CompositorConfig {
    /// Capture rate, used to turn the iteration index into elapsed time.
    pub frame_rate: u32,
    pub unit: TemperatureUnit,
    pub gamma: f64,
    pub font_px: f32,
    /// When false the temperature label reads `NA`.
    pub thermal_enabled: bool,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            frame_rate: 4,
            unit: TemperatureUnit::Fahrenheit,
            gamma: 1.0,
            font_px: 10.0,
            thermal_enabled: true,
        }
    }
}

/// The rectangle the color camera covers in thermal space, computed once.
pub fn alignment_rect(transform: Option<&AlignmentTransform>, color: FrameShape) -> ThermalRect {
    match transform {
        Some(t) => t.color_footprint(color.width, color.height),
        None => DEFAULT_ALIGNMENT_RECT,
    }
}

/// `m:ss` elapsed since the session start.
pub fn elapsed_label(iteration: u64, frame_rate: u32) -> String {
    let total_secs = iteration / frame_rate.max(1) as u64;
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

pub struct Compositor {
    config: CompositorConfig,
    rect: ThermalRect,
    font: Option<FontVec>,
}

impl Compositor {
    pub fn new(config: CompositorConfig, rect: ThermalRect, font: Option<FontVec>) -> Self {
        if font.is_none() {
            tracing::debug!("no overlay font; preview labels disabled");
        }
        Self { config, rect, font }
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    pub fn rect(&self) -> ThermalRect {
        self.rect
    }

    fn temperature_label(&self, pair: &FramePair<'_>) -> String {
        if !self.config.thermal_enabled {
            return "NA".to_string();
        }
        TemperatureStats::from_raw(pair.thermal, self.config.unit)
            .map(|s| s.label())
            .unwrap_or_else(|| "NA".to_string())
    }

    /// Thermal visualization, mirrored, with labels and alignment rectangle.
    pub fn thermal_panel(&self, pair: &FramePair<'_>) -> RgbImage {
        let mut gray = radiometry::raw_to_visual(pair.thermal);
        radiometry::adjust_gamma(&mut gray, self.config.gamma);
        let mut panel = DynamicImage::ImageLuma8(gray).to_rgb8();
        imageops::flip_horizontal_in_place(&mut panel);

        let rect = self.rect.mirrored(panel.width());
        draw_hollow_rect_mut(
            &mut panel,
            Rect::at(rect.x0, rect.y0).of_size(rect.width(), rect.height()),
            ACCENT,
        );

        if let Some(font) = &self.font {
            let scale = PxScale::from(self.config.font_px);
            let line = self.config.font_px.ceil() as i32;
            let elapsed = elapsed_label(pair.sequence_index, self.config.frame_rate);
            let temps = self.temperature_label(pair);
            draw_text_mut(&mut panel, ACCENT, LABEL_X, 0, scale, font, &elapsed);
            draw_text_mut(&mut panel, ACCENT, LABEL_X, line, scale, font, &temps);
        }
        panel
    }

    /// Color frame scaled to `height` (aspect preserved) and mirrored.
    pub fn color_panel(&self, color: &RgbImage, height: u32) -> RgbImage {
        let (w, h) = color.dimensions();
        if w == 0 || h == 0 || height == 0 {
            return RgbImage::new(0, height);
        }
        let width = ((w as f64 * height as f64 / h as f64) as u32).max(1);
        let mut panel = imageops::resize(color, width, height, FilterType::Triangle);
        imageops::flip_horizontal_in_place(&mut panel);
        panel
    }

    /// Build the full preview for one pair.
    pub fn compose(&self, pair: &FramePair<'_>) -> RgbImage {
        let thermal = self.thermal_panel(pair);
        let color = self.color_panel(pair.color, thermal.height());

        let mut canvas = RgbImage::new(thermal.width() + color.width(), thermal.height());
        imageops::replace(&mut canvas, &thermal, 0, 0);
        imageops::replace(&mut canvas, &color, thermal.width() as i64, 0);
        canvas
    }
}
