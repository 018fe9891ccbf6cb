use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thermsync_core::TemperatureUnit;
use thermsync_hw::devices::{PURETHERMAL_PID, PURETHERMAL_VID};
use thermsync_hw::frame::{COLOR_HEIGHT, COLOR_WIDTH, THERMAL_HEIGHT, THERMAL_WIDTH};
use thermsync_hw::FrameShape;

/// Capture configuration: defaults, then an optional TOML file, then
/// `THERMSYNC_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture iterations per second.
    pub frame_rate: u32,
    /// Preview updates per second.
    pub display_rate: u32,
    /// Maximum wait for one thermal frame, in seconds.
    pub thermal_timeout_secs: u64,
    pub thermal_width: u32,
    pub thermal_height: u32,
    pub color_width: u32,
    pub color_height: u32,
    /// Number of `/dev/videoN` indices probed for the color camera.
    pub color_probe_attempts: u32,
    /// Offline RGB-to-thermal calibration (2×3 affine, text).
    pub tform_path: Option<PathBuf>,
    /// TrueType/OpenType font for preview labels.
    pub font_path: Option<PathBuf>,
    pub font_px: f32,
    pub unit: TemperatureUnit,
    pub gamma: f64,
    pub thermal_vendor_id: u16,
    pub thermal_product_id: u16,
    /// Explicit thermal V4L2 node; skips the sysfs VID:PID lookup.
    pub thermal_device: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_rate: 4,
            display_rate: 1,
            thermal_timeout_secs: 10,
            thermal_width: THERMAL_WIDTH,
            thermal_height: THERMAL_HEIGHT,
            color_width: COLOR_WIDTH,
            color_height: COLOR_HEIGHT,
            color_probe_attempts: 3,
            tform_path: None,
            font_path: None,
            font_px: 10.0,
            unit: TemperatureUnit::Fahrenheit,
            gamma: 1.0,
            thermal_vendor_id: PURETHERMAL_VID,
            thermal_product_id: PURETHERMAL_PID,
            thermal_device: None,
        }
    }
}

impl Config {
    /// Load from `path` (if given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                Self::from_toml(&text).with_context(|| format!("parsing config {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `THERMSYNC_*` keys. Unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.frame_rate = env_parse(lookup("THERMSYNC_FRAME_RATE"), self.frame_rate);
        self.display_rate = env_parse(lookup("THERMSYNC_DISPLAY_RATE"), self.display_rate);
        self.thermal_timeout_secs =
            env_parse(lookup("THERMSYNC_THERMAL_TIMEOUT_SECS"), self.thermal_timeout_secs);
        self.color_probe_attempts =
            env_parse(lookup("THERMSYNC_COLOR_PROBE_ATTEMPTS"), self.color_probe_attempts);
        self.font_px = env_parse(lookup("THERMSYNC_FONT_PX"), self.font_px);
        self.unit = env_parse(lookup("THERMSYNC_UNIT"), self.unit);
        self.gamma = env_parse(lookup("THERMSYNC_GAMMA"), self.gamma);
        self.thermal_vendor_id = env_hex(lookup("THERMSYNC_THERMAL_VID"), self.thermal_vendor_id);
        self.thermal_product_id = env_hex(lookup("THERMSYNC_THERMAL_PID"), self.thermal_product_id);

        if let Some(p) = lookup("THERMSYNC_TFORM_PATH") {
            self.tform_path = Some(PathBuf::from(p));
        }
        if let Some(p) = lookup("THERMSYNC_FONT_PATH") {
            self.font_path = Some(PathBuf::from(p));
        }
        if let Some(d) = lookup("THERMSYNC_THERMAL_DEVICE") {
            self.thermal_device = Some(d);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.frame_rate == 0 {
            anyhow::bail!("frame_rate must be at least 1");
        }
        if self.display_rate == 0 {
            anyhow::bail!("display_rate must be at least 1");
        }
        Ok(())
    }

    pub fn thermal_shape(&self) -> FrameShape {
        FrameShape::new(self.thermal_width, self.thermal_height)
    }

    pub fn color_shape(&self) -> FrameShape {
        FrameShape::new(self.color_width, self.color_height)
    }

    pub fn thermal_timeout(&self) -> Duration {
        Duration::from_secs(self.thermal_timeout_secs)
    }
}

fn env_parse<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_hex(value: Option<String>, default: u16) -> u16 {
    value
        .and_then(|v| {
            let v = v.trim();
            let digits = v
                .strip_prefix("0x")
                .or_else(|| v.strip_prefix("0X"))
                .unwrap_or(v);
            u16::from_str_radix(digits, 16).ok()
        })
        .unwrap_or(default)
}
