//! Radiometric conversion: raw Lepton counts to temperature and to an 8-bit
//! preview image.
//!
//! The sensor runs in TLinear mode: each count is 0.01 K, so 27315 counts is
//! 0 °C.

use image::{GrayImage, Luma};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thermsync_hw::RawThermalFrame;

/// Raw count corresponding to 0 °C.
pub const RAW_ZERO_CELSIUS: f64 = 27315.0;
/// Raw counts per degree.
pub const COUNTS_PER_DEGREE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    Celsius,
    #[default]
    Fahrenheit,
    Kelvin,
}

impl TemperatureUnit {
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            Self::Celsius => celsius,
            Self::Fahrenheit => celsius * 1.8 + 32.0,
            Self::Kelvin => celsius + 273.15,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Celsius => "C",
            Self::Fahrenheit => "F",
            Self::Kelvin => "K",
        }
    }
}

impl FromStr for TemperatureUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" | "celsius" => Ok(Self::Celsius),
            "f" | "fahrenheit" => Ok(Self::Fahrenheit),
            "k" | "kelvin" => Ok(Self::Kelvin),
            other => Err(format!("unknown temperature unit: {other}")),
        }
    }
}

/// Convert one raw count to degrees Celsius.
pub fn count_to_celsius(raw: u16) -> f64 {
    (raw as f64 - RAW_ZERO_CELSIUS) / COUNTS_PER_DEGREE
}

/// Elementwise conversion of a raw frame to temperature in `unit`.
pub fn raw_to_temperature(raw: &RawThermalFrame, unit: TemperatureUnit) -> Array2<f64> {
    raw.mapv(|v| unit.from_celsius(count_to_celsius(v)))
}

/// Min-max normalize the frame to the full 16-bit range, then keep the top
/// 8 bits.
///
/// A constant frame normalizes to all zeros.
pub fn raw_to_visual(raw: &RawThermalFrame) -> GrayImage {
    let (height, width) = raw.dim();
    let (lo, hi) = raw
        .iter()
        .fold((u16::MAX, u16::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let scale = if hi > lo {
        65535.0 / (hi - lo) as f64
    } else {
        0.0
    };

    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let v = raw[[y as usize, x as usize]];
        let normalized = ((v.saturating_sub(lo)) as f64 * scale)
            .round()
            .clamp(0.0, 65535.0) as u16;
        Luma([(normalized >> 8) as u8])
    })
}

/// Scene temperature extremes of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureStats {
    pub min: f64,
    pub max: f64,
    pub unit: TemperatureUnit,
}

impl TemperatureStats {
    /// `None` for an empty frame.
    pub fn from_raw(raw: &RawThermalFrame, unit: TemperatureUnit) -> Option<Self> {
        let (lo, hi) = raw
            .iter()
            .fold(None, |acc: Option<(u16, u16)>, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })?;
        // The conversion is monotonic, so extremes of counts are extremes of temperature.
        Some(Self {
            min: unit.from_celsius(count_to_celsius(lo)),
            max: unit.from_celsius(count_to_celsius(hi)),
            unit,
        })
    }

    /// `min,max` as whole degrees, truncated toward zero.
    pub fn label(&self) -> String {
        format!("{},{}", self.min.trunc() as i64, self.max.trunc() as i64)
    }
}

/// Gamma correction through a 256-entry lookup table. `gamma == 1.0` is the
/// identity.
pub fn adjust_gamma(image: &mut GrayImage, gamma: f64) {
    if gamma <= 0.0 || gamma.is_nan() || (gamma - 1.0).abs() < f64::EPSILON {
        return;
    }
    let inv = 1.0 / gamma;
    let table: Vec<u8> = (0..=255u32)
        .map(|i| ((i as f64 / 255.0).powf(inv) * 255.0) as u8)
        .collect();
    for px in image.pixels_mut() {
        px.0[0] = table[px.0[0] as usize];
    }
}
