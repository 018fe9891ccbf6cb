//! RGB-to-thermal alignment via a precomputed 2×3 affine transform.
//!
//! The transform comes from an offline calibration and is loaded once from a
//! text file of comma/whitespace separated values, row-major:
//! ```text
//! a, b, tx
//! c, d, ty
//! ```
//! A 3×3 homogeneous matrix is also accepted; its last row is ignored.

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error("failed to read calibration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid matrix value {0:?}")]
    InvalidValue(String),
    #[error("expected 6 (2×3) or 9 (3×3) values, got {0}")]
    WrongValueCount(usize),
}

/// Integer rectangle in thermal pixel space, inclusive corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThermalRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl ThermalRect {
    /// Rectangle spanning two arbitrary corners.
    pub fn from_corners(a: (i32, i32), b: (i32, i32)) -> Self {
        Self {
            x0: a.0.min(b.0),
            y0: a.1.min(b.1),
            x1: a.0.max(b.0),
            y1: a.1.max(b.1),
        }
    }

    pub fn width(&self) -> u32 {
        (self.x1 - self.x0 + 1).max(1) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y1 - self.y0 + 1).max(1) as u32
    }

    /// Reflect across the vertical center line of a panel `panel_width` wide.
    pub fn mirrored(&self, panel_width: u32) -> Self {
        let last = panel_width as i32 - 1;
        Self::from_corners((last - self.x0, self.y0), (last - self.x1, self.y1))
    }
}

/// Affine map from RGB pixel coordinates to thermal pixel coordinates.
/// Immutable once loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentTransform {
    matrix: [[f64; 3]; 2],
}

impl AlignmentTransform {
    pub fn from_rows(matrix: [[f64; 3]; 2]) -> Self {
        Self { matrix }
    }

    pub fn identity() -> Self {
        Self::from_rows([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]])
    }

    /// Parse the calibration text format.
    pub fn parse(text: &str) -> Result<Self, AlignmentError> {
        let values = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .flat_map(|l| l.split(|c: char| c == ',' || c.is_whitespace()))
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                tok.parse::<f64>()
                    .map_err(|_| AlignmentError::InvalidValue(tok.to_string()))
            })
            .collect::<Result<Vec<f64>, _>>()?;

        match values.len() {
            6 | 9 => {}
            n => return Err(AlignmentError::WrongValueCount(n)),
        }
        if values.len() == 9 && values[6..] != [0.0, 0.0, 1.0] {
            tracing::warn!(
                last_row = ?&values[6..],
                "calibration matrix is not affine; ignoring its last row"
            );
        }

        Ok(Self::from_rows([
            [values[0], values[1], values[2]],
            [values[3], values[4], values[5]],
        ]))
    }

    /// Load the transform from a calibration file.
    pub fn load(path: &Path) -> Result<Self, AlignmentError> {
        let text = std::fs::read_to_string(path).map_err(|source| AlignmentError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let transform = Self::parse(&text)?;
        tracing::info!(path = %path.display(), matrix = ?transform.matrix, "alignment transform loaded");
        Ok(transform)
    }

    pub fn matrix(&self) -> &[[f64; 3]; 2] {
        &self.matrix
    }

    /// Apply the transform to one point, without rounding.
    pub fn apply(&self, (x, y): (f64, f64)) -> (f64, f64) {
        let [r0, r1] = &self.matrix;
        (
            r0[0] * x + r0[1] * y + r0[2],
            r1[0] * x + r1[1] * y + r1[2],
        )
    }

    /// Map RGB-space points into thermal space, truncating toward zero.
    pub fn map_points(&self, points: &[(f64, f64)]) -> Vec<(i32, i32)> {
        points
            .iter()
            .map(|&p| {
                let (x, y) = self.apply(p);
                (x as i32, y as i32)
            })
            .collect()
    }

    /// Thermal-space rectangle covered by an RGB frame of the given size.
    pub fn color_footprint(&self, width: u32, height: u32) -> ThermalRect {
        let corners = self.map_points(&[(0.0, 0.0), (width as f64, height as f64)]);
        ThermalRect::from_corners(corners[0], corners[1])
    }
}

impl Default for AlignmentTransform {
    fn default() -> Self {
        Self::identity()
    }
}
