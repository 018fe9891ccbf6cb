//! The pull-style capability shared by every sensor adapter.

use chrono::NaiveDateTime;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("hardware init failed: {0}")]
    HardwareInit(String),
    #[error("sensor timeout: no frame within {0:?}")]
    SensorTimeout(Duration),
    #[error("no matching color device among {probed} probed indices")]
    DeviceNotFound { probed: u32 },
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("persist failed: {0}")]
    Persist(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result of a `save` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The frame was written to disk.
    Written,
    /// The adapter is disabled; nothing was written.
    Skipped,
}

/// A sensor that hands out one frame per `capture` and can persist the
/// most recent one.
///
/// Implemented by [`ThermalAdapter`](crate::ThermalAdapter) and
/// [`ColorAdapter`](crate::ColorAdapter), each of which has a disabled
/// variant that substitutes zero data and never touches hardware or disk.
pub trait SensorAdapter {
    type Frame;

    /// Pull one frame, replacing the adapter's last-known frame.
    fn capture(&mut self) -> Result<&Self::Frame, SensorError>;

    /// The frame returned by the most recent `capture`.
    fn last_frame(&self) -> &Self::Frame;

    /// Persist the last-known frame, tagging it with `captured_at` where the
    /// file format allows.
    fn save(&self, path: &Path, captured_at: NaiveDateTime) -> Result<SaveOutcome, SensorError>;

    /// Whether the adapter is backed by hardware.
    fn is_enabled(&self) -> bool;
}
