//! Thermal sensor adapter: pull-style `capture()` over the push-style stream.

use crate::frame::{FrameShape, RawThermalFrame};
use crate::persist;
use crate::queue::{DequeueError, FrameConsumer};
use crate::sensor::{SaveOutcome, SensorAdapter, SensorError};
use chrono::NaiveDateTime;
use std::path::Path;
use std::time::Duration;

/// Default wait for a radiometric frame before declaring the sensor stalled.
pub const THERMAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Radiometric camera adapter.
pub enum ThermalAdapter {
    /// Backed by the consumer half of the frame queue.
    Active {
        queue: FrameConsumer,
        timeout: Duration,
        last: RawThermalFrame,
    },
    /// No hardware: every capture yields the same zero frame.
    Disabled { zero: RawThermalFrame },
}

impl ThermalAdapter {
    /// Construct an active adapter and self-check it by waiting for one frame.
    pub fn open(
        queue: FrameConsumer,
        shape: FrameShape,
        timeout: Duration,
    ) -> Result<Self, SensorError> {
        let mut adapter = Self::Active {
            queue,
            timeout,
            last: shape.zero_thermal(),
        };
        adapter.capture()?;
        tracing::info!(shape = %shape, timeout = ?timeout, "thermal sensor ready");
        Ok(adapter)
    }

    /// Construct the hardware-free stand-in.
    pub fn disabled(shape: FrameShape) -> Self {
        tracing::info!(shape = %shape, "thermal sensor disabled");
        Self::Disabled {
            zero: shape.zero_thermal(),
        }
    }
}

impl SensorAdapter for ThermalAdapter {
    type Frame = RawThermalFrame;

    fn capture(&mut self) -> Result<&RawThermalFrame, SensorError> {
        match self {
            Self::Active {
                queue,
                timeout,
                last,
            } => {
                *last = queue.dequeue(*timeout).map_err(|e| match e {
                    DequeueError::Timeout(t) => SensorError::SensorTimeout(t),
                    DequeueError::Disconnected => {
                        SensorError::CaptureFailed("thermal stream disconnected".into())
                    }
                })?;
                Ok(last)
            }
            Self::Disabled { zero } => Ok(zero),
        }
    }

    fn last_frame(&self) -> &RawThermalFrame {
        match self {
            Self::Active { last, .. } => last,
            Self::Disabled { zero } => zero,
        }
    }

    fn save(&self, path: &Path, captured_at: NaiveDateTime) -> Result<SaveOutcome, SensorError> {
        match self {
            Self::Active { last, .. } => {
                persist::save_thermal_png(path, last, captured_at)?;
                Ok(SaveOutcome::Written)
            }
            Self::Disabled { .. } => Ok(SaveOutcome::Skipped),
        }
    }

    fn is_enabled(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}
