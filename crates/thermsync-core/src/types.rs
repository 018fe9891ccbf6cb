use chrono::NaiveDateTime;
use serde::Serialize;
use thermsync_hw::{RawColorFrame, RawThermalFrame};

/// One synchronized thermal + color capture.
///
/// Both frames come from the same loop iteration and share one timestamp,
/// taken after both captures complete. The frames are borrowed from the
/// adapters' buffers and are only valid until the next capture.
#[derive(Clone, Copy)]
pub struct FramePair<'a> {
    pub thermal: &'a RawThermalFrame,
    pub color: &'a RawColorFrame,
    pub captured_at: NaiveDateTime,
    pub sequence_index: u64,
}

/// What is kept of a pair once the loop moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PairRecord {
    pub sequence_index: u64,
    pub captured_at: NaiveDateTime,
}

impl From<&FramePair<'_>> for PairRecord {
    fn from(pair: &FramePair<'_>) -> Self {
        Self {
            sequence_index: pair.sequence_index,
            captured_at: pair.captured_at,
        }
    }
}

/// Capture session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    /// Hardware streams are running; sensors not yet polled.
    Armed,
    Capturing,
    /// Loop finished; tearing down.
    Draining,
    Stopped,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub state: SessionState,
    pub pairs: Vec<PairRecord>,
    /// Number of composite previews shown.
    pub previews: u64,
    /// Iterations whose processing overran the frame budget.
    pub overruns: u64,
}
