//! thermsync-core — Synchronized thermal + color capture.
//!
//! Pairs thermal and color frames under one timestamp, converts radiometric
//! counts to temperature and to a displayable image, maps color pixels into
//! thermal space, and renders the side-by-side preview.

pub mod alignment;
pub mod composite;
pub mod radiometry;
pub mod session;
pub mod types;

pub use alignment::{AlignmentError, AlignmentTransform, ThermalRect};
pub use composite::{Compositor, CompositorConfig};
pub use radiometry::{TemperatureStats, TemperatureUnit};
pub use session::{
    CaptureSession, ColorSource, LoopConfig, NullPreview, PreviewSink, SensorSources,
    SessionError, Stage, ThermalSource,
};
pub use types::{FramePair, PairRecord, SessionReport, SessionState};
