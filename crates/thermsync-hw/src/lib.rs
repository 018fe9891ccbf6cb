//! thermsync-hw — Hardware abstraction for the thermal and color cameras.
//!
//! Wraps the callback-driven UVC thermal stream and the polled V4L2 color
//! camera behind one pull-style [`SensorAdapter`] contract, and persists
//! captured frames.

pub mod color;
pub mod devices;
pub mod frame;
pub mod persist;
pub mod queue;
pub mod sensor;
pub mod thermal;
pub mod uvc;

pub use color::{ColorAdapter, ColorDevice, V4l2ColorDevice};
pub use frame::{FrameShape, RawColorFrame, RawThermalFrame};
pub use queue::{frame_queue, FrameConsumer, FrameProducer};
pub use sensor::{SaveOutcome, SensorAdapter, SensorError};
pub use thermal::ThermalAdapter;
pub use uvc::{StreamDriver, ThermalStream, V4l2StreamDriver};
