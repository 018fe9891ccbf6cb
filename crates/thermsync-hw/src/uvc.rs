//! Push-style thermal stream: driver lifecycle and frame-arrival callback.
//!
//! A [`StreamDriver`] delivers frames on its own thread through a
//! [`FrameCallback`]. [`ThermalStream`] arms a driver, wires its callback to
//! the producer half of the frame queue, and tears the driver down on drop.

use crate::devices::{self, PURETHERMAL_PID, PURETHERMAL_VID};
use crate::frame::{self, FrameShape};
use crate::queue::{Enqueued, FrameProducer};
use crate::sensor::SensorError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// One delivered frame as seen by the callback. Borrowed from the driver's
/// buffer; valid only for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor<'a> {
    pub width: u32,
    pub height: u32,
    /// Byte length reported by the driver.
    pub data_bytes: usize,
    pub data: &'a [u8],
}

/// Frame-arrival callback, invoked on the driver thread.
pub type FrameCallback = Box<dyn FnMut(&FrameDescriptor<'_>) + Send + 'static>;

/// Lifecycle of a callback-driven UVC stream.
///
/// Calls arrive in order: `init`, `find_device`, `open`, `start_streaming`,
/// then `stop_streaming`, `close`, `exit`. The teardown calls must be safe to
/// invoke after a partial bring-up.
pub trait StreamDriver: Send {
    fn init(&mut self) -> Result<(), SensorError>;
    fn find_device(&mut self) -> Result<(), SensorError>;
    fn open(&mut self) -> Result<(), SensorError>;
    /// Geometry the opened device streams.
    fn frame_shape(&self) -> FrameShape;
    fn start_streaming(&mut self, callback: FrameCallback) -> Result<(), SensorError>;
    fn stop_streaming(&mut self);
    fn close(&mut self);
    fn exit(&mut self);
}

/// Build the producer-side callback: validate, decode Y16, try-enqueue.
///
/// Deliveries whose byte length or geometry disagree with `expected` are
/// discarded; a full queue drops the frame. Neither blocks nor does I/O.
pub fn enqueue_callback(producer: FrameProducer, expected: FrameShape) -> FrameCallback {
    Box::new(move |desc: &FrameDescriptor<'_>| {
        let declared = 2 * desc.width as usize * desc.height as usize;
        if desc.data_bytes != declared || desc.data.len() < declared {
            tracing::debug!(
                data_bytes = desc.data_bytes,
                declared,
                "discarding malformed thermal frame"
            );
            return;
        }
        if FrameShape::new(desc.width, desc.height) != expected {
            tracing::debug!(
                width = desc.width,
                height = desc.height,
                expected = %expected,
                "discarding thermal frame with unexpected geometry"
            );
            return;
        }
        let frame = match frame::decode_y16(&desc.data[..declared], expected) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(error = %e, "discarding undecodable thermal frame");
                return;
            }
        };
        if producer.enqueue(frame) == Enqueued::Dropped {
            tracing::trace!("thermal queue full; frame dropped");
        }
    })
}

/// An armed stream driver. Dropping it stops streaming, closes the device
/// and exits the driver context, whatever the reason for the drop.
pub struct ThermalStream {
    driver: Box<dyn StreamDriver>,
    shape: FrameShape,
    streaming: bool,
}

impl ThermalStream {
    /// Bring the driver up and start delivering frames into `producer`.
    ///
    /// On failure the partially initialized driver is torn down before the
    /// error is returned.
    pub fn start(
        driver: Box<dyn StreamDriver>,
        producer: FrameProducer,
        expected: FrameShape,
    ) -> Result<Self, SensorError> {
        let mut stream = Self {
            driver,
            shape: expected,
            streaming: false,
        };
        stream.driver.init()?;
        stream.driver.find_device()?;
        stream.driver.open()?;

        let offered = stream.driver.frame_shape();
        if offered != expected {
            return Err(SensorError::HardwareInit(format!(
                "thermal device streams {offered}, expected {expected}"
            )));
        }

        stream
            .driver
            .start_streaming(enqueue_callback(producer, expected))?;
        stream.streaming = true;
        tracing::info!(shape = %expected, "thermal stream started");
        Ok(stream)
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }
}

impl Drop for ThermalStream {
    fn drop(&mut self) {
        if self.streaming {
            self.driver.stop_streaming();
            self.streaming = false;
        }
        self.driver.close();
        self.driver.exit();
        tracing::info!("thermal stream torn down");
    }
}

/// Longest a blocked dequeue waits before the capture thread re-checks its
/// stop flag.
pub const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A started capture stream as seen by the capture thread.
trait BufferSource {
    /// Next filled buffer and its used byte count. Fails with
    /// `ErrorKind::TimedOut` when nothing arrives within the poll interval.
    fn next_buffer(&mut self) -> io::Result<(&[u8], usize)>;
}

impl BufferSource for MmapStream<'static> {
    fn next_buffer(&mut self) -> io::Result<(&[u8], usize)> {
        let (buf, meta) = CaptureStream::next(self)?;
        Ok((buf, meta.bytesused as usize))
    }
}

/// Capture-thread body: feed buffers to `callback` until `stop` is set or
/// the device fails.
///
/// After a timed-out dequeue v4l would queue its last buffer a second time,
/// so the stream is rebuilt through `open` instead of reused.
fn pump_frames<S, F>(
    mut open: F,
    stop: &AtomicBool,
    shape: FrameShape,
    callback: &mut dyn FnMut(&FrameDescriptor<'_>),
) where
    S: BufferSource,
    F: FnMut() -> io::Result<S>,
{
    while !stop.load(Ordering::SeqCst) {
        let mut source = match open() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to create thermal capture stream");
                return;
            }
        };
        while !stop.load(Ordering::SeqCst) {
            match source.next_buffer() {
                Ok((data, data_bytes)) => callback(&FrameDescriptor {
                    width: shape.width,
                    height: shape.height,
                    data_bytes,
                    data,
                }),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    tracing::debug!("no thermal frame within poll interval");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "thermal dequeue failed; stopping stream");
                    return;
                }
            }
        }
    }
}

/// V4L2-backed UVC driver for radiometric boards (PureThermal et al.).
///
/// Locates the board by USB VID:PID through sysfs, negotiates Y16 and runs
/// the dequeue loop on a dedicated thread.
pub struct V4l2StreamDriver {
    vendor_id: u16,
    product_id: u16,
    device_path: Option<String>,
    device: Option<Device>,
    shape: FrameShape,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2StreamDriver {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        let shape = devices::lookup_board(vendor_id, product_id)
            .map(|b| b.shape())
            .unwrap_or_else(FrameShape::thermal);
        Self {
            vendor_id,
            product_id,
            device_path: None,
            device: None,
            shape,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Driver for an explicit device node, skipping VID:PID discovery.
    pub fn with_path(device_path: &str) -> Self {
        let mut driver = Self::new(PURETHERMAL_VID, PURETHERMAL_PID);
        driver.device_path = Some(device_path.to_string());
        driver
    }
}

impl Default for V4l2StreamDriver {
    fn default() -> Self {
        Self::new(PURETHERMAL_VID, PURETHERMAL_PID)
    }
}

impl StreamDriver for V4l2StreamDriver {
    fn init(&mut self) -> Result<(), SensorError> {
        self.stop.store(false, Ordering::SeqCst);
        tracing::debug!(
            vid = format_args!("{:04x}", self.vendor_id),
            pid = format_args!("{:04x}", self.product_id),
            "thermal driver init"
        );
        Ok(())
    }

    fn find_device(&mut self) -> Result<(), SensorError> {
        if self.device_path.is_some() {
            return Ok(());
        }
        let path = devices::find_video_node(self.vendor_id, self.product_id).ok_or_else(|| {
            SensorError::HardwareInit(format!(
                "no video node for USB device {:04x}:{:04x}",
                self.vendor_id, self.product_id
            ))
        })?;
        if let Some(board) = devices::lookup_board(self.vendor_id, self.product_id) {
            tracing::info!(device = %path, name = %board.device.name, "thermal board found");
        }
        self.device_path = Some(path);
        Ok(())
    }

    fn open(&mut self) -> Result<(), SensorError> {
        let path = self
            .device_path
            .clone()
            .ok_or_else(|| SensorError::HardwareInit("open before find_device".into()))?;

        let device = Device::with_path(&path)
            .map_err(|e| SensorError::HardwareInit(format!("{path}: {e}")))?;

        let mut fmt = device
            .format()
            .map_err(|e| SensorError::HardwareInit(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"Y16 ");
        fmt.width = self.shape.width;
        fmt.height = self.shape.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| SensorError::HardwareInit(format!("failed to set format: {e}")))?;
        if negotiated.fourcc != FourCC::new(b"Y16 ") {
            return Err(SensorError::HardwareInit(format!(
                "device does not support Y16 (negotiated {:?})",
                negotiated.fourcc
            )));
        }
        self.shape = FrameShape::new(negotiated.width, negotiated.height);

        tracing::info!(
            device = %path,
            width = negotiated.width,
            height = negotiated.height,
            "thermal device opened"
        );
        self.device = Some(device);
        Ok(())
    }

    fn frame_shape(&self) -> FrameShape {
        self.shape
    }

    fn start_streaming(&mut self, mut callback: FrameCallback) -> Result<(), SensorError> {
        let device = self
            .device
            .take()
            .ok_or_else(|| SensorError::HardwareInit("start_streaming before open".into()))?;
        let stop = Arc::clone(&self.stop);
        let shape = self.shape;

        let worker = std::thread::Builder::new()
            .name("thermsync-uvc".into())
            .spawn(move || {
                let open = || -> io::Result<MmapStream<'static>> {
                    let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4)?;
                    stream.set_timeout(STREAM_POLL_INTERVAL);
                    Ok(stream)
                };
                pump_frames(open, &stop, shape, &mut callback);
                tracing::debug!("thermal stream thread exiting");
            })
            .map_err(|e| SensorError::HardwareInit(format!("failed to spawn stream thread: {e}")))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("thermal stream thread panicked");
            }
        }
    }

    fn close(&mut self) {
        self.device = None;
    }

    fn exit(&mut self) {
        self.device_path = None;
    }
}
