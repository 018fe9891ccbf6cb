//! Visible-light sensor adapter: polling capture over V4L2.

use crate::frame::{self, FrameShape, RawColorFrame};
use crate::persist;
use crate::sensor::{SaveOutcome, SensorAdapter, SensorError};
use chrono::NaiveDateTime;
use std::io;
use std::path::Path;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Number of device indices probed when looking for the color camera.
pub const COLOR_PROBE_ATTEMPTS: u32 = 3;

/// Longest wait for a single color frame before the read fails.
pub const COLOR_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// A polled color camera. Dropping it releases the device.
pub trait ColorDevice {
    /// Read exactly one frame.
    fn read(&mut self) -> Result<RawColorFrame, SensorError>;
}

/// Negotiated pixel format for the color camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    /// Motion-JPEG, decoded per frame.
    Mjpeg,
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
}

/// Source of filled capture buffers, oldest first.
trait BufferQueue {
    /// Block until a buffer is filled and return its used bytes.
    fn next_buffer(&mut self) -> io::Result<&[u8]>;
    /// Whether another filled buffer can be dequeued without blocking.
    fn has_ready(&self) -> io::Result<bool>;
}

impl BufferQueue for MmapStream<'static> {
    fn next_buffer(&mut self) -> io::Result<&[u8]> {
        let (buf, meta) = CaptureStream::next(self)?;
        let used = (meta.bytesused as usize).min(buf.len());
        Ok(&buf[..used])
    }

    fn has_ready(&self) -> io::Result<bool> {
        Ok(self.handle().poll(libc::POLLIN, 0)? > 0)
    }
}

/// Dequeue one buffer, then keep dequeuing while more are already waiting,
/// so the copy returned is the newest frame the driver holds.
fn latest_buffer<Q: BufferQueue>(queue: &mut Q) -> io::Result<Vec<u8>> {
    let mut latest = queue.next_buffer()?.to_vec();
    while queue.has_ready()? {
        let buf = queue.next_buffer()?;
        latest.clear();
        latest.extend_from_slice(buf);
    }
    Ok(latest)
}

/// V4L2 color camera handle. The capture stream is started once at open
/// and stays running until the handle is dropped.
pub struct V4l2ColorDevice {
    stream: MmapStream<'static>,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    format: ColorFormat,
}

impl V4l2ColorDevice {
    /// Open `/dev/video{index}` and request the expected resolution.
    pub fn open(index: u32, expected: FrameShape) -> Result<Self, SensorError> {
        let device_path = format!("/dev/video{index}");
        if !Path::new(&device_path).exists() {
            return Err(SensorError::HardwareInit(format!("{device_path}: no such device")));
        }

        let device = Device::with_path(&device_path)
            .map_err(|e| SensorError::HardwareInit(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| SensorError::HardwareInit(format!("failed to query capabilities: {e}")))?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(SensorError::HardwareInit(format!(
                "{device_path}: not a capture device"
            )));
        }

        // Ask for MJPG; YUYV is accepted if the driver falls back to it.
        let mut fmt = device
            .format()
            .map_err(|e| SensorError::HardwareInit(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"MJPG");
        fmt.width = expected.width;
        fmt.height = expected.height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| SensorError::HardwareInit(format!("failed to set format: {e}")))?;

        let format = if negotiated.fourcc == FourCC::new(b"MJPG") {
            ColorFormat::Mjpeg
        } else if negotiated.fourcc == FourCC::new(b"YUYV") {
            ColorFormat::Yuyv
        } else {
            return Err(SensorError::HardwareInit(format!(
                "unsupported pixel format: {:?} (need MJPG or YUYV)",
                negotiated.fourcc
            )));
        };

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4)
            .map_err(|e| SensorError::HardwareInit(format!("{device_path}: mmap stream: {e}")))?;
        stream.set_timeout(COLOR_READ_TIMEOUT);

        tracing::debug!(
            device = %device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?format,
            "opened color camera"
        );

        Ok(Self {
            stream,
            device_path,
            width: negotiated.width,
            height: negotiated.height,
            format,
        })
    }
}

impl ColorDevice for V4l2ColorDevice {
    fn read(&mut self) -> Result<RawColorFrame, SensorError> {
        let buf = latest_buffer(&mut self.stream).map_err(|e| {
            SensorError::CaptureFailed(format!("{}: failed to dequeue buffer: {e}", self.device_path))
        })?;

        let decoded = match self.format {
            ColorFormat::Mjpeg => frame::mjpeg_to_rgb(&buf),
            ColorFormat::Yuyv => frame::yuyv_to_rgb(&buf, self.width, self.height),
        };
        decoded.map_err(|e| SensorError::CaptureFailed(format!("{}: {e}", self.device_path)))
    }
}

/// Visible-light camera adapter.
pub enum ColorAdapter {
    /// Backed by an accepted device; `frame` is the single reusable buffer.
    Active {
        device: Box<dyn ColorDevice>,
        index: u32,
        frame: RawColorFrame,
    },
    /// No hardware: every capture yields the same black frame.
    Disabled { zero: RawColorFrame },
}

impl ColorAdapter {
    /// Probe V4L2 device indices `0..attempts` for the expected resolution.
    pub fn open(expected: FrameShape, attempts: u32) -> Result<Self, SensorError> {
        Self::probe(
            |index| {
                V4l2ColorDevice::open(index, expected)
                    .map(|d| Box::new(d) as Box<dyn ColorDevice>)
            },
            expected,
            attempts,
        )
    }

    /// Probe `attempts` device indices in turn, reading one trial frame from
    /// each. The first device whose frame matches `expected` exactly is
    /// accepted; every other opened device is released.
    pub fn probe<F>(mut opener: F, expected: FrameShape, attempts: u32) -> Result<Self, SensorError>
    where
        F: FnMut(u32) -> Result<Box<dyn ColorDevice>, SensorError>,
    {
        for index in 0..attempts {
            let mut device = match opener(index) {
                Ok(d) => d,
                Err(e) => {
                    tracing::debug!(index, error = %e, "color probe: open failed");
                    continue;
                }
            };
            match device.read() {
                Ok(frame) if expected.matches_color(&frame) => {
                    tracing::info!(index, shape = %expected, "color camera accepted");
                    return Ok(Self::Active {
                        device,
                        index,
                        frame,
                    });
                }
                Ok(frame) => {
                    let (w, h) = frame.dimensions();
                    tracing::debug!(index, width = w, height = h, "color probe: shape mismatch");
                }
                Err(e) => {
                    tracing::debug!(index, error = %e, "color probe: trial read failed");
                }
            }
            drop(device);
        }
        Err(SensorError::DeviceNotFound { probed: attempts })
    }

    /// Construct the hardware-free stand-in.
    pub fn disabled(shape: FrameShape) -> Self {
        tracing::info!(shape = %shape, "color sensor disabled");
        Self::Disabled {
            zero: shape.zero_color(),
        }
    }

    /// Device index the adapter accepted, if active.
    pub fn device_index(&self) -> Option<u32> {
        match self {
            Self::Active { index, .. } => Some(*index),
            Self::Disabled { .. } => None,
        }
    }
}

impl SensorAdapter for ColorAdapter {
    type Frame = RawColorFrame;

    fn capture(&mut self) -> Result<&RawColorFrame, SensorError> {
        match self {
            Self::Active { device, frame, .. } => {
                *frame = device.read()?;
                Ok(frame)
            }
            Self::Disabled { zero } => Ok(zero),
        }
    }

    fn last_frame(&self) -> &RawColorFrame {
        match self {
            Self::Active { frame, .. } => frame,
            Self::Disabled { zero } => zero,
        }
    }

    /// The color format carries no capture time; `captured_at` is accepted
    /// for symmetry with the thermal adapter.
    fn save(&self, path: &Path, _captured_at: NaiveDateTime) -> Result<SaveOutcome, SensorError> {
        match self {
            Self::Active { frame, .. } => {
                persist::save_color_image(path, frame)?;
                Ok(SaveOutcome::Written)
            }
            Self::Disabled { .. } => Ok(SaveOutcome::Skipped),
        }
    }

    fn is_enabled(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::{Arc, Mutex};

    /// Simulated camera that always returns frames of a fixed shape and logs
    /// when it is released.
    struct FakeCamera {
        index: u32,
        shape: FrameShape,
        reads: u8,
        released: Arc<Mutex<Vec<u32>>>,
    }

    impl ColorDevice for FakeCamera {
        fn read(&mut self) -> Result<RawColorFrame, SensorError> {
            self.reads = self.reads.wrapping_add(1);
            Ok(RgbImage::from_pixel(
                self.shape.width,
                self.shape.height,
                Rgb([self.reads, 0, 0]),
            ))
        }
    }

    impl Drop for FakeCamera {
        fn drop(&mut self) {
            self.released.lock().unwrap().push(self.index);
        }
    }

    fn fake_rig(
        shapes: Vec<FrameShape>,
    ) -> (
        impl FnMut(u32) -> Result<Box<dyn ColorDevice>, SensorError>,
        Arc<Mutex<Vec<u32>>>,
        Arc<Mutex<Vec<u32>>>,
    ) {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(Mutex::new(Vec::new()));
        let (o, r) = (Arc::clone(&opened), Arc::clone(&released));
        let opener = move |index: u32| {
            o.lock().unwrap().push(index);
            Ok(Box::new(FakeCamera {
                index,
                shape: shapes[index as usize],
                reads: 0,
                released: Arc::clone(&r),
            }) as Box<dyn ColorDevice>)
        };
        (opener, opened, released)
    }

    #[test]
    fn test_probe_selects_second_device() {
        let expected = FrameShape::new(16, 9);
        let (opener, opened, released) = fake_rig(vec![
            FrameShape::new(8, 6),
            expected,
            FrameShape::new(32, 18),
        ]);

        let adapter = ColorAdapter::probe(opener, expected, COLOR_PROBE_ATTEMPTS).unwrap();
        assert_eq!(adapter.device_index(), Some(1));
        assert!(expected.matches_color(adapter.last_frame()));
        // The mismatching first device was released; probing stopped at the match.
        assert_eq!(*opened.lock().unwrap(), vec![0, 1]);
        assert_eq!(*released.lock().unwrap(), vec![0]);

        drop(adapter);
        assert_eq!(*released.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_probe_not_found_releases_everything() {
        let expected = FrameShape::new(16, 9);
        let (opener, opened, released) = fake_rig(vec![FrameShape::new(8, 6); 3]);
        let err = ColorAdapter::probe(opener, expected, COLOR_PROBE_ATTEMPTS)
            .err()
            .unwrap();
        assert!(matches!(err, SensorError::DeviceNotFound { probed: 3 }));
        assert_eq!(*opened.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*released.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_probe_skips_unopenable_index() {
        let expected = FrameShape::new(4, 4);
        let released = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&released);
        let opener = move |index: u32| {
            if index == 0 {
                return Err(SensorError::HardwareInit("busy".into()));
            }
            Ok(Box::new(FakeCamera {
                index,
                shape: expected,
                reads: 0,
                released: Arc::clone(&r),
            }) as Box<dyn ColorDevice>)
        };
        let adapter = ColorAdapter::probe(opener, expected, 3).unwrap();
        assert_eq!(adapter.device_index(), Some(1));
    }

    #[test]
    fn test_capture_overwrites_buffer() {
        let expected = FrameShape::new(4, 4);
        let (opener, _, _) = fake_rig(vec![expected]);
        let mut adapter = ColorAdapter::probe(opener, expected, 1).unwrap();
        assert_eq!(adapter.last_frame().get_pixel(0, 0).0[0], 1);
        assert_eq!(adapter.capture().unwrap().get_pixel(0, 0).0[0], 2);
        assert_eq!(adapter.last_frame().get_pixel(0, 0).0[0], 2);
    }

    /// Driver queue holding `filled` frames; `current` is the dequeued one.
    struct FilledQueue {
        filled: std::collections::VecDeque<Vec<u8>>,
        current: Vec<u8>,
        dequeues: usize,
    }

    impl FilledQueue {
        fn new(frames: &[&[u8]]) -> Self {
            Self {
                filled: frames.iter().map(|f| f.to_vec()).collect(),
                current: Vec::new(),
                dequeues: 0,
            }
        }
    }

    impl BufferQueue for FilledQueue {
        fn next_buffer(&mut self) -> io::Result<&[u8]> {
            self.current = self
                .filled
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::TimedOut))?;
            self.dequeues += 1;
            Ok(&self.current)
        }

        fn has_ready(&self) -> io::Result<bool> {
            Ok(!self.filled.is_empty())
        }
    }

    #[test]
    fn test_read_skips_stale_buffers() {
        let mut queue = FilledQueue::new(&[b"old", b"older", b"newest"]);
        assert_eq!(latest_buffer(&mut queue).unwrap(), b"newest");
        assert_eq!(queue.dequeues, 3);

        // The same queue keeps serving later frames.
        queue.filled.push_back(b"next".to_vec());
        assert_eq!(latest_buffer(&mut queue).unwrap(), b"next");
        assert_eq!(queue.dequeues, 4);
    }

    #[test]
    fn test_read_times_out_without_frames() {
        let mut queue = FilledQueue::new(&[]);
        let err = latest_buffer(&mut queue).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_disabled_adapter() {
        let shape = FrameShape::color();
        let mut adapter = ColorAdapter::disabled(shape);
        assert!(shape.matches_color(adapter.capture().unwrap()));
        assert!(!adapter.is_enabled());

        let path = Path::new("/nonexistent-thermsync-dir/rgb0.jpg");
        let when = chrono::NaiveDateTime::default();
        assert_eq!(adapter.save(path, when).unwrap(), SaveOutcome::Skipped);
        assert!(!path.exists());
    }
}
