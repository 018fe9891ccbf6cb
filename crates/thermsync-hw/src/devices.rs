//! Known thermal UVC boards.
//!
//! Maps USB VID:PID to the radiometric sensor geometry the board streams.
//! Board files are embedded at compile time from `contrib/hw/*.toml`.

use crate::frame::FrameShape;
use crate::sensor::SensorError;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;

/// PureThermal 2 carrying a FLIR Lepton 3.5.
const BOARD_1E4E_0100: &str = include_str!("../../../contrib/hw/1e4e-0100.toml");

/// USB IDs of the default thermal board (GroupGets PureThermal).
pub const PURETHERMAL_VID: u16 = 0x1e4e;
pub const PURETHERMAL_PID: u16 = 0x0100;

/// sysfs mount point used to map video nodes to USB devices.
const SYSFS_ROOT: &str = "/sys";
/// `videoN` indices scanned when looking for the thermal board.
const MAX_VIDEO_NODES: u32 = 16;

static BOARD_DB: OnceLock<Vec<BoardFile>> = OnceLock::new();

/// Top-level board file structure (one per `contrib/hw/*.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct BoardFile {
    pub device: BoardInfo,
    pub sensor: SensorInfo,
}

/// Identification fields from the `[device]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BoardInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: String,
}

/// Stream geometry from the `[sensor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorInfo {
    pub width: u32,
    pub height: u32,
    /// V4L2 fourcc of the radiometric stream, e.g. `"Y16 "`.
    pub fourcc: String,
}

impl BoardFile {
    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.sensor.width, self.sensor.height)
    }
}

fn board_db() -> &'static Vec<BoardFile> {
    BOARD_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [BOARD_1E4E_0100] {
            match toml::from_str::<BoardFile>(src) {
                Ok(b) => db.push(b),
                Err(e) => tracing::error!(error = %e, "bad board TOML"),
            }
        }
        db
    })
}

/// Look up a board by USB vendor:product ID.
pub fn lookup_board(vid: u16, pid: u16) -> Option<&'static BoardFile> {
    board_db()
        .iter()
        .find(|b| b.device.vendor_id == vid && b.device.product_id == pid)
}

/// List all known boards.
pub fn list_boards() -> &'static [BoardFile] {
    board_db()
}

/// Resolve a `videoN` node to its USB vendor:product IDs through sysfs.
///
/// The node's `device` link points at a USB interface directory; its parent
/// is the USB device directory carrying `idVendor` and `idProduct`.
pub fn usb_ids(sysfs: &Path, node: &str) -> Result<(u16, u16), SensorError> {
    let link = sysfs.join("class/video4linux").join(node).join("device");
    let interface = std::fs::canonicalize(&link)
        .map_err(|e| SensorError::HardwareInit(format!("{}: {e}", link.display())))?;
    let usb_device = interface.parent().ok_or_else(|| {
        SensorError::HardwareInit(format!("{}: not under a USB device", interface.display()))
    })?;
    Ok((
        read_usb_id(&usb_device.join("idVendor"))?,
        read_usb_id(&usb_device.join("idProduct"))?,
    ))
}

fn read_usb_id(path: &Path) -> Result<u16, SensorError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| SensorError::HardwareInit(format!("{}: {e}", path.display())))?;
    u16::from_str_radix(text.trim(), 16).map_err(|e| {
        SensorError::HardwareInit(format!("{}: bad USB id {:?}: {e}", path.display(), text.trim()))
    })
}

/// Find the first `/dev/videoN` node belonging to the given USB device.
pub fn find_video_node(vid: u16, pid: u16) -> Option<String> {
    find_node_in(Path::new(SYSFS_ROOT), vid, pid).map(|node| format!("/dev/{node}"))
}

fn find_node_in(sysfs: &Path, vid: u16, pid: u16) -> Option<String> {
    let class = sysfs.join("class/video4linux");
    (0..MAX_VIDEO_NODES)
        .map(|i| format!("video{i}"))
        .filter(|node| class.join(node).exists())
        .find(|node| match usb_ids(sysfs, node) {
            Ok(ids) => ids == (vid, pid),
            Err(e) => {
                tracing::debug!(node = %node, error = %e, "skipping video node");
                false
            }
        })
}
