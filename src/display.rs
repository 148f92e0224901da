//! Display hardware contract: screens, modes, frames, and atomic updates.
//!
//! The playback core never talks to KMS directly. It drives anything that
//! implements [`DisplayDriver`]: the in-tree [`VirtualDriver`] for
//! hardware-free deployments and tests, or an out-of-tree backend wrapping a
//! real direct-rendering device.
//!
//! [`VirtualDriver`]: crate::virtual_driver::VirtualDriver
//!
//! # Frames
//!
//! A [`Frame`] is a reference-counted handle to an image that has already
//! been decoded and imported into the driver's memory domain. The core only
//! ever clones and drops handles; pixel data stays on the driver side.
//! Dropping the last clone releases the backing buffers for reuse.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// A display mode advertised by a connector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    /// Nominal vertical refresh rate.
    pub hz: u32,
}

impl DisplayMode {
    /// Refresh interval implied by the nominal rate.
    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.hz.max(1)))
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.hz)
    }
}

/// One physical output scanned from the display controller.
#[derive(Clone, Debug)]
pub struct Screen {
    /// Connector id passed back to `update` / `update_done_yet`.
    pub id: u32,
    /// Connector name as scripts address it, e.g. `"HDMI-1"`.
    pub connector: String,
    /// Whether a display is physically attached.
    pub detected: bool,
    pub active_mode: Option<DisplayMode>,
    pub modes: Vec<DisplayMode>,
}

#[derive(Debug)]
struct FrameImage {
    width: u32,
    height: u32,
    /// Media path the image was decoded from, for logs and inspection.
    source: String,
    /// Seconds into the source.
    source_time: f64,
}

/// Reference-counted handle to an imported image (see module docs).
#[derive(Clone, Debug)]
pub struct Frame {
    image: Arc<FrameImage>,
}

impl Frame {
    pub fn new(width: u32, height: u32, source: impl Into<String>, source_time: f64) -> Frame {
        Frame {
            image: Arc::new(FrameImage {
                width,
                height,
                source: source.into(),
                source_time,
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn source(&self) -> &str {
        &self.image.source
    }

    pub fn source_time(&self) -> f64 {
        self.image.source_time
    }

    /// True when both handles point at the same imported image.
    pub fn same_image(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{:.3}s ({}x{})",
            self.image.source, self.image.source_time, self.image.width, self.image.height
        )
    }
}

/// Axis-aligned rectangle in pixels. Fractional coordinates are allowed;
/// drivers snap to whatever the hardware planes support.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Rect {
        Rect { x, y, width, height }
    }
}

/// Placement of one frame on one hardware plane.
#[derive(Clone, Debug)]
pub struct DisplayLayer {
    pub frame: Frame,
    /// Source rectangle within the frame.
    pub from: Rect,
    /// Destination rectangle on the screen.
    pub to: Rect,
    /// 0.0 transparent .. 1.0 opaque.
    pub opacity: f64,
}

/// Everything the driver needs for a single atomic page flip on one
/// connector: the full plane assignment for one instant. Atoms are
/// self-contained and never reference earlier atoms.
#[derive(Clone, Debug, Default)]
pub struct DisplayAtom {
    pub layers: Vec<DisplayLayer>,
}

/// Driver failures. All of these are fatal to the owning frame player.
#[derive(Debug)]
pub enum DriverError {
    UnknownConnector(u32),
    UnsupportedMode { connector: String, mode: DisplayMode },
    Device(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::UnknownConnector(id) => write!(f, "Unknown connector id {}", id),
            DriverError::UnsupportedMode { connector, mode } => {
                write!(f, "Mode {} not supported on {}", mode, connector)
            }
            DriverError::Device(e) => write!(f, "Display device error: {}", e),
        }
    }
}

impl std::error::Error for DriverError {}

/// Contract between the playback core and whatever owns the display
/// hardware. Implementations must tolerate concurrent calls on distinct
/// connectors; the core serializes calls per connector itself.
pub trait DisplayDriver: Send + Sync {
    /// Enumerate connectors and their mode lists.
    fn scan_screens(&self) -> Result<Vec<Screen>, DriverError>;

    /// Submit an atomic page flip. May block briefly on the kernel queue but
    /// must not wait for the flip to complete.
    fn update(
        &self,
        connector_id: u32,
        mode: &DisplayMode,
        atom: &DisplayAtom,
    ) -> Result<(), DriverError>;

    /// `true` iff no page flip is pending on the connector. Never blocks.
    fn update_done_yet(&self, connector_id: u32) -> Result<bool, DriverError>;
}
