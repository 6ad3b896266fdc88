//! The seam between the nested client and the host display server
//!
//! Every round trip the session, framebuffer, presenter, bridge and keyboard
//! mapper make goes through [`HostConnection`]. [`crate::x11::X11Host`] backs
//! it with an x11rb connection; [`crate::mock::MockHost`] backs it with an
//! in-memory host for tests.

use std::os::unix::io::RawFd;
use std::time::Duration;

use x11rb::protocol::xproto::{ConfigureWindowAux, EventMask};

use crate::error::Result;
use crate::framebuffer::ImageLayout;
use crate::keyboard::{CoreKeyboardControl, XkbControls, XkbGeometry};

/// Host resource id (window, gc, pixmap, cursor, shm segment)
pub type Xid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    SharedMemory,
    Keyboard,
}

impl Extension {
    pub fn name(self) -> &'static str {
        match self {
            Extension::SharedMemory => x11rb::protocol::shm::X11_EXTENSION_NAME,
            Extension::Keyboard => x11rb::protocol::xkb::X11_EXTENSION_NAME,
        }
    }
}

/// Channel masks of a TrueColor visual. Guest pixels are written in this
/// layout with no conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisualMasks {
    pub red: u32,
    pub green: u32,
    pub blue: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixmapFormat {
    pub depth: u8,
    pub bits_per_pixel: u8,
    pub scanline_pad: u8,
}

/// What the host told us at connection time about its default screen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSetup {
    pub screen_number: usize,
    pub root: Xid,
    pub visual: VisualMasks,
    pub min_keycode: u8,
    pub max_keycode: u8,
    pub pixmap_formats: Vec<PixmapFormat>,
}

impl HostSetup {
    pub fn pixmap_format(&self, depth: u8) -> Option<PixmapFormat> {
        self.pixmap_formats
            .iter()
            .copied()
            .find(|format| format.depth == depth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmVersion {
    pub major: u16,
    pub minor: u16,
    pub shared_pixmaps: bool,
}

/// Fixed-size WM_NORMAL_HINTS for the nested window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeHints {
    pub position: (i32, i32),
    pub size: (u32, u32),
    pub min_size: (u32, u32),
    pub max_size: (u32, u32),
}

impl SizeHints {
    pub fn fixed(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            position: (x, y),
            size: (width, height),
            min_size: (width, height),
            max_size: (width, height),
        }
    }
}

/// Rectangle in framebuffer pixel space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A host event, decoded once from the wire representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Expose {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
    Motion {
        x: i16,
        y: i16,
    },
    Key {
        keycode: u8,
        pressed: bool,
    },
    Button {
        button: u8,
        pressed: bool,
    },
    Crossing {
        entered: bool,
    },
    Other,
}

pub struct KeyboardMappingReply {
    pub keysyms_per_keycode: u8,
    pub keysyms: Vec<u32>,
}

/// Requests the nested client makes of the host display server.
///
/// Requests without a reply are queued; [`HostConnection::sync`] forces a
/// round trip so everything before it has been processed by the host.
pub trait HostConnection {
    fn setup(&self) -> &HostSetup;

    /// Largest request the host accepts, in bytes.
    fn maximum_request_bytes(&self) -> usize;

    /// Readiness descriptor for the caller's poll loop.
    fn descriptor(&self) -> RawFd;

    fn has_extension(&self, extension: Extension) -> Result<bool>;

    /// Enables XKB for this connection; `false` if the host refuses the version.
    fn use_keyboard_extension(&self) -> Result<bool>;

    fn shm_query_version(&self) -> Result<ShmVersion>;

    fn generate_id(&self) -> Result<Xid>;

    fn create_gc(&self, gc: Xid, drawable: Xid) -> Result<()>;
    fn free_gc(&self, gc: Xid) -> Result<()>;

    fn create_window(&self, window: Xid, parent: Xid, event_mask: EventMask) -> Result<()>;
    fn destroy_window(&self, window: Xid) -> Result<()>;
    fn set_size_hints(&self, window: Xid, hints: &SizeHints) -> Result<()>;
    fn set_title(&self, window: Xid, title: &str) -> Result<()>;
    fn configure_window(&self, window: Xid, values: &ConfigureWindowAux) -> Result<()>;
    fn map_window(&self, window: Xid) -> Result<()>;

    fn create_pixmap(&self, depth: u8, pixmap: Xid, drawable: Xid, width: u16, height: u16)
        -> Result<()>;
    fn free_pixmap(&self, pixmap: Xid) -> Result<()>;
    /// Creates a cursor whose source and mask are both `pixmap`.
    fn create_cursor(&self, cursor: Xid, pixmap: Xid) -> Result<()>;
    fn free_cursor(&self, cursor: Xid) -> Result<()>;
    fn set_window_cursor(&self, window: Xid, cursor: Xid) -> Result<()>;

    /// Registers a shared memory segment with the host. Checked: an error
    /// means the host cannot read the segment.
    fn shm_attach(&self, seg: Xid, shmid: u32) -> Result<()>;
    fn shm_detach(&self, seg: Xid) -> Result<()>;
    /// Copies `rect` of the image living in segment `seg` to the same spot
    /// in `window`.
    fn shm_put_image(
        &self,
        window: Xid,
        gc: Xid,
        layout: &ImageLayout,
        rect: Rect,
        seg: Xid,
    ) -> Result<()>;
    /// Sends Z-pixmap `data` (rows padded per the depth's pixmap format).
    #[allow(clippy::too_many_arguments)]
    fn put_image(
        &self,
        window: Xid,
        gc: Xid,
        width: u16,
        height: u16,
        dst_x: i16,
        dst_y: i16,
        depth: u8,
        data: &[u8],
    ) -> Result<()>;

    fn flush(&self) -> Result<()>;
    fn sync(&self) -> Result<()>;

    /// Next queued event, without blocking.
    fn poll_for_event(&self) -> Result<Option<HostEvent>>;
    /// Blocks for the next event; `None` once `timeout` passes.
    fn wait_for_event(&self, timeout: Option<Duration>) -> Result<Option<HostEvent>>;

    fn keyboard_mapping(&self, first_keycode: u8, count: u8) -> Result<KeyboardMappingReply>;
    /// Keycodes per modifier, eight modifiers in order Shift..Mod5.
    fn modifier_mapping(&self) -> Result<Vec<u8>>;
    fn keyboard_control(&self) -> Result<CoreKeyboardControl>;
    /// `None` when the host has no usable core keyboard.
    fn xkb_controls(&self) -> Result<Option<XkbControls>>;
    /// `None` when the host reports no geometry for the core keyboard.
    fn xkb_geometry(&self) -> Result<Option<XkbGeometry>>;
}
