//! In-memory host display for tests and headless callers
//!
//! [`MockDisplay`] plays the host X server: it hands out ids, records every
//! request, keeps a [`Ledger`] of created and freed resources, queues
//! events, and keeps the pixels of the nested window so redraws can be
//! compared. [`MockDisplay::connect`] returns a [`MockHost`], the
//! [`HostConnection`] a [`crate::Session`] runs on.
//!
//! ```ignore
//! let display = MockDisplay::builder().without_shm().build();
//! let session = Session::establish(display.connect(), &display.allocator(), &config)?;
//! assert!(!session.using_shm());
//! session.close();
//! assert!(display.ledger().is_balanced());
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::slice;
use std::time::Duration;

use x11rb::protocol::xproto::{ConfigureWindowAux, EventMask};

use crate::bridge::InputSink;
use crate::error::{Error, Result};
use crate::framebuffer::ImageLayout;
use crate::host::{
    Extension, HostConnection, HostEvent, HostSetup, KeyboardMappingReply, PixmapFormat, Rect,
    ShmVersion, SizeHints, VisualMasks, Xid,
};
use crate::keyboard::{CoreKeyboardControl, XkbControls, XkbGeometry};
use crate::shm::{ShmAllocator, ShmSegment};

/// The mock has no socket to poll
pub const MOCK_DESCRIPTOR: RawFd = -1;

const FIRST_ID: Xid = 0x0040_0001;

/// Create/free bookkeeping for one kind of host resource
#[derive(Debug, Default)]
pub struct Counter {
    live: RefCell<HashSet<u32>>,
    created: Cell<usize>,
    freed: Cell<usize>,
    invalid_frees: Cell<usize>,
}

impl Counter {
    fn create(&self, id: u32) {
        self.live.borrow_mut().insert(id);
        self.created.set(self.created.get() + 1);
    }

    fn free(&self, id: u32) {
        if self.live.borrow_mut().remove(&id) {
            self.freed.set(self.freed.get() + 1);
        } else {
            self.invalid_frees.set(self.invalid_frees.get() + 1);
        }
    }

    fn is_live(&self, id: u32) -> bool {
        self.live.borrow().contains(&id)
    }

    pub fn created(&self) -> usize {
        self.created.get()
    }

    pub fn freed(&self) -> usize {
        self.freed.get()
    }

    pub fn open(&self) -> usize {
        self.live.borrow().len()
    }

    /// Frees of ids that were never created or already freed
    pub fn invalid_frees(&self) -> usize {
        self.invalid_frees.get()
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    pub connections: Counter,
    pub gcs: Counter,
    pub windows: Counter,
    pub pixmaps: Counter,
    pub cursors: Counter,
    pub shm_attachments: Counter,
    pub segments: Counter,
}

impl Ledger {
    fn counters(&self) -> [&Counter; 7] {
        [
            &self.connections,
            &self.gcs,
            &self.windows,
            &self.pixmaps,
            &self.cursors,
            &self.shm_attachments,
            &self.segments,
        ]
    }

    /// Everything created was freed exactly once.
    pub fn is_balanced(&self) -> bool {
        self.counters()
            .iter()
            .all(|counter| counter.open() == 0 && counter.invalid_frees() == 0)
    }
}

/// Requests as the mock host received them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateGc(Xid),
    FreeGc(Xid),
    CreateWindow {
        window: Xid,
        parent: Xid,
        event_mask: u32,
    },
    DestroyWindow(Xid),
    SizeHints {
        window: Xid,
        hints: SizeHints,
    },
    SetTitle(Xid, String),
    Configure {
        window: Xid,
        x: Option<i32>,
        y: Option<i32>,
        width: Option<u32>,
        height: Option<u32>,
    },
    MapWindow(Xid),
    CreatePixmap {
        pixmap: Xid,
        depth: u8,
        width: u16,
        height: u16,
    },
    FreePixmap(Xid),
    CreateCursor(Xid),
    FreeCursor(Xid),
    SetCursor(Xid, Xid),
    ShmAttach {
        seg: Xid,
        shmid: u32,
    },
    ShmDetach(Xid),
    ShmPutImage {
        window: Xid,
        rect: Rect,
        seg: Xid,
    },
    PutImage {
        window: Xid,
        x: i16,
        y: i16,
        width: u16,
        height: u16,
        len: usize,
    },
    Sync,
}

#[derive(Debug, Clone)]
struct Options {
    visual: VisualMasks,
    pixmap_formats: Vec<PixmapFormat>,
    shm: bool,
    shm_version_fails: bool,
    shm_attach_fails: bool,
    shm_allocation_fails: bool,
    xkb: bool,
    xkb_version_ok: bool,
    xkb_keyboard: bool,
    xkb_geometry: bool,
    cursor_fails: bool,
    expose_on_map: bool,
    maximum_request_bytes: usize,
    keycodes_per_modifier: usize,
    modifier_keycodes: Vec<u8>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            visual: VisualMasks {
                red: 0x00ff_0000,
                green: 0x0000_ff00,
                blue: 0x0000_00ff,
            },
            pixmap_formats: vec![
                PixmapFormat {
                    depth: 1,
                    bits_per_pixel: 1,
                    scanline_pad: 32,
                },
                PixmapFormat {
                    depth: 16,
                    bits_per_pixel: 16,
                    scanline_pad: 32,
                },
                PixmapFormat {
                    depth: 24,
                    bits_per_pixel: 32,
                    scanline_pad: 32,
                },
                PixmapFormat {
                    depth: 32,
                    bits_per_pixel: 32,
                    scanline_pad: 32,
                },
            ],
            shm: true,
            shm_version_fails: false,
            shm_attach_fails: false,
            shm_allocation_fails: false,
            xkb: true,
            xkb_version_ok: true,
            xkb_keyboard: true,
            xkb_geometry: true,
            cursor_fails: false,
            expose_on_map: true,
            maximum_request_bytes: 4 * 0x3fffff,
            keycodes_per_modifier: 2,
            modifier_keycodes: vec![
                50, 62, // Shift
                66, 0, // Lock
                37, 105, // Control
                64, 108, // Mod1
                77, 0, // Mod2
                0, 0, // Mod3
                133, 134, // Mod4
                92, 203, // Mod5
            ],
        }
    }
}

#[derive(Debug, Default)]
pub struct MockDisplayBuilder {
    options: Options,
}

impl MockDisplayBuilder {
    pub fn without_shm(mut self) -> Self {
        self.options.shm = false;
        self
    }

    pub fn shm_version_fails(mut self) -> Self {
        self.options.shm_version_fails = true;
        self
    }

    pub fn shm_attach_fails(mut self) -> Self {
        self.options.shm_attach_fails = true;
        self
    }

    /// Makes [`MockDisplay::allocator`] fail every allocation.
    pub fn shm_allocation_fails(mut self) -> Self {
        self.options.shm_allocation_fails = true;
        self
    }

    pub fn without_xkb(mut self) -> Self {
        self.options.xkb = false;
        self
    }

    pub fn xkb_version_refused(mut self) -> Self {
        self.options.xkb_version_ok = false;
        self
    }

    pub fn without_xkb_keyboard(mut self) -> Self {
        self.options.xkb_keyboard = false;
        self
    }

    pub fn without_xkb_geometry(mut self) -> Self {
        self.options.xkb_geometry = false;
        self
    }

    pub fn cursor_creation_fails(mut self) -> Self {
        self.options.cursor_fails = true;
        self
    }

    pub fn without_expose_on_map(mut self) -> Self {
        self.options.expose_on_map = false;
        self
    }

    pub fn maximum_request_bytes(mut self, bytes: usize) -> Self {
        self.options.maximum_request_bytes = bytes;
        self
    }

    pub fn visual(mut self, visual: VisualMasks) -> Self {
        self.options.visual = visual;
        self
    }

    pub fn pixmap_formats(mut self, formats: Vec<PixmapFormat>) -> Self {
        self.options.pixmap_formats = formats;
        self
    }

    /// Modifier mapping reply: `keycodes_per_modifier` slots for each of
    /// the eight modifiers.
    pub fn modifier_mapping(mut self, keycodes_per_modifier: usize, keycodes: Vec<u8>) -> Self {
        self.options.keycodes_per_modifier = keycodes_per_modifier;
        self.options.modifier_keycodes = keycodes;
        self
    }

    pub fn build(self) -> MockDisplay {
        let setup = HostSetup {
            screen_number: 0,
            root: 0x0000_0100,
            visual: self.options.visual,
            min_keycode: 8,
            max_keycode: 255,
            pixmap_formats: self.options.pixmap_formats.clone(),
        };

        MockDisplay {
            state: Rc::new(DisplayState {
                options: self.options,
                setup,
                next_id: Cell::new(FIRST_ID),
                ledger: Rc::default(),
                requests: RefCell::default(),
                events: RefCell::default(),
                segments: Rc::default(),
                attached: RefCell::default(),
                window_sizes: RefCell::default(),
                surfaces: RefCell::default(),
                last_cursor: Cell::new(None),
                waits: RefCell::default(),
            }),
        }
    }
}

struct Surface {
    width: usize,
    height: usize,
    bytes_per_pixel: usize,
    pixels: Vec<u8>,
}

impl Surface {
    fn write_row(&mut self, x: usize, y: usize, row: &[u8]) {
        if y >= self.height || x >= self.width {
            return;
        }
        let len = row.len().min((self.width - x) * self.bytes_per_pixel);
        let start = (y * self.width + x) * self.bytes_per_pixel;
        self.pixels[start..start + len].copy_from_slice(&row[..len]);
    }
}

#[derive(Default)]
struct SegmentTable {
    next_shmid: u32,
    live: HashMap<u32, (NonNull<u8>, usize)>,
    // marked for removal: still mapped, no longer attachable
    removed: HashSet<u32>,
}

struct DisplayState {
    options: Options,
    setup: HostSetup,
    next_id: Cell<Xid>,
    ledger: Rc<Ledger>,
    requests: RefCell<Vec<Request>>,
    events: RefCell<VecDeque<HostEvent>>,
    segments: Rc<RefCell<SegmentTable>>,
    attached: RefCell<HashMap<Xid, u32>>,
    window_sizes: RefCell<HashMap<Xid, (u32, u32)>>,
    surfaces: RefCell<HashMap<Xid, Surface>>,
    last_cursor: Cell<Option<Xid>>,
    waits: RefCell<Vec<Option<Duration>>>,
}

/// Handle on the mock host display server. Clones share the same server.
#[derive(Clone)]
pub struct MockDisplay {
    state: Rc<DisplayState>,
}

impl Default for MockDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDisplay {
    /// A host with MIT-SHM, XKB and a 24-bit TrueColor root visual.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MockDisplayBuilder {
        MockDisplayBuilder::default()
    }

    /// Opens a client connection to this display.
    pub fn connect(&self) -> MockHost {
        let id = self.next_id();
        self.state.ledger.connections.create(id);
        MockHost {
            display: self.clone(),
            id,
        }
    }

    /// Allocates segments the mock host can read, like SysV shared memory.
    pub fn allocator(&self) -> HeapShmAllocator {
        HeapShmAllocator {
            table: Rc::clone(&self.state.segments),
            ledger: Rc::clone(&self.state.ledger),
            fails: self.state.options.shm_allocation_fails,
        }
    }

    pub fn setup(&self) -> &HostSetup {
        &self.state.setup
    }

    pub fn ledger(&self) -> Rc<Ledger> {
        Rc::clone(&self.state.ledger)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.borrow().clone()
    }

    pub fn clear_requests(&self) {
        self.state.requests.borrow_mut().clear();
    }

    pub fn push_event(&self, event: HostEvent) {
        self.state.events.borrow_mut().push_back(event);
    }

    pub fn pending_events(&self) -> usize {
        self.state.events.borrow().len()
    }

    /// Timeouts passed to every blocking wait, in order
    pub fn waits(&self) -> Vec<Option<Duration>> {
        self.state.waits.borrow().clone()
    }

    pub fn last_cursor(&self) -> Option<Xid> {
        self.state.last_cursor.get()
    }

    /// Pixels shown in `window`, row-major with no padding. Empty until
    /// something has been drawn.
    pub fn window_pixels(&self, window: Xid) -> Vec<u8> {
        self.state
            .surfaces
            .borrow()
            .get(&window)
            .map(|surface| surface.pixels.clone())
            .unwrap_or_default()
    }

    fn next_id(&self) -> Xid {
        let id = self.state.next_id.get();
        self.state.next_id.set(id + 1);
        id
    }

    fn record(&self, request: Request) {
        self.state.requests.borrow_mut().push(request);
    }

    fn with_surface(&self, window: Xid, depth: u8, draw: impl FnOnce(&mut Surface)) {
        let Some(format) = self.state.setup.pixmap_format(depth) else {
            return;
        };
        // only whole-byte pixels are tracked
        if format.bits_per_pixel % 8 != 0 {
            return;
        }
        let Some(&(width, height)) = self.state.window_sizes.borrow().get(&window) else {
            return;
        };

        let mut surfaces = self.state.surfaces.borrow_mut();
        let surface = surfaces.entry(window).or_insert_with(|| {
            let bytes_per_pixel = usize::from(format.bits_per_pixel / 8);
            Surface {
                width: width as usize,
                height: height as usize,
                bytes_per_pixel,
                pixels: vec![0; width as usize * height as usize * bytes_per_pixel],
            }
        });
        draw(surface);
    }

    fn check_window(&self, window: Xid) -> Result<()> {
        if self.state.ledger.windows.is_live(window) {
            Ok(())
        } else {
            Err(Error::Protocol(format!("BadWindow {:#x}", window)))
        }
    }
}

/// A client connection to a [`MockDisplay`].
pub struct MockHost {
    display: MockDisplay,
    id: Xid,
}

impl Drop for MockHost {
    fn drop(&mut self) {
        self.display.state.ledger.connections.free(self.id);
    }
}

impl HostConnection for MockHost {
    fn setup(&self) -> &HostSetup {
        &self.display.state.setup
    }

    fn maximum_request_bytes(&self) -> usize {
        self.display.state.options.maximum_request_bytes
    }

    fn descriptor(&self) -> RawFd {
        MOCK_DESCRIPTOR
    }

    fn has_extension(&self, extension: Extension) -> Result<bool> {
        let options = &self.display.state.options;
        Ok(match extension {
            Extension::SharedMemory => options.shm,
            Extension::Keyboard => options.xkb,
        })
    }

    fn use_keyboard_extension(&self) -> Result<bool> {
        Ok(self.display.state.options.xkb_version_ok)
    }

    fn shm_query_version(&self) -> Result<ShmVersion> {
        if self.display.state.options.shm_version_fails {
            return Err(Error::Protocol("BadRequest (ShmQueryVersion)".into()));
        }
        Ok(ShmVersion {
            major: 1,
            minor: 2,
            shared_pixmaps: true,
        })
    }

    fn generate_id(&self) -> Result<Xid> {
        Ok(self.display.next_id())
    }

    fn create_gc(&self, gc: Xid, _drawable: Xid) -> Result<()> {
        self.display.state.ledger.gcs.create(gc);
        self.display.record(Request::CreateGc(gc));
        Ok(())
    }

    fn free_gc(&self, gc: Xid) -> Result<()> {
        self.display.state.ledger.gcs.free(gc);
        self.display.record(Request::FreeGc(gc));
        Ok(())
    }

    fn create_window(&self, window: Xid, parent: Xid, event_mask: EventMask) -> Result<()> {
        self.display.state.ledger.windows.create(window);
        self.display
            .state
            .window_sizes
            .borrow_mut()
            .insert(window, (100, 100));
        self.display.record(Request::CreateWindow {
            window,
            parent,
            event_mask: u32::from(event_mask),
        });
        Ok(())
    }

    fn destroy_window(&self, window: Xid) -> Result<()> {
        self.display.state.ledger.windows.free(window);
        self.display.state.surfaces.borrow_mut().remove(&window);
        self.display.record(Request::DestroyWindow(window));
        Ok(())
    }

    fn set_size_hints(&self, window: Xid, hints: &SizeHints) -> Result<()> {
        self.display.check_window(window)?;
        self.display.record(Request::SizeHints {
            window,
            hints: *hints,
        });
        Ok(())
    }

    fn set_title(&self, window: Xid, title: &str) -> Result<()> {
        self.display.check_window(window)?;
        self.display.record(Request::SetTitle(window, title.to_owned()));
        Ok(())
    }

    fn configure_window(&self, window: Xid, values: &ConfigureWindowAux) -> Result<()> {
        self.display.check_window(window)?;
        if let Some(size) = self.display.state.window_sizes.borrow_mut().get_mut(&window) {
            size.0 = values.width.unwrap_or(size.0);
            size.1 = values.height.unwrap_or(size.1);
        }
        self.display.record(Request::Configure {
            window,
            x: values.x,
            y: values.y,
            width: values.width,
            height: values.height,
        });
        Ok(())
    }

    fn map_window(&self, window: Xid) -> Result<()> {
        self.display.check_window(window)?;
        self.display.record(Request::MapWindow(window));
        if self.display.state.options.expose_on_map {
            let (width, height) = self.display.state.window_sizes.borrow()[&window];
            self.display.push_event(HostEvent::Expose {
                x: 0,
                y: 0,
                width: width as u16,
                height: height as u16,
            });
        }
        Ok(())
    }

    fn create_pixmap(
        &self,
        depth: u8,
        pixmap: Xid,
        _drawable: Xid,
        width: u16,
        height: u16,
    ) -> Result<()> {
        self.display.state.ledger.pixmaps.create(pixmap);
        self.display.record(Request::CreatePixmap {
            pixmap,
            depth,
            width,
            height,
        });
        Ok(())
    }

    fn free_pixmap(&self, pixmap: Xid) -> Result<()> {
        self.display.state.ledger.pixmaps.free(pixmap);
        self.display.record(Request::FreePixmap(pixmap));
        Ok(())
    }

    fn create_cursor(&self, cursor: Xid, _pixmap: Xid) -> Result<()> {
        if self.display.state.options.cursor_fails {
            return Err(Error::Protocol("BadAlloc (CreateCursor)".into()));
        }
        self.display.state.ledger.cursors.create(cursor);
        self.display.state.last_cursor.set(Some(cursor));
        self.display.record(Request::CreateCursor(cursor));
        Ok(())
    }

    fn free_cursor(&self, cursor: Xid) -> Result<()> {
        self.display.state.ledger.cursors.free(cursor);
        self.display.record(Request::FreeCursor(cursor));
        Ok(())
    }

    fn set_window_cursor(&self, window: Xid, cursor: Xid) -> Result<()> {
        self.display.check_window(window)?;
        self.display.record(Request::SetCursor(window, cursor));
        Ok(())
    }

    fn shm_attach(&self, seg: Xid, shmid: u32) -> Result<()> {
        let state = &self.display.state;
        let attachable = {
            let segments = state.segments.borrow();
            segments.live.contains_key(&shmid) && !segments.removed.contains(&shmid)
        };
        if state.options.shm_attach_fails || !attachable {
            return Err(Error::Protocol("BadAccess (ShmAttach)".into()));
        }
        state.ledger.shm_attachments.create(seg);
        state.attached.borrow_mut().insert(seg, shmid);
        self.display.record(Request::ShmAttach { seg, shmid });
        Ok(())
    }

    fn shm_detach(&self, seg: Xid) -> Result<()> {
        self.display.state.ledger.shm_attachments.free(seg);
        self.display.state.attached.borrow_mut().remove(&seg);
        self.display.record(Request::ShmDetach(seg));
        Ok(())
    }

    fn shm_put_image(
        &self,
        window: Xid,
        _gc: Xid,
        layout: &ImageLayout,
        rect: Rect,
        seg: Xid,
    ) -> Result<()> {
        self.display.check_window(window)?;
        let state = &self.display.state;
        let shmid = *state
            .attached
            .borrow()
            .get(&seg)
            .ok_or_else(|| Error::Protocol(format!("BadShmSeg {:#x}", seg)))?;
        let (ptr, len) = *state
            .segments
            .borrow()
            .live
            .get(&shmid)
            .ok_or_else(|| Error::Protocol(format!("segment {} was removed", shmid)))?;
        // SAFETY: the segment is live (it is removed from the table when
        // dropped) and the caller holds no mutable view while it is read.
        let image = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };

        self.display.with_surface(window, layout.depth, |surface| {
            let bytes_per_pixel = surface.bytes_per_pixel;
            let row_len = usize::from(rect.width) * bytes_per_pixel;
            for r in 0..usize::from(rect.height) {
                let y = usize::from(rect.y) + r;
                let start = y * layout.stride + usize::from(rect.x) * bytes_per_pixel;
                surface.write_row(usize::from(rect.x), y, &image[start..start + row_len]);
            }
        });
        self.display.record(Request::ShmPutImage { window, rect, seg });
        Ok(())
    }

    fn put_image(
        &self,
        window: Xid,
        _gc: Xid,
        width: u16,
        height: u16,
        dst_x: i16,
        dst_y: i16,
        depth: u8,
        data: &[u8],
    ) -> Result<()> {
        self.display.check_window(window)?;
        if data.len() + 24 > self.maximum_request_bytes() {
            return Err(Error::Connection("request exceeds maximum length".into()));
        }

        if let Some(format) = self.setup().pixmap_format(depth) {
            let layout = ImageLayout::native(Some(format), width.max(1), 1, depth)?;
            let row_bytes = layout.stride;
            self.display.with_surface(window, depth, |surface| {
                let copy = usize::from(width) * surface.bytes_per_pixel;
                for (r, row) in data.chunks(row_bytes).take(usize::from(height)).enumerate() {
                    let y = dst_y as usize + r;
                    surface.write_row(dst_x as usize, y, &row[..copy.min(row.len())]);
                }
            });
        }

        self.display.record(Request::PutImage {
            window,
            x: dst_x,
            y: dst_y,
            width,
            height,
            len: data.len(),
        });
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.display.record(Request::Sync);
        Ok(())
    }

    fn poll_for_event(&self) -> Result<Option<HostEvent>> {
        Ok(self.display.state.events.borrow_mut().pop_front())
    }

    fn wait_for_event(&self, timeout: Option<Duration>) -> Result<Option<HostEvent>> {
        self.display.state.waits.borrow_mut().push(timeout);
        // nothing else can queue events while we wait
        self.poll_for_event()
    }

    fn keyboard_mapping(&self, first_keycode: u8, count: u8) -> Result<KeyboardMappingReply> {
        const KEYSYMS_PER_KEYCODE: u8 = 2;
        let mut keysyms = vec![0; usize::from(count) * usize::from(KEYSYMS_PER_KEYCODE)];
        // keycode 38 is 'a' on a pc105 layout
        if let Some(index) = 38u8.checked_sub(first_keycode).map(usize::from) {
            if index < usize::from(count) {
                keysyms[index * 2] = 0x61;
                keysyms[index * 2 + 1] = 0x41;
            }
        }
        Ok(KeyboardMappingReply {
            keysyms_per_keycode: KEYSYMS_PER_KEYCODE,
            keysyms,
        })
    }

    fn modifier_mapping(&self) -> Result<Vec<u8>> {
        let options = &self.display.state.options;
        let mut keycodes = options.modifier_keycodes.clone();
        keycodes.resize(options.keycodes_per_modifier * 8, 0);
        Ok(keycodes)
    }

    fn keyboard_control(&self) -> Result<CoreKeyboardControl> {
        Ok(CoreKeyboardControl {
            global_auto_repeat: true,
            auto_repeats: [0xff; 32],
            led_mask: 0,
            key_click_percent: 0,
            bell_percent: 50,
            bell_pitch: 400,
            bell_duration: 100,
        })
    }

    fn xkb_controls(&self) -> Result<Option<XkbControls>> {
        if !self.display.state.options.xkb_keyboard {
            return Ok(None);
        }
        Ok(Some(XkbControls {
            device_id: 3,
            num_groups: 1,
            repeat_delay: 660,
            repeat_interval: 40,
            slow_keys_delay: 300,
            debounce_delay: 300,
            mouse_keys_default_button: 1,
            mouse_keys_delay: 160,
            mouse_keys_interval: 40,
            mouse_keys_time_to_max: 30,
            mouse_keys_max_speed: 30,
            mouse_keys_curve: 500,
            access_x_timeout: 120,
            enabled_controls: 0x0000_0001,
            per_key_repeat: [0xff; 32],
        }))
    }

    fn xkb_geometry(&self) -> Result<Option<XkbGeometry>> {
        if !self.display.state.options.xkb_geometry {
            return Ok(None);
        }
        Ok(Some(XkbGeometry { name: 0x01e5 }))
    }
}

/// Heap-backed stand-in for SysV shared memory. Segments are visible to the
/// [`MockDisplay`] they came from while they are alive.
#[derive(Clone)]
pub struct HeapShmAllocator {
    table: Rc<RefCell<SegmentTable>>,
    ledger: Rc<Ledger>,
    fails: bool,
}

impl HeapShmAllocator {
    pub fn allocated(&self) -> usize {
        self.ledger.segments.created()
    }

    pub fn released(&self) -> usize {
        self.ledger.segments.freed()
    }

    /// Live segments already marked for removal
    pub fn marked_removed(&self) -> usize {
        self.table.borrow().removed.len()
    }
}

impl ShmAllocator for HeapShmAllocator {
    fn allocate(&self, len: usize) -> io::Result<Box<dyn ShmSegment>> {
        if self.fails {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "mock segment allocation failure",
            ));
        }

        let block = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(block) as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null allocation"))?;

        let shmid = {
            let mut table = self.table.borrow_mut();
            table.next_shmid += 1;
            let shmid = table.next_shmid;
            table.live.insert(shmid, (ptr, len));
            shmid
        };
        self.ledger.segments.create(shmid);

        Ok(Box::new(HeapSegment {
            shmid,
            ptr,
            len,
            table: Rc::clone(&self.table),
            ledger: Rc::clone(&self.ledger),
        }))
    }
}

struct HeapSegment {
    shmid: u32,
    ptr: NonNull<u8>,
    len: usize,
    table: Rc<RefCell<SegmentTable>>,
    ledger: Rc<Ledger>,
}

impl ShmSegment for HeapSegment {
    fn shmid(&self) -> u32 {
        self.shmid
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr owns len bytes until drop.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self is the only process-side view.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn mark_removed(&mut self) -> io::Result<()> {
        self.table.borrow_mut().removed.insert(self.shmid);
        Ok(())
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        let mut table = self.table.borrow_mut();
        table.live.remove(&self.shmid);
        table.removed.remove(&self.shmid);
        drop(table);
        self.ledger.segments.free(self.shmid);
        // SAFETY: ptr and len come from the boxed slice leaked in allocate.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// Guest input device that records what it is sent.
#[derive(Debug, Default)]
pub struct RecordingSink {
    motions: RefCell<Vec<(i32, i32)>>,
    buttons: RefCell<Vec<(u8, bool)>>,
    keys: RefCell<Vec<(u8, bool)>>,
}

impl RecordingSink {
    pub fn motions(&self) -> Vec<(i32, i32)> {
        self.motions.borrow().clone()
    }

    pub fn buttons(&self) -> Vec<(u8, bool)> {
        self.buttons.borrow().clone()
    }

    pub fn keys(&self) -> Vec<(u8, bool)> {
        self.keys.borrow().clone()
    }

    pub fn total(&self) -> usize {
        self.motions.borrow().len() + self.buttons.borrow().len() + self.keys.borrow().len()
    }
}

impl InputSink for RecordingSink {
    fn post_motion(&self, x: i32, y: i32) {
        self.motions.borrow_mut().push((x, y));
    }

    fn post_button(&self, button: u8, is_down: bool) {
        self.buttons.borrow_mut().push((button, is_down));
    }

    fn post_key(&self, keycode: u8, is_down: bool) {
        self.keys.borrow_mut().push((keycode, is_down));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_free_unbalances_the_ledger() {
        let display = MockDisplay::new();
        let host = display.connect();
        let gc = host.generate_id().unwrap();
        host.create_gc(gc, display.setup().root).unwrap();
        host.free_gc(gc).unwrap();
        drop(host);
        assert!(display.ledger().is_balanced());

        let host = display.connect();
        host.free_gc(gc).unwrap();
        drop(host);
        assert_eq!(display.ledger().gcs.invalid_frees(), 1);
        assert!(!display.ledger().is_balanced());
    }

    #[test]
    fn segments_are_visible_until_dropped() {
        let display = MockDisplay::new();
        let allocator = display.allocator();
        let mut segment = allocator.allocate(16).unwrap();
        segment.as_mut_slice()[0] = 7;

        let host = display.connect();
        host.shm_attach(1, segment.shmid()).unwrap();
        host.shm_detach(1).unwrap();

        drop(segment);
        assert_eq!(allocator.released(), 1);
        assert!(host.shm_attach(2, 1).is_err());
    }

    #[test]
    fn map_queues_an_expose_of_the_whole_window() {
        let display = MockDisplay::new();
        let host = display.connect();
        host.create_window(5, display.setup().root, EventMask::EXPOSURE)
            .unwrap();
        host.configure_window(5, &ConfigureWindowAux::new().width(30).height(20))
            .unwrap();
        host.map_window(5).unwrap();

        assert_eq!(
            host.poll_for_event().unwrap(),
            Some(HostEvent::Expose {
                x: 0,
                y: 0,
                width: 30,
                height: 20
            })
        );
        assert_eq!(host.wait_for_event(None).unwrap(), None);
    }
}
