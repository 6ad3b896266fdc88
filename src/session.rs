//! One nested screen: the host connection and everything created on it
//!
//! A [`Session`] is either fully established (connected, XKB enabled,
//! window mapped and exposed, framebuffer allocated) or was never returned.
//! Dropping it, or calling [`Session::close`], releases what it holds in
//! reverse order of acquisition.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{error, info, trace, warn};

use crate::bridge::{InputRoute, InputSink};
use crate::config::ScreenConfig;
use crate::error::{Error, Result};
use crate::framebuffer::Framebuffer;
use crate::host::{Extension, HostConnection, HostEvent, ShmVersion, VisualMasks, Xid};
use crate::keyboard::{self, KeyboardMappings};
use crate::shm::{ShmAllocator, SysvAllocator};
use crate::window::HostWindow;
use crate::x11::X11Host;

/// What the host offered when the session was negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub has_shared_memory: bool,
    pub shm_version: Option<ShmVersion>,
    pub has_keyboard_extension: bool,
}

pub struct Session<H: HostConnection = X11Host> {
    pub(crate) framebuffer: Framebuffer,
    pub(crate) window: HostWindow,
    pub(crate) gc: Xid,
    pub(crate) route: InputRoute,
    visual: VisualMasks,
    capabilities: Capabilities,
    screen_index: u32,
    // fields drop in order, so the connection goes last
    pub(crate) host: H,
}

impl<H: HostConnection> std::fmt::Debug for Session<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("screen_index", &self.screen_index)
            .field("window", &self.window)
            .field("framebuffer", &self.framebuffer)
            .field("route", &self.route)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl Session<X11Host> {
    /// Connects to the host display named in `config` and sets up a nested
    /// screen on it.
    pub fn create(config: &ScreenConfig) -> Result<Self> {
        let host = X11Host::connect(config.display.as_deref()).inspect_err(|err| {
            error!(
                screen = config.screen_index,
                "cannot open host display {}: {}",
                config.display.as_deref().unwrap_or("$DISPLAY"),
                err
            )
        })?;
        Self::establish(host, &SysvAllocator, config)
    }
}

impl<H: HostConnection> Session<H> {
    /// Sets up a nested screen on an open host connection. On failure
    /// everything created so far is released and the connection dropped.
    pub fn establish(host: H, allocator: &dyn ShmAllocator, config: &ScreenConfig) -> Result<Self> {
        let screen = config.screen_index;

        if !host.has_extension(Extension::Keyboard)? || !host.use_keyboard_extension()? {
            error!(screen, "Host X server does not support the XKEYBOARD extension");
            return Err(Error::Capability("XKEYBOARD extension".into()));
        }

        let root = host.setup().root;
        let visual = host.setup().visual;

        let gc = host.generate_id()?;
        host.create_gc(gc, root)?;

        let window = match HostWindow::create(&host, root, config) {
            Ok(window) => window,
            Err(err) => {
                error!(screen, "cannot create host window: {}", err);
                release_gc(&host, gc);
                return Err(err);
            }
        };

        let framebuffer = match Framebuffer::acquire(
            &host,
            allocator,
            config.width,
            config.height,
            config.depth,
        ) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                error!(screen, "cannot allocate framebuffer: {}", err);
                window.destroy(&host);
                release_gc(&host, gc);
                return Err(err);
            }
        };

        let capabilities = Capabilities {
            has_shared_memory: framebuffer.shm_version().is_some(),
            shm_version: framebuffer.shm_version(),
            has_keyboard_extension: true,
        };

        // from here on an early return drops the session, which unwinds it
        let mut session = Session {
            framebuffer,
            window,
            gc,
            route: InputRoute::default(),
            visual,
            capabilities,
            screen_index: screen,
            host,
        };

        session.window.hide_cursor(&session.host)?;
        session.log_format(config);
        session.wait_for_first_expose(config.expose_timeout)?;

        info!(
            screen,
            shm = session.using_shm(),
            "nested screen ready in window {:#x}",
            session.window.id()
        );
        Ok(session)
    }

    fn log_format(&self, config: &ScreenConfig) {
        let fb = &self.framebuffer;
        let screen = self.screen_index;
        info!(
            screen,
            "width: {} height: {} depth: {} bpp: {}",
            fb.width(),
            fb.height(),
            fb.depth(),
            fb.bits_per_pixel()
        );
        info!(
            screen,
            "red_mask: {:#x} green_mask: {:#x} blue_mask: {:#x}",
            self.visual.red,
            self.visual.green,
            self.visual.blue
        );
        if fb.bits_per_pixel() != config.bits_per_pixel {
            warn!(
                screen,
                "requested {} bits per pixel, host uses {} for depth {}",
                config.bits_per_pixel,
                fb.bits_per_pixel(),
                fb.depth()
            );
        }
    }

    /// Blocks until the host exposes the window, so it is on screen before
    /// the caller starts drawing.
    fn wait_for_first_expose(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            match self.host.wait_for_event(remaining)? {
                Some(HostEvent::Expose {
                    x,
                    y,
                    width,
                    height,
                }) => {
                    let (x, y) = (i32::from(x), i32::from(y));
                    return self.update_region(x, y, x + i32::from(width), y + i32::from(height));
                }
                Some(event) => trace!(?event, "discarding event before first exposure"),
                None => {
                    warn!(
                        screen = self.screen_index,
                        "window not exposed within {:?}, continuing",
                        timeout.unwrap_or_default()
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Pushes `[x1, x2) x [y1, y2)` of the framebuffer to the host window.
    pub fn update_region(&self, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<()> {
        self.window
            .update_region(&self.host, self.gc, &self.framebuffer, x1, y1, x2, y2)
    }

    /// Keysyms, modifier map and keyboard controls of the host keyboard.
    pub fn keyboard_mappings(&self) -> Result<KeyboardMappings> {
        keyboard::keyboard_mappings(&self.host)
    }

    /// Routes host input to `device` from now on. The session keeps only a
    /// weak reference.
    pub fn set_input_route<S: InputSink + 'static>(&mut self, device: &Rc<S>) {
        self.route.set(device);
    }

    pub fn clear_input_route(&mut self) {
        self.route.clear();
    }

    pub fn input_route(&self) -> &InputRoute {
        &self.route
    }

    /// Readable whenever host events are waiting for [`Session::check_events`].
    pub fn descriptor(&self) -> RawFd {
        self.host.descriptor()
    }

    pub fn masks(&self) -> VisualMasks {
        self.visual
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn using_shm(&self) -> bool {
        self.framebuffer.is_shared()
    }

    pub fn screen_index(&self) -> u32 {
        self.screen_index
    }

    pub fn window(&self) -> &HostWindow {
        &self.window
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn framebuffer_mut(&mut self) -> &mut Framebuffer {
        &mut self.framebuffer
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Tears the screen down. Equivalent to dropping the session.
    pub fn close(self) {
        info!(screen = self.screen_index, "closing nested screen");
    }
}

impl<H: HostConnection> Drop for Session<H> {
    fn drop(&mut self) {
        self.framebuffer.detach(&self.host);
        self.window.destroy(&self.host);
        release_gc(&self.host, self.gc);
        if let Err(err) = self.host.flush() {
            warn!("failed to flush host connection: {}", err);
        }
    }
}

fn release_gc<H: HostConnection + ?Sized>(host: &H, gc: Xid) {
    if let Err(err) = host.free_gc(gc) {
        warn!("failed to free graphics context {:#x}: {}", gc, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDisplay, MockHost, Request};

    fn config() -> ScreenConfig {
        ScreenConfig::new(64, 48).expose_timeout(Some(Duration::ZERO))
    }

    fn establish(display: &MockDisplay, config: &ScreenConfig) -> Result<Session<MockHost>> {
        Session::establish(display.connect(), &display.allocator(), config)
    }

    #[test]
    fn establish_waits_for_first_exposure() {
        let display = MockDisplay::new();
        let _session = establish(&display, &config()).unwrap();

        assert_eq!(display.pending_events(), 0);
        // the exposed area is drawn before returning
        assert!(display
            .requests()
            .iter()
            .any(|r| matches!(r, Request::ShmPutImage { .. })));
    }

    #[test]
    fn missing_expose_is_not_fatal() {
        let display = MockDisplay::builder().without_expose_on_map().build();
        let session = establish(&display, &config()).unwrap();
        assert_eq!(session.window().size(), (64, 48));
    }

    #[test]
    fn first_exposure_wait_is_bounded_by_the_config() {
        let display = MockDisplay::builder().without_expose_on_map().build();
        let timeout = Duration::from_millis(250);
        let _session = establish(&display, &config().expose_timeout(Some(timeout))).unwrap();

        let waits = display.waits();
        assert_eq!(waits.len(), 1);
        assert!(matches!(waits[0], Some(wait) if wait <= timeout));
    }

    #[test]
    fn unbounded_wait_passes_no_timeout() {
        let display = MockDisplay::new();
        let _session = establish(&display, &config().expose_timeout(None)).unwrap();
        assert_eq!(display.waits(), vec![None]);
    }

    #[test]
    fn descriptor_is_the_host_connection() {
        let display = MockDisplay::new();
        let session = establish(&display, &config()).unwrap();
        assert_eq!(session.descriptor(), crate::mock::MOCK_DESCRIPTOR);
        assert_eq!(session.descriptor(), session.host().descriptor());
    }

    #[test]
    fn debug_output_names_the_screen() {
        let display = MockDisplay::new();
        let session = establish(&display, &config().screen_index(4)).unwrap();
        let text = format!("{:?}", session);
        assert!(text.contains("screen_index: 4"));
        assert!(text.contains("Screen 4"));
    }

    #[test]
    fn missing_keyboard_extension_fails_before_any_resource() {
        let display = MockDisplay::builder().without_xkb().build();
        let err = establish(&display, &config()).unwrap_err();

        let ledger = display.ledger();
        assert!(matches!(err, Error::Capability(_)));
        assert_eq!(ledger.windows.created(), 0);
        assert_eq!(ledger.connections.created(), 1);
        assert_eq!(ledger.connections.open(), 0);
    }

    #[test]
    fn refused_keyboard_extension_version_fails() {
        let display = MockDisplay::builder().xkb_version_refused().build();
        let err = establish(&display, &config()).unwrap_err();
        assert!(matches!(err, Error::Capability(_)));
        assert!(display.ledger().is_balanced());
    }

    #[test]
    fn framebuffer_failure_unwinds_window_and_gc() {
        let display = MockDisplay::new();
        // no pixmap format for depth 12
        let err = establish(&display, &config().depth(12, 16)).unwrap_err();

        assert!(matches!(err, Error::Resource(_)));
        let ledger = display.ledger();
        assert_eq!(ledger.windows.created(), 1);
        assert_eq!(ledger.gcs.created(), 1);
        assert!(ledger.is_balanced());
    }

    #[test]
    fn cursor_failure_unwinds_the_whole_session() {
        let display = MockDisplay::builder().cursor_creation_fails().build();
        assert!(establish(&display, &config()).is_err());

        let ledger = display.ledger();
        assert_eq!(ledger.shm_attachments.created(), 1);
        assert_eq!(ledger.pixmaps.created(), 1);
        assert!(ledger.is_balanced());
    }

    #[test]
    fn capabilities_reflect_the_host() {
        let display = MockDisplay::builder().without_shm().build();
        let session = establish(&display, &config()).unwrap();

        let caps = session.capabilities();
        assert!(!caps.has_shared_memory);
        assert_eq!(caps.shm_version, None);
        assert!(caps.has_keyboard_extension);
        assert!(!session.using_shm());
        assert_eq!(session.masks(), display.setup().visual);
    }

    #[test]
    fn close_releases_in_reverse_order() {
        let display = MockDisplay::new();
        let session = establish(&display, &config()).unwrap();
        let window = session.window().id();
        let seg = session.framebuffer().shm_segment().unwrap();
        let gc = session.gc;
        session.close();

        let requests = display.requests();
        let tail: Vec<_> = requests[requests.len() - 3..].to_vec();
        assert_eq!(
            tail,
            vec![
                Request::ShmDetach(seg),
                Request::DestroyWindow(window),
                Request::FreeGc(gc),
            ]
        );
        assert!(display.ledger().is_balanced());
    }
}
