//! [`HostConnection`] over a real X server, through x11rb

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::properties::{WmSizeHints, WmSizeHintsSpecification};
use x11rb::protocol::shm::ConnectionExt as ShmExt;
use x11rb::protocol::xkb::{self, ConnectionExt as XkbExt};
use x11rb::protocol::xproto::{
    AtomEnum, AutoRepeatMode, ChangeWindowAttributesAux, ConfigureWindowAux, ConnectionExt,
    CreateGCAux, CreateWindowAux, EventMask, ImageFormat, PropMode, WindowClass,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as WrapperExt;

use crate::error::{Error, Result};
use crate::framebuffer::ImageLayout;
use crate::host::{
    Extension, HostConnection, HostEvent, HostSetup, KeyboardMappingReply, PixmapFormat, Rect,
    ShmVersion, SizeHints, VisualMasks, Xid,
};
use crate::keyboard::{CoreKeyboardControl, XkbControls, XkbGeometry};

// XkbUseCoreKbd
const CORE_KEYBOARD: xkb::DeviceSpec = 0x0100;

/// Returns whether a connection to `target` (or `$DISPLAY`) can be opened.
/// The connection is closed again before returning.
pub fn check_display(target: Option<&str>) -> bool {
    match x11rb::connect(target) {
        Ok(_) => true,
        Err(err) => {
            debug!(
                "host display {} unavailable: {}",
                target.unwrap_or("$DISPLAY"),
                err
            );
            false
        }
    }
}

/// An x11rb connection to the host display and its default screen
pub struct X11Host {
    conn: RustConnection,
    setup: HostSetup,
}

impl X11Host {
    /// Connects to `target`, or `$DISPLAY` when `None`.
    pub fn connect(target: Option<&str>) -> Result<Self> {
        let (conn, screen_number) = x11rb::connect(target)?;
        let setup = read_setup(&conn, screen_number)?;
        let name = target.unwrap_or("$DISPLAY");
        debug!(
            screen = screen_number,
            root = setup.root,
            "connected to host display {}",
            name
        );
        Ok(Self { conn, setup })
    }

    /// Waits until the socket is readable or `timeout` expires; `false` on
    /// expiry.
    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        let mut fds = libc::pollfd {
            fd: self.descriptor(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;

        // SAFETY: fds is a single valid pollfd for the duration of the call.
        let ready = unsafe { libc::poll(&mut fds, 1, millis) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(true);
            }
            return Err(Error::Connection(err.to_string()));
        }
        Ok(ready > 0)
    }
}

fn read_setup(conn: &RustConnection, screen_number: usize) -> Result<HostSetup> {
    let setup = conn.setup();
    let screen = setup.roots.get(screen_number).ok_or_else(|| {
        Error::Connection(format!("host has no screen {}", screen_number))
    })?;

    let visual = screen
        .allowed_depths
        .iter()
        .flat_map(|depth| depth.visuals.iter())
        .find(|visual| visual.visual_id == screen.root_visual)
        .ok_or_else(|| Error::Protocol("root visual not listed by the host".into()))?;

    Ok(HostSetup {
        screen_number,
        root: screen.root,
        visual: VisualMasks {
            red: visual.red_mask,
            green: visual.green_mask,
            blue: visual.blue_mask,
        },
        min_keycode: setup.min_keycode,
        max_keycode: setup.max_keycode,
        pixmap_formats: setup
            .pixmap_formats
            .iter()
            .map(|format| PixmapFormat {
                depth: format.depth,
                bits_per_pixel: format.bits_per_pixel,
                scanline_pad: format.scanline_pad,
            })
            .collect(),
    })
}

fn translate(event: Event) -> HostEvent {
    match event {
        Event::Expose(e) => HostEvent::Expose {
            x: e.x,
            y: e.y,
            width: e.width,
            height: e.height,
        },
        Event::MotionNotify(e) => HostEvent::Motion {
            x: e.event_x,
            y: e.event_y,
        },
        Event::KeyPress(e) => HostEvent::Key {
            keycode: e.detail,
            pressed: true,
        },
        Event::KeyRelease(e) => HostEvent::Key {
            keycode: e.detail,
            pressed: false,
        },
        Event::ButtonPress(e) => HostEvent::Button {
            button: e.detail,
            pressed: true,
        },
        Event::ButtonRelease(e) => HostEvent::Button {
            button: e.detail,
            pressed: false,
        },
        Event::EnterNotify(_) => HostEvent::Crossing { entered: true },
        Event::LeaveNotify(_) => HostEvent::Crossing { entered: false },
        Event::Error(err) => {
            warn!(
                "host error {:?} for request {}.{}",
                err.error_kind, err.major_opcode, err.minor_opcode
            );
            HostEvent::Other
        }
        _ => HostEvent::Other,
    }
}

impl HostConnection for X11Host {
    fn setup(&self) -> &HostSetup {
        &self.setup
    }

    fn maximum_request_bytes(&self) -> usize {
        self.conn.maximum_request_bytes()
    }

    fn descriptor(&self) -> RawFd {
        self.conn.stream().as_raw_fd()
    }

    fn has_extension(&self, extension: Extension) -> Result<bool> {
        Ok(self
            .conn
            .extension_information(extension.name())?
            .is_some())
    }

    fn use_keyboard_extension(&self) -> Result<bool> {
        let reply = self.conn.xkb_use_extension(1, 0)?.reply()?;
        if !reply.supported {
            warn!(
                "host XKB {}.{} refused version 1.0",
                reply.server_major, reply.server_minor
            );
        }
        Ok(reply.supported)
    }

    fn shm_query_version(&self) -> Result<ShmVersion> {
        let reply = self.conn.shm_query_version()?.reply()?;
        Ok(ShmVersion {
            major: reply.major_version,
            minor: reply.minor_version,
            shared_pixmaps: reply.shared_pixmaps,
        })
    }

    fn generate_id(&self) -> Result<Xid> {
        Ok(self.conn.generate_id()?)
    }

    fn create_gc(&self, gc: Xid, drawable: Xid) -> Result<()> {
        self.conn.create_gc(gc, drawable, &CreateGCAux::new())?;
        Ok(())
    }

    fn free_gc(&self, gc: Xid) -> Result<()> {
        self.conn.free_gc(gc)?;
        Ok(())
    }

    fn create_window(&self, window: Xid, parent: Xid, event_mask: EventMask) -> Result<()> {
        self.conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            parent,
            0,
            0,
            100,
            100,
            0,
            WindowClass::COPY_FROM_PARENT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new().event_mask(event_mask),
        )?;
        Ok(())
    }

    fn destroy_window(&self, window: Xid) -> Result<()> {
        self.conn.destroy_window(window)?;
        Ok(())
    }

    fn set_size_hints(&self, window: Xid, hints: &SizeHints) -> Result<()> {
        let (width, height) = hints.size;
        let (min_width, min_height) = hints.min_size;
        let (max_width, max_height) = hints.max_size;

        let mut wm_hints = WmSizeHints::new();
        wm_hints.position = Some((
            WmSizeHintsSpecification::ProgramSpecified,
            hints.position.0,
            hints.position.1,
        ));
        wm_hints.size = Some((
            WmSizeHintsSpecification::ProgramSpecified,
            width as i32,
            height as i32,
        ));
        wm_hints.min_size = Some((min_width as i32, min_height as i32));
        wm_hints.max_size = Some((max_width as i32, max_height as i32));
        wm_hints.set_normal_hints(&self.conn, window)?;
        Ok(())
    }

    fn set_title(&self, window: Xid, title: &str) -> Result<()> {
        self.conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            title.as_bytes(),
        )?;
        Ok(())
    }

    fn configure_window(&self, window: Xid, values: &ConfigureWindowAux) -> Result<()> {
        self.conn.configure_window(window, values)?;
        Ok(())
    }

    fn map_window(&self, window: Xid) -> Result<()> {
        self.conn.map_window(window)?;
        Ok(())
    }

    fn create_pixmap(
        &self,
        depth: u8,
        pixmap: Xid,
        drawable: Xid,
        width: u16,
        height: u16,
    ) -> Result<()> {
        self.conn
            .create_pixmap(depth, pixmap, drawable, width, height)?;
        Ok(())
    }

    fn free_pixmap(&self, pixmap: Xid) -> Result<()> {
        self.conn.free_pixmap(pixmap)?;
        Ok(())
    }

    fn create_cursor(&self, cursor: Xid, pixmap: Xid) -> Result<()> {
        self.conn
            .create_cursor(cursor, pixmap, pixmap, 0, 0, 0, 0, 0, 0, 1, 1)?;
        Ok(())
    }

    fn free_cursor(&self, cursor: Xid) -> Result<()> {
        self.conn.free_cursor(cursor)?;
        Ok(())
    }

    fn set_window_cursor(&self, window: Xid, cursor: Xid) -> Result<()> {
        self.conn.change_window_attributes(
            window,
            &ChangeWindowAttributesAux::new().cursor(cursor),
        )?;
        Ok(())
    }

    fn shm_attach(&self, seg: Xid, shmid: u32) -> Result<()> {
        self.conn.shm_attach(seg, shmid, false)?.check()?;
        Ok(())
    }

    fn shm_detach(&self, seg: Xid) -> Result<()> {
        self.conn.shm_detach(seg)?;
        Ok(())
    }

    fn shm_put_image(
        &self,
        window: Xid,
        gc: Xid,
        layout: &ImageLayout,
        rect: Rect,
        seg: Xid,
    ) -> Result<()> {
        self.conn.shm_put_image(
            window,
            gc,
            layout.width,
            layout.height,
            rect.x,
            rect.y,
            rect.width,
            rect.height,
            rect.x as i16,
            rect.y as i16,
            layout.depth,
            ImageFormat::Z_PIXMAP.into(),
            false,
            seg,
            0,
        )?;
        Ok(())
    }

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
    ) -> Result<()> {
        self.conn.put_image(
            ImageFormat::Z_PIXMAP,
            window,
            gc,
            width,
            height,
            dst_x,
            dst_y,
            0,
            depth,
            data,
        )?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.conn.get_input_focus()?.reply()?;
        Ok(())
    }

    fn poll_for_event(&self) -> Result<Option<HostEvent>> {
        Ok(self.conn.poll_for_event()?.map(translate))
    }

    fn wait_for_event(&self, timeout: Option<Duration>) -> Result<Option<HostEvent>> {
        let Some(timeout) = timeout else {
            return Ok(Some(translate(self.conn.wait_for_event()?)));
        };

        self.conn.flush()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.conn.poll_for_event()? {
                return Ok(Some(translate(event)));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.wait_readable(remaining)? {
                return Ok(None);
            }
        }
    }

    fn keyboard_mapping(&self, first_keycode: u8, count: u8) -> Result<KeyboardMappingReply> {
        let reply = self
            .conn
            .get_keyboard_mapping(first_keycode, count)?
            .reply()?;
        Ok(KeyboardMappingReply {
            keysyms_per_keycode: reply.keysyms_per_keycode,
            keysyms: reply.keysyms,
        })
    }

    fn modifier_mapping(&self) -> Result<Vec<u8>> {
        Ok(self.conn.get_modifier_mapping()?.reply()?.keycodes)
    }

    fn keyboard_control(&self) -> Result<CoreKeyboardControl> {
        let reply = self.conn.get_keyboard_control()?.reply()?;
        Ok(CoreKeyboardControl {
            global_auto_repeat: reply.global_auto_repeat == AutoRepeatMode::ON,
            auto_repeats: reply.auto_repeats,
            led_mask: reply.led_mask,
            key_click_percent: reply.key_click_percent,
            bell_percent: reply.bell_percent,
            bell_pitch: reply.bell_pitch,
            bell_duration: reply.bell_duration,
        })
    }

    fn xkb_controls(&self) -> Result<Option<XkbControls>> {
        let reply = match self.conn.xkb_get_controls(CORE_KEYBOARD)?.reply() {
            Ok(reply) => reply,
            Err(x11rb::errors::ReplyError::X11Error(err)) => {
                debug!("no XKB controls for the core keyboard: {:?}", err.error_kind);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Some(XkbControls {
            device_id: reply.device_id,
            num_groups: reply.num_groups,
            repeat_delay: reply.repeat_delay,
            repeat_interval: reply.repeat_interval,
            slow_keys_delay: reply.slow_keys_delay,
            debounce_delay: reply.debounce_delay,
            mouse_keys_default_button: reply.mouse_keys_dflt_btn,
            mouse_keys_delay: reply.mouse_keys_delay,
            mouse_keys_interval: reply.mouse_keys_interval,
            mouse_keys_time_to_max: reply.mouse_keys_time_to_max,
            mouse_keys_max_speed: reply.mouse_keys_max_speed,
            mouse_keys_curve: reply.mouse_keys_curve,
            access_x_timeout: reply.access_x_timeout,
            enabled_controls: u32::from(reply.enabled_controls),
            per_key_repeat: reply.per_key_repeat,
        }))
    }

    fn xkb_geometry(&self) -> Result<Option<XkbGeometry>> {
        let reply = match self
            .conn
            .xkb_get_names(CORE_KEYBOARD, xkb::NameDetail::GEOMETRY)?
            .reply()
        {
            Ok(reply) => reply,
            Err(x11rb::errors::ReplyError::X11Error(err)) => {
                debug!("no XKB names for the core keyboard: {:?}", err.error_kind);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        // a zero atom means the keyboard has no geometry
        Ok(reply
            .value_list
            .geometry_name
            .filter(|&name| name != x11rb::NONE)
            .map(|name| XkbGeometry { name }))
    }
}
