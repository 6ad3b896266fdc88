//! The host window presenting the guest framebuffer

use tracing::{debug, warn};
use x11rb::protocol::xproto::{ConfigureWindowAux, EventMask};

use crate::config::ScreenConfig;
use crate::error::Result;
use crate::framebuffer::Framebuffer;
use crate::host::{HostConnection, Rect, SizeHints, Xid};

/// Host events the nested window listens for
pub fn window_events() -> EventMask {
    EventMask::EXPOSURE
        | EventMask::POINTER_MOTION
        | EventMask::ENTER_WINDOW
        | EventMask::LEAVE_WINDOW
        | EventMask::BUTTON_PRESS
        | EventMask::BUTTON_RELEASE
        | EventMask::KEY_PRESS
        | EventMask::KEY_RELEASE
}

// PutImage request header, in bytes
const PUT_IMAGE_HEADER: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Default,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostWindow {
    id: Xid,
    x: i16,
    y: i16,
    width: u16,
    height: u16,
    title: String,
    cursor: CursorState,
}

impl HostWindow {
    /// Creates, titles and maps the window, then moves it to the configured
    /// origin. The size cannot be changed by the window manager.
    pub fn create<H: HostConnection + ?Sized>(
        host: &H,
        root: Xid,
        config: &ScreenConfig,
    ) -> Result<Self> {
        let id = host.generate_id()?;
        host.create_window(id, root, window_events())?;

        let window = Self {
            id,
            x: config.origin_x,
            y: config.origin_y,
            width: config.width,
            height: config.height,
            title: format!("Screen {}", config.screen_index),
            cursor: CursorState::Default,
        };

        if let Err(err) = window.configure_and_map(host) {
            window.destroy(host);
            return Err(err);
        }
        Ok(window)
    }

    fn configure_and_map<H: HostConnection + ?Sized>(&self, host: &H) -> Result<()> {
        host.set_size_hints(
            self.id,
            &SizeHints::fixed(
                self.x.into(),
                self.y.into(),
                self.width.into(),
                self.height.into(),
            ),
        )?;
        host.set_title(self.id, &self.title)?;

        host.configure_window(
            self.id,
            &ConfigureWindowAux::new()
                .width(u32::from(self.width))
                .height(u32::from(self.height)),
        )?;
        host.map_window(self.id)?;
        // window managers tend to place a freshly mapped window themselves
        host.configure_window(
            self.id,
            &ConfigureWindowAux::new()
                .x(i32::from(self.x))
                .y(i32::from(self.y)),
        )?;
        Ok(())
    }

    /// Installs an invisible cursor so only the guest's cursor is drawn.
    pub fn hide_cursor<H: HostConnection + ?Sized>(&mut self, host: &H) -> Result<()> {
        let pixmap = host.generate_id()?;
        host.create_pixmap(1, pixmap, self.id, 1, 1)?;

        let cursor = host.generate_id()?;
        let installed = host.create_cursor(cursor, pixmap).and_then(|_| {
            let installed = host.set_window_cursor(self.id, cursor);
            // the window keeps its own reference to the cursor
            host.free_cursor(cursor)?;
            installed
        });
        host.free_pixmap(pixmap)?;
        installed?;

        self.cursor = CursorState::Hidden;
        Ok(())
    }

    /// Copies `[x1, x2) x [y1, y2)` of `framebuffer` to the same place in the
    /// window and waits until the host has processed it.
    #[allow(clippy::too_many_arguments)]
    pub fn update_region<H: HostConnection + ?Sized>(
        &self,
        host: &H,
        gc: Xid,
        framebuffer: &Framebuffer,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
    ) -> Result<()> {
        let Some(rect) = clip(framebuffer, x1, y1, x2, y2) else {
            return Ok(());
        };

        match framebuffer.shm_segment() {
            Some(seg) => host.shm_put_image(self.id, gc, framebuffer.layout(), rect, seg)?,
            None => self.put_copy(host, gc, framebuffer, rect)?,
        }

        host.sync()
    }

    /// Sends the rectangle through the socket, in bands that fit one request.
    fn put_copy<H: HostConnection + ?Sized>(
        &self,
        host: &H,
        gc: Xid,
        framebuffer: &Framebuffer,
        rect: Rect,
    ) -> Result<()> {
        let layout = framebuffer.layout();
        let bits_per_pixel = usize::from(layout.bits_per_pixel);

        // sub-byte pixels are sent as whole rows
        let rect = if bits_per_pixel % 8 == 0 {
            rect
        } else {
            Rect {
                x: 0,
                width: layout.width,
                ..rect
            }
        };

        let row_bytes = layout.row_bytes(rect.width);
        let copy_bytes = (usize::from(rect.width) * bits_per_pixel).div_ceil(8);
        let first_byte = usize::from(rect.x) * bits_per_pixel / 8;
        let rows_per_band = (host.maximum_request_bytes().saturating_sub(PUT_IMAGE_HEADER)
            / row_bytes)
            .clamp(1, usize::from(u16::MAX));

        let data = framebuffer.data();
        let mut band = Vec::with_capacity(row_bytes * rows_per_band.min(usize::from(rect.height)));
        let mut row = usize::from(rect.y);
        let end = row + usize::from(rect.height);

        while row < end {
            let rows = rows_per_band.min(end - row);
            band.clear();
            for r in row..row + rows {
                let start = r * layout.stride + first_byte;
                band.extend_from_slice(&data[start..start + copy_bytes]);
                band.resize(band.len() + row_bytes - copy_bytes, 0);
            }

            host.put_image(
                self.id,
                gc,
                rect.width,
                rows as u16,
                rect.x as i16,
                row as i16,
                layout.depth,
                &band,
            )?;
            row += rows;
        }

        debug!(?rect, "sent framebuffer region without shared memory");
        Ok(())
    }

    pub(crate) fn destroy<H: HostConnection + ?Sized>(&self, host: &H) {
        if let Err(err) = host.destroy_window(self.id) {
            warn!("failed to destroy window {:#x}: {}", self.id, err);
        }
    }

    pub fn id(&self) -> Xid {
        self.id
    }

    pub fn origin(&self) -> (i16, i16) {
        (self.x, self.y)
    }

    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn cursor(&self) -> CursorState {
        self.cursor
    }
}

/// Intersects the region with the framebuffer; `None` when nothing is left.
fn clip(framebuffer: &Framebuffer, x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Rect> {
    let width = i32::from(framebuffer.width());
    let height = i32::from(framebuffer.height());
    let (x1, x2) = (x1.clamp(0, width), x2.clamp(0, width));
    let (y1, y2) = (y1.clamp(0, height), y2.clamp(0, height));

    let rect = Rect {
        x: x1 as u16,
        y: y1 as u16,
        width: (x2 - x1).max(0) as u16,
        height: (y2 - y1).max(0) as u16,
    };
    (!rect.is_empty()).then_some(rect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDisplay, Request};

    fn config() -> ScreenConfig {
        ScreenConfig::new(320, 200).origin(10, 20).screen_index(2)
    }

    #[test]
    fn create_resizes_maps_then_moves() {
        let display = MockDisplay::new();
        let host = display.connect();
        let window = HostWindow::create(&host, host.setup().root, &config()).unwrap();

        assert_eq!(window.title(), "Screen 2");
        assert_eq!(window.size(), (320, 200));
        assert_eq!(window.origin(), (10, 20));

        let wanted = EventMask::EXPOSURE
            | EventMask::POINTER_MOTION
            | EventMask::ENTER_WINDOW
            | EventMask::LEAVE_WINDOW
            | EventMask::BUTTON_PRESS
            | EventMask::BUTTON_RELEASE
            | EventMask::KEY_PRESS
            | EventMask::KEY_RELEASE;
        assert_eq!(
            display.requests()[0],
            Request::CreateWindow {
                window: window.id(),
                parent: host.setup().root,
                event_mask: u32::from(wanted),
            }
        );

        let requests: Vec<_> = display
            .requests()
            .into_iter()
            .filter(|r| {
                matches!(
                    r,
                    Request::Configure { .. } | Request::MapWindow(_) | Request::SizeHints { .. }
                )
            })
            .collect();
        assert_eq!(
            requests,
            vec![
                Request::SizeHints {
                    window: window.id(),
                    hints: SizeHints::fixed(10, 20, 320, 200),
                },
                Request::Configure {
                    window: window.id(),
                    x: None,
                    y: None,
                    width: Some(320),
                    height: Some(200),
                },
                Request::MapWindow(window.id()),
                Request::Configure {
                    window: window.id(),
                    x: Some(10),
                    y: Some(20),
                    width: None,
                    height: None,
                },
            ]
        );
    }

    #[test]
    fn hide_cursor_frees_temporaries() {
        let display = MockDisplay::new();
        let host = display.connect();
        let mut window = HostWindow::create(&host, host.setup().root, &config()).unwrap();
        window.hide_cursor(&host).unwrap();

        assert_eq!(window.cursor(), CursorState::Hidden);
        let ledger = display.ledger();
        assert_eq!(ledger.pixmaps.created(), 1);
        assert_eq!(ledger.pixmaps.freed(), 1);
        assert_eq!(ledger.cursors.created(), 1);
        assert_eq!(ledger.cursors.freed(), 1);
        assert!(display
            .requests()
            .contains(&Request::SetCursor(window.id(), display.last_cursor().unwrap())));
    }

    #[test]
    fn clip_keeps_regions_inside_the_framebuffer() {
        let display = MockDisplay::new();
        let host = display.connect();
        let allocator = display.allocator();
        let fb = Framebuffer::acquire(&host, &allocator, 100, 50, 24).unwrap();

        assert_eq!(
            clip(&fb, -5, 10, 20, 80),
            Some(Rect {
                x: 0,
                y: 10,
                width: 20,
                height: 40
            })
        );
        assert_eq!(clip(&fb, 30, 30, 30, 40), None);
        assert_eq!(clip(&fb, 40, 10, 20, 20), None);
    }

    #[test]
    fn copy_path_splits_large_regions_into_bands() {
        let display = MockDisplay::builder()
            .without_shm()
            .maximum_request_bytes(PUT_IMAGE_HEADER + 4 * 16 * 3)
            .build();
        let host = display.connect();
        let allocator = display.allocator();
        let fb = Framebuffer::acquire(&host, &allocator, 16, 10, 24).unwrap();
        let window = HostWindow::create(&host, host.setup().root, &config()).unwrap();

        window.update_region(&host, 1, &fb, 0, 0, 16, 10).unwrap();

        let puts: Vec<_> = display
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::PutImage { y, height, .. } => Some((y, height)),
                _ => None,
            })
            .collect();
        assert_eq!(puts, vec![(0, 3), (3, 3), (6, 3), (9, 1)]);
        assert_eq!(display.requests().last(), Some(&Request::Sync));
    }
}
