//! Parameters for creating a nested screen

use std::time::Duration;

/// How long screen creation waits for the window to be exposed by default
pub const DEFAULT_EXPOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenConfig {
    /// Guest screen number, used for the window title and diagnostics
    pub screen_index: u32,
    /// Host display name; `None` uses `$DISPLAY`
    pub display: Option<String>,
    pub width: u16,
    pub height: u16,
    pub origin_x: i16,
    pub origin_y: i16,
    pub depth: u8,
    pub bits_per_pixel: u8,
    /// Bound on the wait for the first exposure; `None` waits forever
    pub expose_timeout: Option<Duration>,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            screen_index: 0,
            display: None,
            width: 640,
            height: 480,
            origin_x: 0,
            origin_y: 0,
            depth: 24,
            bits_per_pixel: 32,
            expose_timeout: Some(DEFAULT_EXPOSE_TIMEOUT),
        }
    }
}

impl ScreenConfig {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn origin(mut self, x: i16, y: i16) -> Self {
        self.origin_x = x;
        self.origin_y = y;
        self
    }

    pub fn depth(mut self, depth: u8, bits_per_pixel: u8) -> Self {
        self.depth = depth;
        self.bits_per_pixel = bits_per_pixel;
        self
    }

    pub fn screen_index(mut self, index: u32) -> Self {
        self.screen_index = index;
        self
    }

    pub fn expose_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.expose_timeout = timeout;
        self
    }
}
