//! x11nest - a guest display server's screen, shown in a window on a host X server
//!
//! The guest renders into a [`Framebuffer`] laid out exactly like the host's
//! native image format for the chosen depth, shared with the host through
//! MIT-SHM when it can be and a private heap block when it can't. The
//! guest tells the session which region changed and the session copies it
//! to the host window. Host pointer and keyboard events are forwarded to the
//! guest input device once it has registered with the session.
//!
//! ```text
//! guest renders ─► Framebuffer ─► update_region ─► host window
//! host events ─► check_events ─► InputSink (guest input device)
//! ```
//!
//! Everything runs on the caller's thread: poll [`Session::descriptor`] and
//! call [`Session::check_events`] whenever it is readable.

pub mod bridge;
pub mod config;
pub mod error;
pub mod framebuffer;
pub mod host;
pub mod keyboard;
pub mod mock;
pub mod session;
pub mod shm;
pub mod window;
pub mod x11;

pub use bridge::{InputRoute, InputSink};
pub use config::ScreenConfig;
pub use error::{Error, Result};
pub use framebuffer::{BackingKind, Framebuffer, ImageLayout};
pub use host::{HostConnection, HostEvent, VisualMasks};
pub use keyboard::KeyboardMappings;
pub use session::{Capabilities, Session};
pub use x11::{check_display, X11Host};

/// Whether the guest may use `depth`. Every depth is accepted; an unusable
/// one fails later, when the framebuffer is acquired.
pub fn valid_depth(_depth: u8) -> bool {
    true
}
