//! x11nest - nested screen demo
//!
//! Opens a nested screen on the host display, paints a test pattern into
//! its framebuffer and logs the input the host sends to it.
//!
//! ```text
//! x11nest check --display :0      → exit status tells whether :0 answers
//! x11nest run --size 800x600      → window titled "Screen 0"
//! ```

use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};
use x11nest::{check_display, valid_depth, InputSink, ScreenConfig, Session, VisualMasks};

#[derive(Parser)]
#[command(name = "x11nest")]
#[command(about = "Guest screen in a window on a host X server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the host display can be opened
    Check {
        /// Host display (defaults to $DISPLAY)
        #[arg(short, long)]
        display: Option<String>,
    },

    /// Open a nested screen and run until interrupted
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Host display (defaults to $DISPLAY)
    #[arg(short, long)]
    display: Option<String>,

    /// Screen size as WIDTHxHEIGHT
    #[arg(short, long, default_value = "640x480", value_parser = parse_size)]
    size: (u16, u16),

    /// Window position on the host as X,Y
    #[arg(short, long, default_value = "0,0", value_parser = parse_origin)]
    origin: (i16, i16),

    /// Guest colour depth
    #[arg(long, default_value = "24")]
    depth: u8,

    /// Expected bits per pixel for the depth
    #[arg(long, default_value = "32")]
    bpp: u8,

    /// Guest screen number, shown in the window title
    #[arg(long, default_value = "0")]
    screen: u32,

    /// How long to wait for the window to appear; 0 waits forever
    #[arg(long, default_value = "5000")]
    expose_timeout_ms: u64,

    /// Seconds between test pattern updates
    #[arg(long, default_value = "1")]
    interval: u64,
}

impl RunArgs {
    fn screen_config(&self) -> ScreenConfig {
        let timeout = (self.expose_timeout_ms > 0)
            .then(|| Duration::from_millis(self.expose_timeout_ms));
        let mut config = ScreenConfig::new(self.size.0, self.size.1)
            .origin(self.origin.0, self.origin.1)
            .depth(self.depth, self.bpp)
            .screen_index(self.screen)
            .expose_timeout(timeout);
        if let Some(display) = &self.display {
            config = config.display(display.clone());
        }
        config
    }
}

fn parse_size(s: &str) -> Result<(u16, u16), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let w: u16 = w.parse().map_err(|e| format!("bad width: {e}"))?;
    let h: u16 = h.parse().map_err(|e| format!("bad height: {e}"))?;
    if w == 0 || h == 0 {
        return Err("size must be non-zero".into());
    }
    Ok((w, h))
}

fn parse_origin(s: &str) -> Result<(i16, i16), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y, got {s:?}"))?;
    let x = x.parse().map_err(|e| format!("bad x: {e}"))?;
    let y = y.parse().map_err(|e| format!("bad y: {e}"))?;
    Ok((x, y))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("x11nest=info".parse()?)
                .add_directive("x11rb=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { display } => {
            let target = display.as_deref();
            if !check_display(target) {
                bail!("cannot open host display {}", target.unwrap_or("$DISPLAY"));
            }
            println!("{} ok", target.unwrap_or("$DISPLAY"));
            Ok(())
        }
        Commands::Run(args) => {
            // the session is single-threaded and not Send
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to start runtime")?;
            runtime.block_on(run(args))
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    if !valid_depth(args.depth) {
        bail!("unsupported depth {}", args.depth);
    }

    let config = args.screen_config();
    let mut session = Session::create(&config).context("failed to create nested screen")?;

    let keyboard = session
        .keyboard_mappings()
        .context("failed to read host keyboard")?;
    info!(
        "host keyboard: keycodes {}..={}, {} keysyms per keycode, repeat {}ms/{}ms",
        keyboard.keysyms.min_keycode,
        keyboard.keysyms.max_keycode,
        keyboard.keysyms.map_width,
        keyboard.controls.xkb.repeat_delay,
        keyboard.controls.xkb.repeat_interval
    );

    let input = Rc::new(LoggingInput);
    session.set_input_route(&input);

    let mut phase = 0u8;
    paint(&mut session, phase);
    session.update_region(0, 0, i32::from(config.width), i32::from(config.height))?;

    let fd = AsyncFd::new(HostSocket(session.descriptor()))
        .context("failed to watch host connection")?;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    ticker.tick().await;

    loop {
        // drain whatever is queued before waiting on the socket again
        let drained = session.check_events()?;
        if drained > 0 {
            debug!(drained, "processed host events");
        }

        tokio::select! {
            guard = fd.readable() => {
                guard.context("host connection failed")?.clear_ready();
            }
            _ = ticker.tick() => {
                phase = phase.wrapping_add(16);
                paint(&mut session, phase);
                session.update_region(0, 0, i32::from(config.width), i32::from(config.height))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    drop(fd);
    session.close();
    Ok(())
}

/// The session's host socket, registered for readiness only. The session
/// owns the descriptor and must outlive this.
struct HostSocket(RawFd);

impl AsRawFd for HostSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Guest input device stand-in that logs what it receives
struct LoggingInput;

impl InputSink for LoggingInput {
    fn post_motion(&self, x: i32, y: i32) {
        debug!(x, y, "motion");
    }

    fn post_button(&self, button: u8, is_down: bool) {
        info!(button, is_down, "button");
    }

    fn post_key(&self, keycode: u8, is_down: bool) {
        info!(keycode, is_down, "key");
    }
}

/// Scales an 8-bit channel into `mask`.
fn channel(value: u8, mask: u32) -> u32 {
    if mask == 0 {
        return 0;
    }
    let bits = mask.count_ones();
    let scaled = if bits >= 8 {
        u32::from(value) << (bits - 8)
    } else {
        u32::from(value) >> (8 - bits)
    };
    (scaled << mask.trailing_zeros()) & mask
}

fn pixel(masks: VisualMasks, r: u8, g: u8, b: u8) -> u32 {
    channel(r, masks.red) | channel(g, masks.green) | channel(b, masks.blue)
}

/// Horizontal red ramp, vertical green ramp, blue cycling with `phase`.
fn paint(session: &mut Session, phase: u8) {
    let masks = session.masks();
    let fb = session.framebuffer_mut();
    let (width, height) = (usize::from(fb.width()), usize::from(fb.height()));
    let bytes_per_pixel = usize::from(fb.bits_per_pixel()) / 8;
    let stride = fb.stride();

    // sub-byte depths get a blank screen
    if bytes_per_pixel == 0 {
        fb.data_mut().fill(0);
        return;
    }

    let data = fb.data_mut();
    for y in 0..height {
        let g = (y * 255 / height.max(1)) as u8;
        let row = &mut data[y * stride..y * stride + width * bytes_per_pixel];
        for (x, px) in row.chunks_exact_mut(bytes_per_pixel).enumerate() {
            let r = (x * 255 / width.max(1)) as u8;
            let value = pixel(masks, r, g, phase).to_ne_bytes();
            px.copy_from_slice(&value[..bytes_per_pixel]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_socket_exposes_the_session_descriptor() {
        assert_eq!(HostSocket(7).as_raw_fd(), 7);
    }

    #[test]
    fn size_and_origin_parse() {
        assert_eq!(parse_size("800x600"), Ok((800, 600)));
        assert!(parse_size("800").is_err());
        assert!(parse_size("0x600").is_err());
        assert_eq!(parse_origin("-10,20"), Ok((-10, 20)));
        assert!(parse_origin("10").is_err());
    }

    #[test]
    fn channels_follow_the_visual_masks() {
        let rgb888 = VisualMasks {
            red: 0xff0000,
            green: 0x00ff00,
            blue: 0x0000ff,
        };
        assert_eq!(pixel(rgb888, 0x12, 0x34, 0x56), 0x123456);

        let rgb565 = VisualMasks {
            red: 0xf800,
            green: 0x07e0,
            blue: 0x001f,
        };
        assert_eq!(pixel(rgb565, 0xff, 0xff, 0xff), 0xffff);
        assert_eq!(pixel(rgb565, 0xff, 0, 0), 0xf800);
    }
}
