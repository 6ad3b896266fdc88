//! Guest framebuffer backed by MIT-SHM or a private heap block
//!
//! The pixel memory is laid out exactly like a host Z-pixmap image of the
//! requested depth, so it can be pushed to the host window without
//! conversion. Shared memory saves a copy through the socket on every
//! update; when any step of negotiating it fails we fall back to a heap
//! block with the same layout.

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::host::{Extension, HostConnection, PixmapFormat, ShmVersion, Xid};
use crate::shm::{ShmAllocator, ShmSegment};

/// Geometry and pixel format of a Z-pixmap image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub width: u16,
    pub height: u16,
    pub depth: u8,
    pub bits_per_pixel: u8,
    pub scanline_pad: u8,
    /// Bytes per row, including padding
    pub stride: usize,
}

impl ImageLayout {
    /// Layout the host uses for images of `depth`.
    pub fn native(format: Option<PixmapFormat>, width: u16, height: u16, depth: u8) -> Result<Self> {
        let format = format.ok_or_else(|| {
            Error::Resource(format!("host has no pixmap format for depth {}", depth))
        })?;
        if width == 0 || height == 0 {
            return Err(Error::Resource(format!(
                "cannot create a {}x{} image",
                width, height
            )));
        }

        Ok(Self {
            width,
            height,
            depth,
            bits_per_pixel: format.bits_per_pixel,
            scanline_pad: format.scanline_pad,
            stride: padded_row_bytes(width, format.bits_per_pixel, format.scanline_pad),
        })
    }

    /// Padded length of a row `width` pixels wide.
    pub fn row_bytes(&self, width: u16) -> usize {
        padded_row_bytes(width, self.bits_per_pixel, self.scanline_pad)
    }

    pub fn len(&self) -> usize {
        self.stride * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn padded_row_bytes(width: u16, bits_per_pixel: u8, scanline_pad: u8) -> usize {
    let pad = usize::from(scanline_pad.max(8));
    let bits = usize::from(width) * usize::from(bits_per_pixel);
    bits.div_ceil(pad) * pad / 8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Shared,
    Private,
}

enum Backing {
    Shared {
        segment: Box<dyn ShmSegment>,
        seg: Xid,
        attached: bool,
    },
    Private(Vec<u8>),
}

pub struct Framebuffer {
    layout: ImageLayout,
    backing: Backing,
    shm_version: Option<ShmVersion>,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("layout", &self.layout)
            .field("kind", &self.kind())
            .field("shm_version", &self.shm_version)
            .finish()
    }
}

impl Framebuffer {
    /// Allocates the pixel memory for a `width`x`height` image of `depth`,
    /// preferring a segment shared with the host.
    pub fn acquire<H: HostConnection + ?Sized>(
        host: &H,
        allocator: &dyn ShmAllocator,
        width: u16,
        height: u16,
        depth: u8,
    ) -> Result<Self> {
        let shm_version = negotiate_shm(host);
        let layout = ImageLayout::native(host.setup().pixmap_format(depth), width, height, depth)
            .inspect_err(|err| error!("cannot create image: {}", err))?;

        let backing = match shm_version.and_then(|_| attach_segment(host, allocator, &layout)) {
            Some(backing) => backing,
            None => Backing::Private(heap_block(layout.len())?),
        };

        Ok(Self {
            layout,
            backing,
            shm_version,
        })
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    pub fn width(&self) -> u16 {
        self.layout.width
    }

    pub fn height(&self) -> u16 {
        self.layout.height
    }

    pub fn depth(&self) -> u8 {
        self.layout.depth
    }

    pub fn bits_per_pixel(&self) -> u8 {
        self.layout.bits_per_pixel
    }

    pub fn stride(&self) -> usize {
        self.layout.stride
    }

    pub fn kind(&self) -> BackingKind {
        match self.backing {
            Backing::Shared { .. } => BackingKind::Shared,
            Backing::Private(_) => BackingKind::Private,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.kind() == BackingKind::Shared
    }

    /// Version the host reported for MIT-SHM, if it was usable at all.
    pub fn shm_version(&self) -> Option<ShmVersion> {
        self.shm_version
    }

    /// Host id of the attached segment when the backing is shared.
    pub fn shm_segment(&self) -> Option<Xid> {
        match self.backing {
            Backing::Shared { seg, .. } => Some(seg),
            Backing::Private(_) => None,
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Shared { segment, .. } => &segment.as_slice()[..self.layout.len()],
            Backing::Private(block) => block,
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.layout.len();
        match &mut self.backing {
            Backing::Shared { segment, .. } => &mut segment.as_mut_slice()[..len],
            Backing::Private(block) => block,
        }
    }

    /// Raw pixel pointer for renderers that write the guest screen directly.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data_mut().as_mut_ptr()
    }

    /// Tells the host to let go of the shared segment. The memory itself is
    /// released when the framebuffer drops.
    pub(crate) fn detach<H: HostConnection + ?Sized>(&mut self, host: &H) {
        if let Backing::Shared { seg, attached, .. } = &mut self.backing {
            if *attached {
                if let Err(err) = host.shm_detach(*seg) {
                    warn!("failed to detach shared memory segment: {}", err);
                }
                *attached = false;
            }
        }
    }
}

/// Presence and version of MIT-SHM; `None` means fall back to the heap.
fn negotiate_shm<H: HostConnection + ?Sized>(host: &H) -> Option<ShmVersion> {
    match host.has_extension(Extension::SharedMemory) {
        Ok(true) => {}
        Ok(false) => {
            info!("XShm extension query failed. Dropping XShm support");
            return None;
        }
        Err(err) => {
            info!("XShm extension query failed ({}). Dropping XShm support", err);
            return None;
        }
    }

    match host.shm_query_version() {
        Ok(version) => {
            info!(
                "XShm extension version {}.{} {} shared pixmaps",
                version.major,
                version.minor,
                if version.shared_pixmaps { "with" } else { "without" }
            );
            Some(version)
        }
        Err(err) => {
            info!("XShm extension version query failed ({}). Dropping XShm support", err);
            None
        }
    }
}

fn attach_segment<H: HostConnection + ?Sized>(
    host: &H,
    allocator: &dyn ShmAllocator,
    layout: &ImageLayout,
) -> Option<Backing> {
    let mut segment = match allocator.allocate(layout.len()) {
        Ok(segment) => segment,
        Err(err) => {
            error!("shmget failed ({}). Dropping XShm support", err);
            return None;
        }
    };

    let seg = match host.generate_id() {
        Ok(seg) => seg,
        Err(err) => {
            error!("no id for shared memory segment ({}). Dropping XShm support", err);
            return None;
        }
    };

    // dropping the segment on failure releases it
    if let Err(err) = host.shm_attach(seg, segment.shmid()) {
        error!("host cannot attach shared memory ({}). Dropping XShm support", err);
        return None;
    }
    // both sides are attached, so the kernel frees it even if we crash
    if let Err(err) = segment.mark_removed() {
        warn!("cannot mark shared memory segment for removal: {}", err);
    }

    Some(Backing::Shared {
        segment,
        seg,
        attached: true,
    })
}

fn heap_block(len: usize) -> Result<Vec<u8>> {
    let mut block = Vec::new();
    block
        .try_reserve_exact(len)
        .map_err(|err| Error::Resource(format!("heap framebuffer of {} bytes: {}", len, err)))?;
    block.resize(len, 0);
    Ok(block)
}
