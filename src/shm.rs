//! SysV shared memory segments for the MIT-SHM image path

use std::io;
use std::ptr::{self, NonNull};
use std::slice;

use tracing::debug;

/// Process-side mapping of a segment the host can attach by id.
pub trait ShmSegment {
    fn shmid(&self) -> u32;
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
    /// Destroys the segment once every attachment is gone. The mapping stays
    /// valid; no new attachments are possible.
    fn mark_removed(&mut self) -> io::Result<()>;
}

pub trait ShmAllocator {
    fn allocate(&self, len: usize) -> io::Result<Box<dyn ShmSegment>>;
}

/// Allocates private SysV segments readable and writable by the owner only.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysvAllocator;

impl ShmAllocator for SysvAllocator {
    fn allocate(&self, len: usize) -> io::Result<Box<dyn ShmSegment>> {
        // SAFETY: shmget only creates a kernel object; no memory is touched.
        let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600) };
        if shmid == -1 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: attaching the segment created above; failure is (void *)-1.
        let addr = unsafe { libc::shmat(shmid, ptr::null(), 0) };
        if addr == (-1isize) as *mut libc::c_void {
            let err = io::Error::last_os_error();
            // SAFETY: removing the segment we own and never mapped.
            unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };
            return Err(err);
        }
        let addr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "shmat returned null"))?;

        debug!(shmid, len, "allocated shared memory segment");
        Ok(Box::new(SysvSegment {
            shmid,
            addr,
            len,
            removed: false,
        }))
    }
}

#[derive(Debug)]
pub struct SysvSegment {
    shmid: i32,
    addr: NonNull<u8>,
    len: usize,
    removed: bool,
}

impl ShmSegment for SysvSegment {
    fn shmid(&self) -> u32 {
        self.shmid as u32
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: addr maps at least len bytes until drop detaches it.
        unsafe { slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self makes this the only process-side view.
        unsafe { slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }

    fn mark_removed(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        // SAFETY: shmid names a segment we created and still own.
        if unsafe { libc::shmctl(self.shmid, libc::IPC_RMID, ptr::null_mut()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        self.removed = true;
        Ok(())
    }
}

impl Drop for SysvSegment {
    fn drop(&mut self) {
        // SAFETY: addr came from a successful shmat and is detached once.
        // The segment is destroyed after the last attachment (ours or the
        // host's) goes away.
        unsafe {
            libc::shmdt(self.addr.as_ptr() as *const libc::c_void);
            if !self.removed {
                libc::shmctl(self.shmid, libc::IPC_RMID, ptr::null_mut());
            }
        }
        debug!(shmid = self.shmid, "released shared memory segment");
    }
}
