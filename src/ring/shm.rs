// Shared-memory ring buffer for the multi-process mode.
//
// The layout below is part of the public protocol between the server,
// aggregator and recorder binaries: field order, widths and the 64-byte
// alignment of every control field and slot are ABI, not incidental. The
// slot publish/read protocol is identical to the in-process ring.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::error::{ReplayError, Result};
use crate::message::{Msg, SeqNum};
use crate::ring::buffer::{ReadStatus, Slot, CACHE_LINE_SIZE};

/// Name of the POSIX shared-memory object.
pub const SHM_NAME: &str = "/mktdata_rb";

/// Slot count of the shared ring. Compile-time constant because all three
/// binaries must agree on the mapped size; deliberately smaller than the
/// in-process default.
pub const SHM_SLOT_COUNT: usize = 64 * 1024;

const _: () = assert!(SHM_SLOT_COUNT.is_power_of_two());

/// Pads a control field to a full cache line so the producer's write cursor
/// does not bounce against the shutdown flag or the message counter.
#[repr(C, align(64))]
struct Aligned64<T>(T);

const _: () = assert!(std::mem::size_of::<Aligned64<AtomicI64>>() == CACHE_LINE_SIZE);
const _: () = assert!(std::mem::size_of::<Aligned64<AtomicBool>>() == CACHE_LINE_SIZE);

/// The mapped region: three control fields followed by the slot array.
#[repr(C)]
struct ShmRingLayout {
    /// Next sequence to assign; advanced only by the server.
    write_seq: Aligned64<AtomicI64>,
    /// Graceful-shutdown signal: cleared by the server when it is done.
    server_running: Aligned64<AtomicBool>,
    /// Total messages pushed by the server.
    total_messages: Aligned64<AtomicI64>,
    slots: [Slot; SHM_SLOT_COUNT],
}

const _: () = assert!(
    std::mem::size_of::<ShmRingLayout>() == (3 + SHM_SLOT_COUNT) * CACHE_LINE_SIZE
);

/// Handle to the shared ring: the server creates and initialises it, the
/// consumer processes attach. Unlinked by the creating side on drop.
pub struct ShmRing {
    region: ShmRegion,
}

impl ShmRing {
    /// Create, size and initialise the shared-memory object. Any stale
    /// object with the same name is unlinked first.
    pub fn create() -> Result<Self> {
        let region = ShmRegion::create(SHM_NAME, std::mem::size_of::<ShmRingLayout>())?;
        let ring = Self { region };
        ring.init();
        Ok(ring)
    }

    /// Attach to an existing shared-memory object created by the server.
    pub fn attach() -> Result<Self> {
        let region = ShmRegion::attach(SHM_NAME, std::mem::size_of::<ShmRingLayout>())?;
        Ok(Self { region })
    }

    /// Attach, retrying while the server has not created the object yet.
    /// `cancelled` is polled between attempts so Ctrl-C aborts the wait.
    pub fn attach_with_retry(
        max_retries: u32,
        interval: std::time::Duration,
        cancelled: impl Fn() -> bool,
    ) -> Result<Self> {
        let mut last_err = None;
        for attempt in 1..=max_retries {
            if cancelled() {
                break;
            }
            match Self::attach() {
                Ok(ring) => return Ok(ring),
                Err(e) => {
                    tracing::info!(attempt, max_retries, "waiting for server to start");
                    last_err = Some(e);
                    std::thread::sleep(interval);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ReplayError::SharedMemory {
            name: SHM_NAME.to_string(),
            reason: "attach cancelled".to_string(),
        }))
    }

    fn layout(&self) -> &ShmRingLayout {
        // The region is exactly sizeof(ShmRingLayout) bytes, page-aligned by
        // mmap, and every field is either atomic or seqlock-protected.
        unsafe { &*(self.region.as_ptr() as *const ShmRingLayout) }
    }

    fn init(&self) {
        let layout = self.layout();
        layout.write_seq.0.store(0, Ordering::Relaxed);
        layout.server_running.0.store(true, Ordering::Relaxed);
        layout.total_messages.0.store(0, Ordering::Relaxed);
        for slot in &layout.slots {
            slot.clear();
        }
    }

    /// Publish one message; server side only. Same non-blocking overwrite
    /// policy as the in-process ring.
    pub fn push(&self, msg: Msg) -> SeqNum {
        let layout = self.layout();
        let seq = layout.write_seq.0.fetch_add(1, Ordering::Relaxed);
        layout.slots[seq as usize & (SHM_SLOT_COUNT - 1)].publish(msg, seq);
        layout.total_messages.0.fetch_add(1, Ordering::Release);
        seq
    }

    /// Seqlock read at `expected_seq` with explicit status.
    pub fn read(&self, expected_seq: SeqNum) -> ReadStatus {
        if expected_seq < 0 {
            return ReadStatus::NotReady;
        }
        self.layout().slots[expected_seq as usize & (SHM_SLOT_COUNT - 1)].read(expected_seq)
    }

    pub fn latest_seq(&self) -> SeqNum {
        self.layout().write_seq.0.load(Ordering::Acquire) - 1
    }

    pub fn total_messages(&self) -> i64 {
        self.layout().total_messages.0.load(Ordering::Acquire)
    }

    pub fn server_running(&self) -> bool {
        self.layout().server_running.0.load(Ordering::Acquire)
    }

    /// Flip the shutdown signal; consumers drain to the latest sequence and
    /// exit once this is false.
    pub fn set_server_running(&self, running: bool) {
        self.layout().server_running.0.store(running, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        SHM_SLOT_COUNT
    }
}

/// Thin RAII wrapper over a named POSIX shared-memory mapping.
#[cfg(target_os = "linux")]
struct ShmRegion {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
    fd: std::os::unix::io::RawFd,
    name: &'static str,
    /// The creating side unlinks the object on drop.
    owner: bool,
}

#[cfg(target_os = "linux")]
unsafe impl Send for ShmRegion {}
#[cfg(target_os = "linux")]
unsafe impl Sync for ShmRegion {}

#[cfg(target_os = "linux")]
impl ShmRegion {
    fn create(name: &'static str, len: usize) -> Result<Self> {
        let c_name = std::ffi::CString::new(name).expect("shm name contains NUL");

        // Remove any leftover object from a previous run.
        unsafe { libc::shm_unlink(c_name.as_ptr()) };

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(Self::os_error(name, "shm_open"));
        }

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = Self::os_error(name, "ftruncate");
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        let ptr = Self::map(fd, len, name)?;
        Ok(Self {
            ptr,
            len,
            fd,
            name,
            owner: true,
        })
    }

    fn attach(name: &'static str, len: usize) -> Result<Self> {
        let c_name = std::ffi::CString::new(name).expect("shm name contains NUL");

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(Self::os_error(name, "shm_open"));
        }

        let ptr = match Self::map(fd, len, name) {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };
        Ok(Self {
            ptr,
            len,
            fd,
            name,
            owner: false,
        })
    }

    fn map(fd: std::os::unix::io::RawFd, len: usize, name: &str) -> Result<std::ptr::NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Self::os_error(name, "mmap"));
        }
        Ok(std::ptr::NonNull::new(ptr as *mut u8).expect("mmap returned null"))
    }

    fn os_error(name: &str, op: &str) -> ReplayError {
        ReplayError::SharedMemory {
            name: name.to_string(),
            reason: format!("{op} failed: {}", std::io::Error::last_os_error()),
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

#[cfg(target_os = "linux")]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            libc::close(self.fd);
            if self.owner {
                if let Ok(c_name) = std::ffi::CString::new(self.name) {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
struct ShmRegion;

#[cfg(not(target_os = "linux"))]
impl ShmRegion {
    fn create(name: &'static str, _len: usize) -> Result<Self> {
        Err(Self::unsupported(name))
    }

    fn attach(name: &'static str, _len: usize) -> Result<Self> {
        Err(Self::unsupported(name))
    }

    fn as_ptr(&self) -> *mut u8 {
        unreachable!("shared memory is never constructed on this platform")
    }

    fn unsupported(name: &str) -> ReplayError {
        ReplayError::SharedMemory {
            name: name.to_string(),
            reason: "POSIX shared memory is only supported on Linux".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn control_fields_sit_on_separate_cache_lines() {
        assert_eq!(offset_of!(ShmRingLayout, write_seq), 0);
        assert_eq!(offset_of!(ShmRingLayout, server_running), CACHE_LINE_SIZE);
        assert_eq!(offset_of!(ShmRingLayout, total_messages), 2 * CACHE_LINE_SIZE);
        assert_eq!(offset_of!(ShmRingLayout, slots), 3 * CACHE_LINE_SIZE);
    }

    #[test]
    fn mapped_size_is_header_plus_slots() {
        assert_eq!(
            std::mem::size_of::<ShmRingLayout>(),
            3 * CACHE_LINE_SIZE + SHM_SLOT_COUNT * CACHE_LINE_SIZE
        );
    }
}
