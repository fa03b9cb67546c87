//! Shared-memory buffer allocator.
//!
//! One pool is allocated per session, sized for exactly `N` frames, and carved
//! into fixed-size regions:
//!
//! ```text
//! offset 0          frame_size        2·frame_size             N·frame_size
//! ├─── buffer 0 ───┼─── buffer 1 ───┼─── … ───┼─── buffer N-1 ───┤
//! ```
//!
//! The pool memory stays mapped for CPU access for the allocator's lifetime.
//! Views handed out by [`BufferAllocator::mapped`] borrow the allocator, so
//! they cannot outlive it.

use tracing::debug;
use wlgrab_core::{CaptureError, DisplayInfo};

// ── Provider traits ───────────────────────────────────────────────────────────

/// A mapped shared-memory pool that can register protocol-visible buffers.
pub trait ShmPool {
    /// Protocol handle for one region of the pool (a `wl_buffer` on Wayland).
    type Buffer;

    /// Registers the region starting at `offset` as a buffer of the given
    /// geometry.
    fn create_buffer(&mut self, offset: usize, info: &DisplayInfo) -> Result<Self::Buffer, CaptureError>;

    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];
}

/// The OS/compositor facility that hands out shared-memory pools.
pub trait ShmProvider {
    type Pool: ShmPool;

    fn create_pool(&mut self, size: usize) -> Result<Self::Pool, CaptureError>;
}

// ── BufferAllocator ───────────────────────────────────────────────────────────

/// Handle to one buffer carved out of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

impl BufferId {
    pub fn index(self) -> usize {
        self.0
    }
}

struct Region<B> {
    offset: usize,
    len:    usize,
    buffer: B,
}

pub struct BufferAllocator<P: ShmPool> {
    pool:       P,
    frame_size: usize,
    capacity:   usize,
    regions:    Vec<Region<P::Buffer>>,
}

impl<P: ShmPool> BufferAllocator<P> {
    /// Requests a `total_size` pool from `provider`, to be split into
    /// `frame_size` regions.
    pub fn init<S>(total_size: usize, frame_size: usize, provider: &mut S) -> Result<Self, CaptureError>
    where
        S: ShmProvider<Pool = P>,
    {
        if frame_size == 0 || total_size < frame_size {
            return Err(CaptureError::allocation(format!(
                "pool of {total_size} bytes cannot hold a {frame_size}-byte frame"
            )));
        }
        let pool = provider.create_pool(total_size)?;
        if pool.memory().len() < total_size {
            return Err(CaptureError::allocation(format!(
                "provider mapped {} bytes, {total_size} requested",
                pool.memory().len()
            )));
        }
        let capacity = total_size / frame_size;
        debug!("Allocated shm pool: {} bytes, {} × {} byte buffers", total_size, capacity, frame_size);
        Ok(Self { pool, frame_size, capacity, regions: Vec::with_capacity(capacity) })
    }

    /// Carves the next region and registers it with the given geometry.
    pub fn create(&mut self, info: &DisplayInfo) -> Result<BufferId, CaptureError> {
        if self.regions.len() == self.capacity {
            return Err(CaptureError::PoolExhausted { capacity: self.capacity });
        }
        let len = info.frame_size();
        if len > self.frame_size {
            return Err(CaptureError::allocation(format!(
                "{len}-byte frame does not fit a {}-byte region",
                self.frame_size
            )));
        }
        let offset = self.regions.len() * self.frame_size;
        let buffer = self.pool.create_buffer(offset, info)?;
        self.regions.push(Region { offset, len, buffer });
        Ok(BufferId(self.regions.len() - 1))
    }

    pub fn buffer(&self, id: BufferId) -> &P::Buffer {
        &self.regions[id.0].buffer
    }

    /// Read view of a buffer's backing memory.
    pub fn mapped(&self, id: BufferId) -> &[u8] {
        let region = &self.regions[id.0];
        &self.pool.memory()[region.offset..region.offset + region.len]
    }

    /// Read/write view of a buffer's backing memory.
    pub fn mapped_mut(&mut self, id: BufferId) -> &mut [u8] {
        let region = &self.regions[id.0];
        let (offset, len) = (region.offset, region.len);
        &mut self.pool.memory_mut()[offset..offset + len]
    }

    /// Number of buffers the pool can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers created so far.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

// ── memfd-backed memory (Linux) ───────────────────────────────────────────────

#[cfg(target_os = "linux")]
pub use memfd::MappedMemory;

#[cfg(target_os = "linux")]
mod memfd {
    use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

    use wlgrab_core::CaptureError;

    /// Anonymous shared memory (`memfd_create`) mapped read/write.
    pub struct MappedMemory {
        fd:  OwnedFd,
        ptr: *mut u8,
        len: usize,
    }

    impl MappedMemory {
        pub fn new(len: usize) -> Result<Self, CaptureError> {
            if len == 0 {
                return Err(CaptureError::allocation("zero-length mapping"));
            }

            // SAFETY: the name is a NUL-terminated static string.
            let raw = unsafe {
                libc::memfd_create(
                    b"wlgrab-shm\0".as_ptr().cast(),
                    libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
                )
            };
            if raw < 0 {
                return Err(CaptureError::allocation(format!(
                    "memfd_create: {}",
                    std::io::Error::last_os_error()
                )));
            }
            // SAFETY: `raw` is a freshly created descriptor we exclusively own.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let size = libc::off_t::try_from(len)
                .map_err(|_| CaptureError::allocation(format!("{len} bytes exceeds off_t")))?;
            // SAFETY: valid descriptor.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } < 0 {
                return Err(CaptureError::allocation(format!(
                    "ftruncate: {}",
                    std::io::Error::last_os_error()
                )));
            }

            Self::map(fd, len)
        }

        /// A second read/write mapping of the same memory, as another process
        /// mapping the descriptor would see it.
        pub fn remap(&self) -> Result<Self, CaptureError> {
            let fd = self
                .fd
                .try_clone()
                .map_err(|e| CaptureError::allocation(format!("dup: {e}")))?;
            Self::map(fd, self.len)
        }

        fn map(fd: OwnedFd, len: usize) -> Result<Self, CaptureError> {
            // SAFETY: mapping a descriptor of exactly `len` bytes.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd.as_raw_fd(),
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(CaptureError::allocation(format!(
                    "mmap: {}",
                    std::io::Error::last_os_error()
                )));
            }

            Ok(Self { fd, ptr: ptr.cast(), len })
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        pub fn as_slice(&self) -> &[u8] {
            // SAFETY: `ptr` maps `len` bytes until drop.
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            // SAFETY: as above, and `&mut self` excludes other views.
            unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
        }

        /// Copies `src` into the mapping at `offset`, the way a compositor
        /// writes into a client buffer it was handed.
        ///
        /// Callers write only into regions the reading side is not
        /// viewing, i.e. slots with a request in flight.
        pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<(), CaptureError> {
            let end = offset.checked_add(src.len()).filter(|&end| end <= self.len);
            if end.is_none() {
                return Err(CaptureError::protocol(format!(
                    "{} bytes at offset {offset} overrun a {}-byte mapping",
                    src.len(),
                    self.len
                )));
            }
            // SAFETY: bounds checked above; `src` is ordinary process memory
            // and cannot overlap a MAP_SHARED region we created.
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len());
            }
            Ok(())
        }
    }

    impl AsFd for MappedMemory {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.fd.as_fd()
        }
    }

    impl Drop for MappedMemory {
        fn drop(&mut self) {
            // SAFETY: unmapping the region created in `new`.
            unsafe {
                libc::munmap(self.ptr.cast(), self.len);
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockShm;

    #[test]
    fn carves_fixed_regions_until_exhausted() {
        let info = DisplayInfo::packed(4, 2);
        let frame = info.frame_size();
        let mut shm = MockShm::default();
        let mut alloc = BufferAllocator::init(3 * frame, frame, &mut shm).unwrap();

        let ids: Vec<_> = (0..3).map(|_| alloc.create(&info).unwrap()).collect();
        assert_eq!(alloc.len(), 3);
        assert_eq!(alloc.buffer(ids[1]).offset, frame);
        assert_eq!(alloc.buffer(ids[2]).offset, 2 * frame);
        assert_eq!(alloc.buffer(ids[0]).info, info);

        assert!(matches!(
            alloc.create(&info),
            Err(CaptureError::PoolExhausted { capacity: 3 })
        ));
    }

    #[test]
    fn mapped_views_do_not_overlap() {
        let info = DisplayInfo::packed(2, 2);
        let frame = info.frame_size();
        let mut shm = MockShm::default();
        let mut alloc = BufferAllocator::init(2 * frame, frame, &mut shm).unwrap();
        let a = alloc.create(&info).unwrap();
        let b = alloc.create(&info).unwrap();

        alloc.mapped_mut(a).fill(0xAA);
        alloc.mapped_mut(b).fill(0x55);

        assert_eq!(alloc.mapped(a).len(), frame);
        assert!(alloc.mapped(a).iter().all(|&px| px == 0xAA));
        assert!(alloc.mapped(b).iter().all(|&px| px == 0x55));
    }

    #[test]
    fn provider_failure_is_allocation_failed() {
        let mut shm = MockShm::failing();
        let result = BufferAllocator::init(1024, 256, &mut shm);
        assert!(matches!(result, Err(CaptureError::AllocationFailed { .. })));
    }

    #[test]
    fn rejects_pool_smaller_than_one_frame() {
        let mut shm = MockShm::default();
        assert!(BufferAllocator::init(100, 256, &mut shm).is_err());
        assert_eq!(shm.pools_created(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn memfd_mapping_is_writable() {
        let mut mem = MappedMemory::new(4096).expect("memfd");
        assert_eq!(mem.len(), 4096);
        mem.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&mem.as_slice()[..4], &[1, 2, 3, 4]);
        assert!(MappedMemory::new(0).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn remapped_writes_are_visible_through_the_original() {
        let mem = MappedMemory::new(64).expect("memfd");
        let writer = mem.remap().expect("second mapping");

        writer.write_at(60, &[9, 8, 7, 6]).unwrap();
        assert_eq!(&mem.as_slice()[60..], &[9, 8, 7, 6]);

        assert!(writer.write_at(61, &[0; 4]).is_err());
        assert!(writer.write_at(usize::MAX, &[0]).is_err());
    }
}
