//! `wl_shm` pools backed by memfd mappings.

use std::os::fd::AsFd;

use tracing::trace;
use wayland_client::protocol::{wl_buffer, wl_shm, wl_shm_pool};
use wayland_client::QueueHandle;
use wlgrab_core::{CaptureError, DisplayInfo};

use super::WaylandState;
use crate::allocator::{MappedMemory, ShmPool, ShmProvider};

/// A `wl_buffer` plus the geometry it was registered with.
#[derive(Debug, Clone)]
pub struct WlShmBuffer {
    pub wl_buffer: wl_buffer::WlBuffer,
    pub info:      DisplayInfo,
}

pub struct WlShmProvider {
    shm: wl_shm::WlShm,
    qh:  QueueHandle<WaylandState>,
}

impl WlShmProvider {
    pub fn new(shm: wl_shm::WlShm, qh: QueueHandle<WaylandState>) -> Self {
        Self { shm, qh }
    }
}

impl ShmProvider for WlShmProvider {
    type Pool = WlShmPoolMemory;

    fn create_pool(&mut self, size: usize) -> Result<WlShmPoolMemory, CaptureError> {
        let wire_size = i32::try_from(size)
            .map_err(|_| CaptureError::allocation(format!("{size}-byte pool exceeds wl_shm limits")))?;
        let memory = MappedMemory::new(size)?;
        let pool = self.shm.create_pool(memory.as_fd(), wire_size, &self.qh, ());
        trace!("wl_shm_pool created: {} bytes", size);
        Ok(WlShmPoolMemory { pool, memory, buffers: Vec::new(), qh: self.qh.clone() })
    }
}

/// One `wl_shm_pool` and its CPU mapping. Destroys every buffer it
/// registered, then the pool, when dropped.
pub struct WlShmPoolMemory {
    pool:    wl_shm_pool::WlShmPool,
    memory:  MappedMemory,
    buffers: Vec<wl_buffer::WlBuffer>,
    qh:      QueueHandle<WaylandState>,
}

impl ShmPool for WlShmPoolMemory {
    type Buffer = WlShmBuffer;

    fn create_buffer(&mut self, offset: usize, info: &DisplayInfo) -> Result<WlShmBuffer, CaptureError> {
        let format = wl_shm::Format::try_from(info.format.shm_code())
            .map_err(|_| CaptureError::UnsupportedFormat { format: info.format })?;
        let wire = |v: usize, what: &str| {
            i32::try_from(v).map_err(|_| CaptureError::allocation(format!("{what} {v} out of range")))
        };
        let wl_buffer = self.pool.create_buffer(
            wire(offset, "offset")?,
            wire(info.width as usize, "width")?,
            wire(info.height as usize, "height")?,
            wire(info.stride as usize, "stride")?,
            format,
            &self.qh,
            (),
        );
        self.buffers.push(wl_buffer.clone());
        Ok(WlShmBuffer { wl_buffer, info: *info })
    }

    fn memory(&self) -> &[u8] {
        self.memory.as_slice()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }
}

impl Drop for WlShmPoolMemory {
    fn drop(&mut self) {
        for buffer in self.buffers.drain(..) {
            buffer.destroy();
        }
        self.pool.destroy();
        trace!("wl_shm_pool destroyed ({} bytes unmapped)", self.memory.len());
    }
}
