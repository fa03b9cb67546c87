//! Slot memory for the PipeWire backend.
//!
//! There is no compositor to hand buffers to, so the stream side plays its
//! part: each [`PoolRegion`] carries a second mapping of the pool's memfd
//! and the stream copies decoded samples into it.

use std::rc::Rc;

use wlgrab_core::{CaptureError, DisplayInfo};

use crate::allocator::{MappedMemory, ShmPool, ShmProvider};

/// One slot's region, writable from the stream side.
pub struct PoolRegion {
    writer:   Rc<MappedMemory>,
    offset:   usize,
    pub info: DisplayInfo,
}

impl PoolRegion {
    /// Fills the region with one frame; `frame` must be at least one
    /// region long.
    pub fn fill(&self, frame: &[u8]) -> Result<(), CaptureError> {
        let len = self.info.frame_size();
        let Some(pixels) = frame.get(..len) else {
            return Err(CaptureError::protocol(format!(
                "sample holds {} bytes, frame needs {len}",
                frame.len()
            )));
        };
        self.writer.write_at(self.offset, pixels)
    }
}

pub struct PortalPool {
    memory: MappedMemory,
    writer: Rc<MappedMemory>,
}

impl ShmPool for PortalPool {
    type Buffer = PoolRegion;

    fn create_buffer(&mut self, offset: usize, info: &DisplayInfo) -> Result<PoolRegion, CaptureError> {
        Ok(PoolRegion { writer: Rc::clone(&self.writer), offset, info: *info })
    }

    fn memory(&self) -> &[u8] {
        self.memory.as_slice()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }
}

/// memfd pools with a stream-side mapping.
#[derive(Debug, Default)]
pub struct PortalShm;

impl ShmProvider for PortalShm {
    type Pool = PortalPool;

    fn create_pool(&mut self, size: usize) -> Result<PortalPool, CaptureError> {
        let memory = MappedMemory::new(size)?;
        let writer = Rc::new(memory.remap()?);
        Ok(PortalPool { memory, writer })
    }
}
