use std::fmt;
use std::sync::{Arc, Weak};

use anyhow::Result;
use bytemuck::Pod;

use crate::error::GraphError;

use super::context::{lock_release_queue, ReleaseQueue};
use super::{BufferId, BufferUsage, Context, DeviceBackend};

/// Owned device allocation.
///
/// Dropping it queues the release on the context that allocated it, so the
/// memory outlives any command already registered against it. Without a live
/// context the backend frees it at once.
pub struct DeviceBuffer {
    backend: Arc<dyn DeviceBackend>,
    release_queue: Weak<ReleaseQueue>,
    id: BufferId,
    size: u64,
    usage: BufferUsage,
}

impl DeviceBuffer {
    pub fn new(context: &Context, size: u64, usage: BufferUsage) -> Result<Self> {
        let backend = Arc::clone(context.backend());
        let id = backend.allocate_buffer(size, usage)?;
        Ok(Self {
            backend,
            release_queue: context.release_queue(),
            id,
            size,
            usage,
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        self.backend.write_buffer(self.id, offset, bytes)
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        self.backend.read_buffer(self.id, offset, out)
    }

    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        self.read(0, &mut out)?;
        Ok(out)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.saturating_add(len as u64);
        if end > self.size {
            return Err(GraphError::ShapeMismatch(format!(
                "access of {} bytes at offset {} exceeds buffer of {} bytes",
                len, offset, self.size
            ))
            .into());
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        match self.release_queue.upgrade() {
            Some(queue) => lock_release_queue(&queue).push(self.id),
            None => self.backend.release_buffer(self.id),
        }
    }
}

/// Uniform buffer of per-dispatch constants, written once at construction.
#[derive(Debug)]
pub struct ParamsBuffer {
    buffer: DeviceBuffer,
}

impl ParamsBuffer {
    pub fn new<T: Pod>(context: &Context, params: &T) -> Result<Self> {
        Self::from_bytes(context, bytemuck::bytes_of(params))
    }

    pub fn from_bytes(context: &Context, bytes: &[u8]) -> Result<Self> {
        let buffer = DeviceBuffer::new(context, bytes.len() as u64, BufferUsage::Uniform)?;
        buffer.write(0, bytes)?;
        Ok(Self { buffer })
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn nbytes(&self) -> usize {
        self.buffer.size() as usize
    }
}
