use anyhow::Result;

use crate::runtime::{
    BufferUsage, Context, DescriptorSet, DeviceBuffer, MemoryAccess, PipelineBarrier,
};
use crate::tensor::{numel, DType, GpuMemoryLayout};

/// Tensor whose storage lives on the device.
///
/// The packed dimension of the device allocation is padded up to a multiple of
/// four, so `gpu_nbytes()` can exceed `nbytes()`.
#[derive(Debug)]
pub struct DeviceTensor {
    sizes: Vec<usize>,
    gpu_sizes: Vec<usize>,
    dtype: DType,
    layout: GpuMemoryLayout,
    buffer: DeviceBuffer,
    last_access: Option<MemoryAccess>,
}

impl DeviceTensor {
    pub fn new(
        context: &Context,
        sizes: &[usize],
        dtype: DType,
        layout: GpuMemoryLayout,
    ) -> Result<Self> {
        let gpu_sizes = layout.gpu_sizes(sizes);
        let nbytes = numel(&gpu_sizes) * dtype.element_size();
        let buffer = DeviceBuffer::new(context, nbytes as u64, BufferUsage::Storage)?;
        Ok(Self {
            sizes: sizes.to_vec(),
            gpu_sizes,
            dtype,
            layout,
            buffer,
            last_access: None,
        })
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn gpu_sizes(&self) -> &[usize] {
        &self.gpu_sizes
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn layout(&self) -> GpuMemoryLayout {
        self.layout
    }

    pub fn numel(&self) -> usize {
        numel(&self.sizes)
    }

    pub fn gpu_numel(&self) -> usize {
        numel(&self.gpu_sizes)
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.element_size()
    }

    pub fn gpu_nbytes(&self) -> usize {
        self.gpu_numel() * self.dtype.element_size()
    }

    /// True when the device allocation has padding elements.
    pub fn is_padded(&self) -> bool {
        self.gpu_sizes != self.sizes
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn last_access(&self) -> Option<MemoryAccess> {
        self.last_access
    }

    /// Bind this tensor to `slot` and add the barrier the new access needs.
    ///
    /// `last_access` is left alone until the command is registered.
    pub fn bind(
        &self,
        descriptor_set: &mut DescriptorSet,
        barrier: &mut PipelineBarrier,
        slot: u32,
        access: MemoryAccess,
    ) -> Result<()> {
        descriptor_set.bind_storage(slot, &self.buffer, access)?;
        self.add_barrier(barrier, access);
        Ok(())
    }

    /// Barrier for an access made by a command other than a dispatch (e.g. a buffer copy).
    pub(crate) fn add_barrier(&self, barrier: &mut PipelineBarrier, access: MemoryAccess) {
        barrier.add_transition(self.buffer.id(), self.last_access, access);
    }

    pub(crate) fn record_access(&mut self, access: MemoryAccess) {
        self.last_access = Some(access);
    }
}
