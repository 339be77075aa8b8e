use anyhow::Result;

use crate::error::GraphError;
use crate::runtime::{BufferUsage, Context, DescriptorSet, DeviceBuffer, MemoryAccess};
use crate::tensor::DType;

/// Host-writable buffer used to move bytes between host memory and device tensors.
#[derive(Debug)]
pub struct StagingBuffer {
    dtype: DType,
    numel: usize,
    buffer: DeviceBuffer,
}

impl StagingBuffer {
    pub fn new(context: &Context, dtype: DType, numel: usize) -> Result<Self> {
        let nbytes = numel * dtype.element_size();
        let buffer = DeviceBuffer::new(context, nbytes as u64, BufferUsage::Staging)?;
        Ok(Self {
            dtype,
            numel,
            buffer,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn nbytes(&self) -> usize {
        self.numel * self.dtype.element_size()
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn bind(
        &self,
        descriptor_set: &mut DescriptorSet,
        slot: u32,
        access: MemoryAccess,
    ) -> Result<()> {
        descriptor_set.bind_storage(slot, &self.buffer, access)
    }
}

/// Allocate a staging buffer holding exactly `data`.
pub fn copy_to_staging(context: &Context, dtype: DType, data: &[u8]) -> Result<StagingBuffer> {
    let elem = dtype.element_size();
    if data.len() % elem != 0 {
        return Err(GraphError::ShapeMismatch(format!(
            "{} bytes is not a whole number of {} elements",
            data.len(),
            dtype
        ))
        .into());
    }
    let staging = StagingBuffer::new(context, dtype, data.len() / elem)?;
    copy_ptr_to_staging(data, &staging, data.len())?;
    Ok(staging)
}

/// Copy the first `nbytes` of `src` into the start of `staging`.
pub fn copy_ptr_to_staging(src: &[u8], staging: &StagingBuffer, nbytes: usize) -> Result<()> {
    check_copy(src.len(), staging.nbytes(), nbytes)?;
    staging.buffer().write(0, &src[..nbytes])
}

/// Copy the first `nbytes` of `staging` into `dst`.
pub fn copy_staging_to_ptr(staging: &StagingBuffer, dst: &mut [u8], nbytes: usize) -> Result<()> {
    check_copy(dst.len(), staging.nbytes(), nbytes)?;
    staging.buffer().read(0, &mut dst[..nbytes])
}

fn check_copy(host_len: usize, capacity: usize, nbytes: usize) -> Result<()> {
    if nbytes > capacity {
        return Err(GraphError::ShapeMismatch(format!(
            "copy of {} bytes exceeds staging capacity of {} bytes",
            nbytes, capacity
        ))
        .into());
    }
    if nbytes > host_len {
        return Err(GraphError::ShapeMismatch(format!(
            "copy of {} bytes exceeds host buffer of {} bytes",
            nbytes, host_len
        ))
        .into());
    }
    Ok(())
}
