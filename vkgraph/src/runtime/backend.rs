use std::fmt;

use anyhow::Result;

use super::{DescriptorKind, MemoryAccess, PipelineBarrier, ShaderInfo, UVec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorSetId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Device-resident tensor storage.
    Storage,
    /// Host-writable transfer buffer.
    Staging,
    /// Small per-dispatch constants.
    Uniform,
}

/// One resource written into a descriptor set slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub slot: u32,
    pub buffer: BufferId,
    pub range: u64,
    pub kind: DescriptorKind,
    pub access: MemoryAccess,
}

#[derive(Debug, Clone)]
pub struct DispatchCommand {
    pub shader: ShaderInfo,
    pub descriptor_set: DescriptorSetId,
    pub bindings: Vec<Binding>,
    pub barrier: PipelineBarrier,
    pub global_workgroup_size: UVec3,
    pub local_workgroup_size: UVec3,
}

#[derive(Debug, Clone)]
pub enum Command {
    Dispatch(DispatchCommand),
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        size: u64,
        barrier: PipelineBarrier,
    },
}

impl Command {
    pub fn as_dispatch(&self) -> Option<&DispatchCommand> {
        match self {
            Command::Dispatch(dispatch) => Some(dispatch),
            Command::CopyBuffer { .. } => None,
        }
    }
}

/// The device seam. Implementations own the native objects behind every id they hand out.
///
/// `release_buffer` frees at once. [`super::Context`] only calls it after the
/// submission holding the buffer's last command has completed.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn allocate_buffer(&self, size: u64, usage: BufferUsage) -> Result<BufferId>;

    fn release_buffer(&self, buffer: BufferId);

    fn write_buffer(&self, buffer: BufferId, offset: u64, bytes: &[u8]) -> Result<()>;

    fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> Result<()>;

    fn allocate_descriptor_set(
        &self,
        shader: &ShaderInfo,
        local_workgroup_size: UVec3,
    ) -> Result<DescriptorSetId>;

    fn release_descriptor_set(&self, set: DescriptorSetId);

    /// Execute `commands` in order and wait for completion.
    fn submit(&self, commands: &[Command]) -> Result<()>;
}
