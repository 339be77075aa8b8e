//! Device-facing half of the runtime: the backend seam, the encoding context and
//! the resources (buffers, descriptor sets, barriers, shaders) nodes bind.

mod backend;
mod barrier;
mod buffer;
mod context;
pub mod host;
mod shader;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use backend::{
    Binding, BufferId, BufferUsage, Command, DescriptorSetId, DeviceBackend, DispatchCommand,
};
pub use barrier::{BufferBarrier, MemoryAccess, PipelineBarrier};
pub use buffer::{DeviceBuffer, ParamsBuffer};
pub use context::{Context, DescriptorSet, DispatchGuard, LockStats};
pub use host::{HostDevice, HostKernel};
pub use shader::{
    spirv_entrypoints, validate_spirv, DescriptorKind, ShaderCatalog, ShaderInfo, ShaderRegistry,
};

/// Workgroup extents of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UVec3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl UVec3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn numel(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Number of workgroups of `local` size needed to cover `self`, at least one per axis.
    pub fn div_up(self, local: UVec3) -> UVec3 {
        fn axis(global: u32, local: u32) -> u32 {
            global.div_ceil(local.max(1)).max(1)
        }
        UVec3::new(
            axis(self.x, local.x),
            axis(self.y, local.y),
            axis(self.z, local.z),
        )
    }
}

impl From<[u32; 3]> for UVec3 {
    fn from(value: [u32; 3]) -> Self {
        UVec3::new(value[0], value[1], value[2])
    }
}

impl fmt::Display for UVec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}
