#[doc(hidden)]
pub mod logging;

mod config;
mod error;
pub mod graph;
pub mod ops;
pub mod runtime;
mod tensor;

pub use config::{DescriptorPoolConfig, DeviceConfig, GraphConfig, CONFIG_ENV};
pub use error::GraphError;
pub use graph::{
    ArgGroup, ComputeGraph, DeviceTensor, ExecuteNode, HostData, IOValueRef, Node, PrepackNode,
    StagingBuffer, TensorRef, TypeTag, Value, ValueRef, ValueStore,
};
pub use runtime::{
    Context, DeviceBackend, HostDevice, MemoryAccess, ParamsBuffer, ShaderCatalog, ShaderInfo,
    ShaderRegistry, UVec3,
};
pub use tensor::{compute_strides, numel, DType, GpuMemoryLayout, PACKED_DIM_ALIGNMENT};
