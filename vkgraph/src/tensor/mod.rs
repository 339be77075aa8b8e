mod dtype;
mod layout;
mod shape;

pub use dtype::DType;
pub use layout::{GpuMemoryLayout, PACKED_DIM_ALIGNMENT};
pub use shape::{compute_strides, numel};
