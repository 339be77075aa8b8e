//! Graph-side half of the runtime: values and the handles nodes use to reach
//! them, the two node kinds, and the graph that owns both.

mod compute_graph;
mod execute_node;
mod prepack_node;
mod staging;
mod store;
mod tensor;
mod value;

pub use compute_graph::{ComputeGraph, Node};
pub use execute_node::{ArgGroup, ExecuteNode};
pub use prepack_node::PrepackNode;
pub use staging::{copy_ptr_to_staging, copy_staging_to_ptr, copy_to_staging, StagingBuffer};
pub use store::ValueStore;
pub use tensor::DeviceTensor;
pub use value::{HostData, IOValueRef, MappedSlice, TensorRef, TypeTag, Value, ValueRef};
