//! Builder helpers that turn common operations into graph nodes.

mod params;

use anyhow::Result;

use crate::error::GraphError;
use crate::graph::{ArgGroup, ComputeGraph, ExecuteNode, PrepackNode, StagingBuffer, ValueRef};
use crate::runtime::{
    MemoryAccess, ParamsBuffer, PipelineBarrier, ShaderInfo, ShaderRegistry, UVec3,
};
use crate::tensor::GpuMemoryLayout;

pub use params::{BinaryOp, ElementwiseParams, PackParams, MAX_RANK};

/// Add a packed tensor holding the data of `tref` and the prepack node that fills it.
pub fn prepack_constant(
    graph: &mut ComputeGraph,
    registry: &dyn ShaderRegistry,
    tref: ValueRef,
    layout: GpuMemoryLayout,
) -> Result<ValueRef> {
    let (sizes, dtype) = {
        let tref = graph.values().tensor_ref(tref)?;
        (tref.sizes.clone(), tref.dtype)
    };
    let shader = registry.get_shader_info(&format!("nchw_to_buffer_{}", dtype))?;
    let params = PackParams::new(&sizes, layout, dtype)?;
    let packed = graph.add_tensor(&sizes, dtype, layout)?;
    let global = gpu_extents(&layout.gpu_sizes(&sizes))?;
    let local = local_workgroup_size(graph, &shader);
    let params = ParamsBuffer::new(graph.context(), &params)?;
    graph.add_prepack_node(PrepackNode::new(shader, global, local, tref, packed, params));
    Ok(packed)
}

/// Append `out = lhs <op> rhs` over three tensors of identical shape, dtype and layout.
pub fn add_binary_op(
    graph: &mut ComputeGraph,
    registry: &dyn ShaderRegistry,
    op: BinaryOp,
    lhs: ValueRef,
    rhs: ValueRef,
    out: ValueRef,
) -> Result<()> {
    let (dtype, gpu_numel) = {
        let values = graph.values();
        let out_tensor = values.tensor(out)?;
        for operand in [lhs, rhs] {
            let tensor = values.tensor(operand)?;
            if tensor.sizes() != out_tensor.sizes()
                || tensor.dtype() != out_tensor.dtype()
                || tensor.layout() != out_tensor.layout()
            {
                return Err(GraphError::ShapeMismatch(format!(
                    "{} operand {} is {}{:?}, output {} is {}{:?}",
                    op.as_str(),
                    operand,
                    tensor.dtype(),
                    tensor.sizes(),
                    out,
                    out_tensor.dtype(),
                    out_tensor.sizes()
                ))
                .into());
            }
        }
        (out_tensor.dtype(), out_tensor.gpu_numel())
    };
    let shader = registry.get_shader_info(&op.shader_name(dtype))?;
    let params = ParamsBuffer::new(graph.context(), &ElementwiseParams::new(gpu_numel, dtype)?)?;
    let global = UVec3::new(extent(gpu_numel)?, 1, 1);
    let local = local_workgroup_size(graph, &shader);
    graph.add_execute_node(ExecuteNode::new(
        shader,
        global,
        local,
        vec![ArgGroup::read(vec![lhs, rhs]), ArgGroup::write(vec![out])],
        params,
    ));
    Ok(())
}

/// Read a packed tensor back in logical order.
///
/// Encodes a `buffer_to_nchw_<dtype>` dispatch into a transient staging buffer
/// and submits, so any work already pending on the context runs first.
pub fn read_tensor(
    graph: &mut ComputeGraph,
    registry: &dyn ShaderRegistry,
    tensor: ValueRef,
) -> Result<Vec<u8>> {
    let (sizes, gpu_sizes, dtype, layout) = {
        let tensor = graph.values().tensor(tensor)?;
        (
            tensor.sizes().to_vec(),
            tensor.gpu_sizes().to_vec(),
            tensor.dtype(),
            tensor.layout(),
        )
    };
    let shader = registry.get_shader_info(&format!("buffer_to_nchw_{}", dtype))?;
    let local = local_workgroup_size(graph, &shader);
    let global = gpu_extents(&gpu_sizes)?;
    let context = graph.context().clone();
    let params = ParamsBuffer::new(&context, &PackParams::new(&sizes, layout, dtype)?)?;
    let staging = StagingBuffer::new(&context, dtype, crate::tensor::numel(&sizes))?;
    {
        let mut guard = context.dispatch_lock()?;
        let mut descriptor_set = guard.get_descriptor_set(&shader, local)?;
        let mut barrier = PipelineBarrier::new();
        staging.bind(&mut descriptor_set, 0, MemoryAccess::Write)?;
        graph.values().tensor(tensor)?.bind(
            &mut descriptor_set,
            &mut barrier,
            1,
            MemoryAccess::Read,
        )?;
        descriptor_set.bind_params(2, &params)?;
        guard.register_shader_dispatch(descriptor_set, barrier, &shader, global)?;
        graph
            .values_mut()
            .tensor_mut(tensor)?
            .record_access(MemoryAccess::Read);
    }
    context.submit()?;
    let mut out = vec![0u8; staging.nbytes()];
    staging.buffer().read(0, &mut out)?;
    Ok(out)
}

fn local_workgroup_size(graph: &ComputeGraph, shader: &ShaderInfo) -> UVec3 {
    shader
        .local_workgroup_size()
        .unwrap_or_else(|| graph.config().local_workgroup_size())
}

/// Dispatch extents covering a buffer of `gpu_sizes`: innermost dim on x, the next
/// on y, everything else folded into z.
fn gpu_extents(gpu_sizes: &[usize]) -> Result<UVec3> {
    let mut dims = gpu_sizes.iter().rev();
    let x = dims.next().copied().unwrap_or(1);
    let y = dims.next().copied().unwrap_or(1);
    let z = dims.product::<usize>();
    Ok(UVec3::new(extent(x)?, extent(y)?, extent(z)?))
}

fn extent(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        GraphError::ShapeMismatch(format!("dispatch extent {} does not fit in 32 bits", value))
            .into()
    })
}
