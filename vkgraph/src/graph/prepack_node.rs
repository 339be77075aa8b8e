use anyhow::Result;

use crate::error::GraphError;
use crate::runtime::{Context, MemoryAccess, ParamsBuffer, PipelineBarrier, ShaderInfo, UVec3};
use crate::trace;

use super::{copy_ptr_to_staging, StagingBuffer, ValueRef, ValueStore};

/// One-shot upload of constant host data into a packed device tensor.
///
/// The shader's binding contract is: slot 0 the packed tensor (write), slot 1
/// the staged host data (read), slot 2 the params buffer.
#[derive(Debug)]
pub struct PrepackNode {
    shader: ShaderInfo,
    global_workgroup_size: UVec3,
    local_workgroup_size: UVec3,
    tref: ValueRef,
    packed: ValueRef,
    params: ParamsBuffer,
}

impl PrepackNode {
    pub fn new(
        shader: ShaderInfo,
        global_workgroup_size: UVec3,
        local_workgroup_size: UVec3,
        tref: ValueRef,
        packed: ValueRef,
        params: ParamsBuffer,
    ) -> Self {
        Self {
            shader,
            global_workgroup_size,
            local_workgroup_size,
            tref,
            packed,
            params,
        }
    }

    pub fn shader(&self) -> &ShaderInfo {
        &self.shader
    }

    pub fn tref(&self) -> ValueRef {
        self.tref
    }

    pub fn packed(&self) -> ValueRef {
        self.packed
    }

    pub fn global_workgroup_size(&self) -> UVec3 {
        self.global_workgroup_size
    }

    pub fn local_workgroup_size(&self) -> UVec3 {
        self.local_workgroup_size
    }

    /// Resolve both handles with their expected types.
    pub fn check_args(&self, values: &ValueStore) -> Result<()> {
        values.tensor_ref(self.tref)?;
        values.tensor(self.packed)?;
        Ok(())
    }

    /// Stage the host data and register the repacking dispatch.
    ///
    /// The dispatch lock is held for the whole call, so a failure at any step
    /// (bad handle, short staging buffer, allocation) releases it exactly once.
    /// The staging buffer is dropped on return; the context keeps it alive until
    /// the submit carrying this dispatch has completed.
    pub fn encode(&self, values: &mut ValueStore, context: &Context) -> Result<()> {
        let mut guard = context.dispatch_lock()?;

        let tref = values.tensor_ref(self.tref)?;
        let packed = values.tensor(self.packed)?;
        let data = tref
            .data
            .bytes()
            .ok_or(GraphError::HostDataUnavailable(self.tref.index()))?;
        if tref.dtype != packed.dtype() {
            return Err(GraphError::ShapeMismatch(format!(
                "prepack of {} data into {} tensor {}",
                tref.dtype,
                packed.dtype(),
                self.packed
            ))
            .into());
        }
        let nbytes = tref.nbytes();
        let staging = StagingBuffer::new(context, packed.dtype(), packed.gpu_numel())?;
        copy_ptr_to_staging(data, &staging, nbytes)?;
        trace!(
            "prepack {} -> {} via {} ({} bytes staged)",
            self.tref,
            self.packed,
            self.shader.kernel_name(),
            nbytes
        );

        let mut descriptor_set =
            guard.get_descriptor_set(&self.shader, self.local_workgroup_size)?;
        let mut barrier = PipelineBarrier::new();
        values.tensor(self.packed)?.bind(
            &mut descriptor_set,
            &mut barrier,
            0,
            MemoryAccess::Write,
        )?;
        staging.bind(&mut descriptor_set, 1, MemoryAccess::Read)?;
        descriptor_set.bind_params(2, &self.params)?;

        guard.register_shader_dispatch(
            descriptor_set,
            barrier,
            &self.shader,
            self.global_workgroup_size,
        )?;
        values.tensor_mut(self.packed)?.record_access(MemoryAccess::Write);
        Ok(())
    }
}
