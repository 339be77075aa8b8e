use std::collections::HashSet;

use anyhow::Result;

use crate::runtime::{Context, MemoryAccess, ParamsBuffer, PipelineBarrier, ShaderInfo, UVec3};
use crate::{trace, warning};

use super::{ValueRef, ValueStore};

/// Values bound with one access mode, in slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgGroup {
    pub refs: Vec<ValueRef>,
    pub access: MemoryAccess,
}

impl ArgGroup {
    pub fn new(refs: Vec<ValueRef>, access: MemoryAccess) -> Self {
        Self { refs, access }
    }

    pub fn read(refs: Vec<ValueRef>) -> Self {
        Self::new(refs, MemoryAccess::Read)
    }

    pub fn write(refs: Vec<ValueRef>) -> Self {
        Self::new(refs, MemoryAccess::Write)
    }
}

/// A dispatch that runs on every graph execution.
///
/// Tensors are bound group by group starting at slot 0; the params buffer
/// takes the slot after the last tensor.
#[derive(Debug)]
pub struct ExecuteNode {
    shader: ShaderInfo,
    global_workgroup_size: UVec3,
    local_workgroup_size: UVec3,
    args: Vec<ArgGroup>,
    params: ParamsBuffer,
}

impl ExecuteNode {
    pub fn new(
        shader: ShaderInfo,
        global_workgroup_size: UVec3,
        local_workgroup_size: UVec3,
        args: Vec<ArgGroup>,
        params: ParamsBuffer,
    ) -> Self {
        let mut written = HashSet::new();
        for value in args
            .iter()
            .filter(|group| group.access.is_write())
            .flat_map(|group| group.refs.iter())
        {
            if !written.insert(*value) {
                warning!(
                    "{} declares write access to {} more than once",
                    shader.kernel_name(),
                    value
                );
            }
        }
        Self {
            shader,
            global_workgroup_size,
            local_workgroup_size,
            args,
            params,
        }
    }

    pub fn shader(&self) -> &ShaderInfo {
        &self.shader
    }

    pub fn args(&self) -> &[ArgGroup] {
        &self.args
    }

    pub fn global_workgroup_size(&self) -> UVec3 {
        self.global_workgroup_size
    }

    pub fn local_workgroup_size(&self) -> UVec3 {
        self.local_workgroup_size
    }

    /// Number of descriptor slots this node fills, params included.
    pub fn binding_count(&self) -> usize {
        self.args.iter().map(|group| group.refs.len()).sum::<usize>() + 1
    }

    /// Resolve every argument as a device tensor without touching the context.
    pub fn check_args(&self, values: &ValueStore) -> Result<()> {
        for value in self.args.iter().flat_map(|group| group.refs.iter()) {
            values.tensor(*value)?;
        }
        Ok(())
    }

    pub fn encode(&self, values: &mut ValueStore, context: &Context) -> Result<()> {
        let mut guard = context.dispatch_lock()?;
        let mut descriptor_set =
            guard.get_descriptor_set(&self.shader, self.local_workgroup_size)?;
        let mut barrier = PipelineBarrier::new();

        let mut slot = 0u32;
        let mut bound = Vec::with_capacity(self.binding_count());
        for group in &self.args {
            for value in &group.refs {
                values
                    .tensor(*value)?
                    .bind(&mut descriptor_set, &mut barrier, slot, group.access)?;
                bound.push((*value, group.access));
                slot += 1;
            }
        }
        descriptor_set.bind_params(slot, &self.params)?;

        trace!(
            "execute {} with {} bindings, {} barriers",
            self.shader.kernel_name(),
            slot + 1,
            barrier.buffers().len()
        );
        guard.register_shader_dispatch(
            descriptor_set,
            barrier,
            &self.shader,
            self.global_workgroup_size,
        )?;
        values.record_accesses(&bound)
    }
}
