//! A device that lives in host memory.
//!
//! Dispatches run registered Rust closures in place of compiled kernels, which keeps
//! the whole encode/submit path exercisable without a GPU. Only slots bound with
//! `MemoryAccess::Write` are copied back after a kernel runs.

mod kernels;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::config::DeviceConfig;
use crate::error::GraphError;
use crate::vk_trace;

use super::{
    BufferId, BufferUsage, Command, DescriptorKind, DescriptorSetId, DeviceBackend,
    DispatchCommand, ShaderInfo, UVec3,
};

pub use kernels::register_reference_kernels;

/// Kernel body: receives the bound buffers' bytes in slot order.
pub type HostKernel = Arc<dyn Fn(&mut [Vec<u8>], &DispatchCommand) -> Result<()> + Send + Sync>;

#[derive(Debug)]
struct HostBuffer {
    bytes: Vec<u8>,
    usage: BufferUsage,
}

#[derive(Debug, Default, Clone, Copy)]
struct PoolUsage {
    sets: u32,
    storage_buffers: u32,
    uniform_buffers: u32,
}

#[derive(Default)]
struct HostState {
    buffers: HashMap<BufferId, HostBuffer>,
    next_buffer: u64,
    descriptor_sets: HashMap<DescriptorSetId, Vec<DescriptorKind>>,
    next_set: u64,
    pool_usage: PoolUsage,
    kernels: HashMap<String, HostKernel>,
    history: Vec<Command>,
    submissions: usize,
    memory_in_use: u64,
}

pub struct HostDevice {
    config: DeviceConfig,
    state: Mutex<HostState>,
}

impl HostDevice {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HostState::default()),
        }
    }

    /// A device with the kernels the graph helpers in `ops` dispatch.
    pub fn with_reference_kernels(config: DeviceConfig) -> Result<Self> {
        let device = Self::new(config);
        register_reference_kernels(&device)?;
        Ok(device)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn register_kernel<F>(&self, name: impl Into<String>, kernel: F) -> Result<()>
    where
        F: Fn(&mut [Vec<u8>], &DispatchCommand) -> Result<()> + Send + Sync + 'static,
    {
        self.state()?.kernels.insert(name.into(), Arc::new(kernel));
        Ok(())
    }

    pub fn has_kernel(&self, name: &str) -> Result<bool> {
        Ok(self.state()?.kernels.contains_key(name))
    }

    /// Every command submitted so far, in submission order.
    pub fn submitted_commands(&self) -> Result<Vec<Command>> {
        Ok(self.state()?.history.clone())
    }

    pub fn submissions(&self) -> Result<usize> {
        Ok(self.state()?.submissions)
    }

    pub fn memory_in_use(&self) -> Result<u64> {
        Ok(self.state()?.memory_in_use)
    }

    pub fn live_buffers(&self) -> Result<usize> {
        Ok(self.state()?.buffers.len())
    }

    pub fn live_descriptor_sets(&self) -> Result<usize> {
        Ok(self.state()?.descriptor_sets.len())
    }

    fn state(&self) -> Result<MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|_| GraphError::LockPoisoned("host device").into())
    }

    fn state_for_release(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HostState {
    fn buffer(&self, id: BufferId) -> Result<&HostBuffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| anyhow!("host buffer {:?} is not live", id))
    }

    fn buffer_mut(&mut self, id: BufferId) -> Result<&mut HostBuffer> {
        self.buffers
            .get_mut(&id)
            .ok_or_else(|| anyhow!("host buffer {:?} is not live", id))
    }

    fn run_dispatch(&mut self, dispatch: &DispatchCommand) -> Result<()> {
        let name = dispatch.shader.kernel_name();
        let kernel = self
            .kernels
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownShader(name.to_string()))?;
        let mut slots = Vec::with_capacity(dispatch.bindings.len());
        for binding in &dispatch.bindings {
            slots.push(self.buffer(binding.buffer)?.bytes.clone());
        }
        kernel(&mut slots, dispatch)?;
        for (binding, bytes) in dispatch.bindings.iter().zip(slots) {
            if !binding.access.is_write() {
                continue;
            }
            let buffer = self.buffer_mut(binding.buffer)?;
            if bytes.len() != buffer.bytes.len() {
                return Err(anyhow!(
                    "kernel {} resized slot {} from {} to {} bytes",
                    name,
                    binding.slot,
                    buffer.bytes.len(),
                    bytes.len()
                ));
            }
            buffer.bytes = bytes;
        }
        Ok(())
    }

    fn run_copy(&mut self, src: BufferId, dst: BufferId, size: u64) -> Result<()> {
        let size = size as usize;
        let bytes = self
            .buffer(src)?
            .bytes
            .get(..size)
            .ok_or_else(|| anyhow!("copy source {:?} shorter than {} bytes", src, size))?
            .to_vec();
        let target = self
            .buffer_mut(dst)?
            .bytes
            .get_mut(..size)
            .ok_or_else(|| anyhow!("copy target {:?} shorter than {} bytes", dst, size))?;
        target.copy_from_slice(&bytes);
        Ok(())
    }

    fn free_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            self.memory_in_use = self.memory_in_use.saturating_sub(buffer.bytes.len() as u64);
            vk_trace!("freed host buffer {:?} ({:?})", id, buffer.usage);
        }
    }
}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDevice")
            .field("config", &self.config)
            .finish()
    }
}

impl DeviceBackend for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn allocate_buffer(&self, size: u64, usage: BufferUsage) -> Result<BufferId> {
        let mut state = self.state()?;
        if let Some(limit) = self.config.memory_limit_bytes {
            let requested = state.memory_in_use.saturating_add(size);
            if requested > limit {
                return Err(GraphError::OutOfDeviceMemory(format!(
                    "allocating {} bytes with {} of {} bytes in use",
                    size, state.memory_in_use, limit
                ))
                .into());
            }
        }
        state.next_buffer += 1;
        let id = BufferId(state.next_buffer);
        state.buffers.insert(
            id,
            HostBuffer {
                bytes: vec![0u8; size as usize],
                usage,
            },
        );
        state.memory_in_use += size;
        vk_trace!("allocated host buffer {:?} size={} usage={:?}", id, size, usage);
        Ok(id)
    }

    fn release_buffer(&self, buffer: BufferId) {
        self.state_for_release().free_buffer(buffer);
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut state = self.state()?;
        let target = state
            .buffer_mut(buffer)?
            .bytes
            .get_mut(offset as usize..offset as usize + bytes.len())
            .ok_or_else(|| {
                GraphError::ShapeMismatch(format!(
                    "write of {} bytes at offset {} out of range",
                    bytes.len(),
                    offset
                ))
            })?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state()?;
        let source = state
            .buffer(buffer)?
            .bytes
            .get(offset as usize..offset as usize + out.len())
            .ok_or_else(|| {
                GraphError::ShapeMismatch(format!(
                    "read of {} bytes at offset {} out of range",
                    out.len(),
                    offset
                ))
            })?;
        out.copy_from_slice(source);
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        shader: &ShaderInfo,
        _local_workgroup_size: UVec3,
    ) -> Result<DescriptorSetId> {
        let mut state = self.state()?;
        let limits = &self.config.descriptor_pool;
        let storage = shader
            .layout()
            .iter()
            .filter(|kind| **kind == DescriptorKind::StorageBuffer)
            .count() as u32;
        let uniform = shader.binding_count() as u32 - storage;
        let usage = state.pool_usage;
        if usage.sets >= limits.max_sets
            || usage.storage_buffers + storage > limits.storage_buffers
            || usage.uniform_buffers + uniform > limits.uniform_buffers
        {
            return Err(GraphError::OutOfDeviceMemory(format!(
                "descriptor pool exhausted allocating a set for {}",
                shader.kernel_name()
            ))
            .into());
        }
        state.pool_usage = PoolUsage {
            sets: usage.sets + 1,
            storage_buffers: usage.storage_buffers + storage,
            uniform_buffers: usage.uniform_buffers + uniform,
        };
        state.next_set += 1;
        let id = DescriptorSetId(state.next_set);
        state.descriptor_sets.insert(id, shader.layout().to_vec());
        Ok(id)
    }

    fn release_descriptor_set(&self, set: DescriptorSetId) {
        let mut state = self.state_for_release();
        if let Some(layout) = state.descriptor_sets.remove(&set) {
            let storage = layout
                .iter()
                .filter(|kind| **kind == DescriptorKind::StorageBuffer)
                .count() as u32;
            let uniform = layout.len() as u32 - storage;
            let usage = &mut state.pool_usage;
            usage.sets = usage.sets.saturating_sub(1);
            usage.storage_buffers = usage.storage_buffers.saturating_sub(storage);
            usage.uniform_buffers = usage.uniform_buffers.saturating_sub(uniform);
        }
    }

    fn submit(&self, commands: &[Command]) -> Result<()> {
        let mut state = self.state()?;
        let mut result = Ok(());
        for command in commands {
            result = match command {
                Command::Dispatch(dispatch) => state.run_dispatch(dispatch),
                Command::CopyBuffer { src, dst, size, .. } => state.run_copy(*src, *dst, *size),
            };
            if result.is_err() {
                break;
            }
            state.history.push(command.clone());
        }
        state.submissions += 1;
        result
    }
}
