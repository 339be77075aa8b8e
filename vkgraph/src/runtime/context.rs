use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;

use crate::error::GraphError;
use crate::{vk_trace, warning};

use super::{
    Binding, BufferId, Command, DescriptorKind, DescriptorSetId, DeviceBackend, DeviceBuffer,
    DispatchCommand, MemoryAccess, ParamsBuffer, PipelineBarrier, ShaderInfo, UVec3,
};

#[derive(Debug, Default)]
struct CommandEncoder {
    commands: Vec<Command>,
    descriptor_sets: Vec<DescriptorSetId>,
}

impl CommandEncoder {
    fn take(&mut self) -> (Vec<Command>, Vec<DescriptorSetId>) {
        (
            mem::take(&mut self.commands),
            mem::take(&mut self.descriptor_sets),
        )
    }
}

/// Buffers dropped since the last submit; freed once the batch they were taken
/// with has completed.
pub(crate) type ReleaseQueue = Mutex<Vec<BufferId>>;

/// Dispatch-lock bookkeeping: after any sequence of completed encodes the two
/// counts are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub acquired: usize,
    pub released: usize,
}

/// Owns the command stream of one device and serializes encoding into it.
pub struct Context {
    backend: Arc<dyn DeviceBackend>,
    encoder: Mutex<CommandEncoder>,
    released: Arc<ReleaseQueue>,
    // held from taking a batch until the backend has finished it
    submitting: Mutex<()>,
    locks_acquired: AtomicUsize,
    locks_released: AtomicUsize,
    submissions: AtomicUsize,
}

impl Context {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        vk_trace!("created context on {}", backend.name());
        Self {
            backend,
            encoder: Mutex::new(CommandEncoder::default()),
            released: Arc::new(Mutex::new(Vec::new())),
            submitting: Mutex::new(()),
            locks_acquired: AtomicUsize::new(0),
            locks_released: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub(crate) fn release_queue(&self) -> Weak<ReleaseQueue> {
        Arc::downgrade(&self.released)
    }

    /// Buffers dropped but not yet freed.
    pub fn pending_releases(&self) -> Result<usize> {
        let released = self
            .released
            .lock()
            .map_err(|_| GraphError::LockPoisoned("release queue"))?;
        Ok(released.len())
    }

    /// Take exclusive access to the command stream. Descriptor-set allocation and
    /// dispatch registration are only reachable through the returned guard.
    pub fn dispatch_lock(&self) -> Result<DispatchGuard<'_>> {
        let encoder = self
            .encoder
            .lock()
            .map_err(|_| GraphError::LockPoisoned("dispatch"))?;
        self.locks_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(DispatchGuard {
            context: self,
            encoder,
        })
    }

    pub fn lock_stats(&self) -> LockStats {
        LockStats {
            acquired: self.locks_acquired.load(Ordering::SeqCst),
            released: self.locks_released.load(Ordering::SeqCst),
        }
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn pending_commands(&self) -> Result<usize> {
        let encoder = self
            .encoder
            .lock()
            .map_err(|_| GraphError::LockPoisoned("dispatch"))?;
        Ok(encoder.commands.len())
    }

    /// Submit everything registered so far and wait for the device to finish it.
    ///
    /// Buffers dropped before the batch was taken are freed once it completes;
    /// later drops wait for the next submit.
    pub fn submit(&self) -> Result<()> {
        let _submitting = self
            .submitting
            .lock()
            .map_err(|_| GraphError::LockPoisoned("submit"))?;
        let (commands, descriptor_sets, released) = {
            let mut encoder = self
                .encoder
                .lock()
                .map_err(|_| GraphError::LockPoisoned("dispatch"))?;
            let released = mem::take(&mut *lock_release_queue(&self.released));
            let (commands, descriptor_sets) = encoder.take();
            (commands, descriptor_sets, released)
        };
        vk_trace!(
            "submitting {} commands on {} ({} buffers to free)",
            commands.len(),
            self.backend.name(),
            released.len()
        );
        let result = self.backend.submit(&commands);
        self.release_descriptor_sets(descriptor_sets);
        for buffer in released {
            self.backend.release_buffer(buffer);
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Drop every registered command without submitting it. Returns how many were dropped.
    ///
    /// Dropped buffers stay queued: a submit already in flight may still use them.
    pub fn discard(&self) -> Result<usize> {
        let (commands, descriptor_sets) = {
            let mut encoder = self
                .encoder
                .lock()
                .map_err(|_| GraphError::LockPoisoned("dispatch"))?;
            encoder.take()
        };
        self.release_descriptor_sets(descriptor_sets);
        vk_trace!("discarded {} pending commands", commands.len());
        Ok(commands.len())
    }

    fn release_descriptor_sets(&self, sets: Vec<DescriptorSetId>) {
        for set in sets {
            self.backend.release_descriptor_set(set);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend.name())
            .field("lock_stats", &self.lock_stats())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let encoder = self
            .encoder
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (commands, descriptor_sets) = encoder.take();
        if !commands.is_empty() {
            warning!(
                "context dropped with {} unsubmitted commands",
                commands.len()
            );
        }
        self.release_descriptor_sets(descriptor_sets);
        for buffer in mem::take(&mut *lock_release_queue(&self.released)) {
            self.backend.release_buffer(buffer);
        }
    }
}

pub(crate) fn lock_release_queue(queue: &ReleaseQueue) -> MutexGuard<'_, Vec<BufferId>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scoped ownership of a context's command stream; released on drop.
pub struct DispatchGuard<'a> {
    context: &'a Context,
    encoder: MutexGuard<'a, CommandEncoder>,
}

impl<'a> DispatchGuard<'a> {
    pub fn get_descriptor_set(
        &mut self,
        shader: &ShaderInfo,
        local_workgroup_size: UVec3,
    ) -> Result<DescriptorSet> {
        let backend = Arc::clone(&self.context.backend);
        let id = backend.allocate_descriptor_set(shader, local_workgroup_size)?;
        vk_trace!(
            "allocated descriptor set {:?} for {} local={}",
            id,
            shader.kernel_name(),
            local_workgroup_size
        );
        Ok(DescriptorSet {
            backend,
            id,
            shader: shader.clone(),
            local_workgroup_size,
            bindings: vec![None; shader.binding_count()],
            registered: false,
        })
    }

    /// Append the dispatch of `shader` over `global_workgroup_size` invocations.
    pub fn register_shader_dispatch(
        &mut self,
        descriptor_set: DescriptorSet,
        barrier: PipelineBarrier,
        shader: &ShaderInfo,
        global_workgroup_size: UVec3,
    ) -> Result<()> {
        if descriptor_set.shader != *shader {
            return Err(GraphError::binding(
                shader.kernel_name(),
                format!(
                    "descriptor set was allocated for '{}'",
                    descriptor_set.shader.kernel_name()
                ),
            )
            .into());
        }
        let local_workgroup_size = descriptor_set.local_workgroup_size;
        let (id, bindings) = descriptor_set.finish()?;
        vk_trace!(
            "register dispatch {} global={} local={} bindings={} barriers={}",
            shader.kernel_name(),
            global_workgroup_size,
            local_workgroup_size,
            bindings.len(),
            barrier.buffers().len()
        );
        self.encoder.descriptor_sets.push(id);
        self.encoder.commands.push(Command::Dispatch(DispatchCommand {
            shader: shader.clone(),
            descriptor_set: id,
            bindings,
            barrier,
            global_workgroup_size,
            local_workgroup_size,
        }));
        Ok(())
    }

    /// Append a copy of the first `size` bytes of `src` into `dst`.
    pub fn register_buffer_copy(
        &mut self,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        size: u64,
        barrier: PipelineBarrier,
    ) -> Result<()> {
        if size > src.size() || size > dst.size() {
            return Err(GraphError::ShapeMismatch(format!(
                "copy of {} bytes between buffers of {} and {} bytes",
                size,
                src.size(),
                dst.size()
            ))
            .into());
        }
        vk_trace!("register copy {:?} -> {:?} ({} bytes)", src.id(), dst.id(), size);
        self.encoder.commands.push(Command::CopyBuffer {
            src: src.id(),
            dst: dst.id(),
            size,
            barrier,
        });
        Ok(())
    }

    pub fn pending_commands(&self) -> usize {
        self.encoder.commands.len()
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.context.locks_released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Slots of one shader invocation, filled in the order the kernel declares them.
///
/// Dropping a set that never reached `register_shader_dispatch` returns it to the pool.
pub struct DescriptorSet {
    backend: Arc<dyn DeviceBackend>,
    id: DescriptorSetId,
    shader: ShaderInfo,
    local_workgroup_size: UVec3,
    bindings: Vec<Option<Binding>>,
    registered: bool,
}

impl DescriptorSet {
    pub fn id(&self) -> DescriptorSetId {
        self.id
    }

    pub fn slot_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.iter().filter(|binding| binding.is_some()).count()
    }

    pub fn bind_storage(
        &mut self,
        slot: u32,
        buffer: &DeviceBuffer,
        access: MemoryAccess,
    ) -> Result<()> {
        self.bind(slot, buffer, DescriptorKind::StorageBuffer, access)
    }

    pub fn bind_params(&mut self, slot: u32, params: &ParamsBuffer) -> Result<()> {
        self.bind(
            slot,
            params.buffer(),
            DescriptorKind::UniformBuffer,
            MemoryAccess::Read,
        )
    }

    fn bind(
        &mut self,
        slot: u32,
        buffer: &DeviceBuffer,
        kind: DescriptorKind,
        access: MemoryAccess,
    ) -> Result<()> {
        let name = self.shader.kernel_name();
        let expected = self.shader.layout().get(slot as usize).copied().ok_or_else(|| {
            GraphError::binding(
                name,
                format!("slot {} is outside its {} bindings", slot, self.bindings.len()),
            )
        })?;
        if expected != kind {
            return Err(GraphError::binding(
                name,
                format!("slot {} expects {:?}, got {:?}", slot, expected, kind),
            )
            .into());
        }
        let entry = &mut self.bindings[slot as usize];
        if entry.is_some() {
            return Err(GraphError::binding(name, format!("slot {} bound twice", slot)).into());
        }
        *entry = Some(Binding {
            slot,
            buffer: buffer.id(),
            range: buffer.size(),
            kind,
            access,
        });
        Ok(())
    }

    fn finish(mut self) -> Result<(DescriptorSetId, Vec<Binding>)> {
        let mut bindings = Vec::with_capacity(self.bindings.len());
        for (slot, binding) in self.bindings.iter().enumerate() {
            match binding {
                Some(binding) => bindings.push(*binding),
                None => {
                    return Err(GraphError::binding(
                        self.shader.kernel_name(),
                        format!(
                            "slot {} left unbound ({} of {} bound)",
                            slot,
                            self.bound_count(),
                            self.bindings.len()
                        ),
                    )
                    .into())
                }
            }
        }
        self.registered = true;
        Ok((self.id, bindings))
    }
}

impl fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("id", &self.id)
            .field("shader", &self.shader.kernel_name())
            .field("bound", &self.bound_count())
            .finish()
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        if !self.registered {
            self.backend.release_descriptor_set(self.id);
        }
    }
}
