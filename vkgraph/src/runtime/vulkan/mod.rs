//! `DeviceBackend` over a real Vulkan device.
//!
//! Buffers live in host-visible, coherent memory so reads and writes map
//! directly. One descriptor-set layout is cached per shader and one compute
//! pipeline per (shader, local workgroup size); the local size reaches the
//! shader as specialization constants 0, 1 and 2.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use ash::{vk, Entry};

use crate::config::DeviceConfig;
use crate::error::GraphError;
use crate::{critical, vk_trace};

use super::{
    BufferBarrier, BufferId, BufferUsage, Command, DescriptorKind, DescriptorSetId, DeviceBackend,
    DispatchCommand, MemoryAccess, PipelineBarrier, ShaderInfo, UVec3,
};

const MIN_BUFFER_SIZE: u64 = 4;

struct VulkanBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
}

struct ShaderLayout {
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

#[derive(Default)]
struct VulkanState {
    buffers: HashMap<BufferId, VulkanBuffer>,
    next_buffer: u64,
    layouts: HashMap<String, ShaderLayout>,
    pipelines: HashMap<(String, UVec3), vk::Pipeline>,
    descriptor_sets: HashMap<DescriptorSetId, vk::DescriptorSet>,
    next_set: u64,
    memory_in_use: u64,
}

pub struct VulkanDevice {
    #[allow(dead_code)]
    entry: Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    config: DeviceConfig,
    supports_timestamps: bool,
    timestamp_period: f32,
    state: Mutex<VulkanState>,
}

// Every native handle is only touched while `state` is locked or during drop.
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}

impl VulkanDevice {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let entry = unsafe { Entry::load()? };
        vk_trace!("vulkan init: creating instance");
        let app_name = CString::new("vkgraph")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_1);
        let instance_info = vk::InstanceCreateInfo::builder().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_info, None)? };

        let physical_devices = unsafe { instance.enumerate_physical_devices()? };
        let (physical_device, queue_family_index) = physical_devices
            .iter()
            .find_map(|device| pick_compute_queue(&instance, *device))
            .ok_or_else(|| anyhow!("no Vulkan compute queue found"))?;
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let supported = unsafe { instance.get_physical_device_features(physical_device) };

        vk_trace!("vulkan init: creating device");
        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);
        let mut enabled = vk::PhysicalDeviceFeatures::default();
        enabled.shader_int64 = supported.shader_int64;
        enabled.shader_float64 = supported.shader_float64;
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_features(&enabled);
        let device = unsafe { instance.create_device(physical_device, &device_info, None)? };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let command_pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&command_pool_info, None)? };

        let limits = &config.descriptor_pool;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: limits.storage_buffers.max(1),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: limits.uniform_buffers.max(1),
            },
        ];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(limits.max_sets.max(1))
            .pool_sizes(&pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        let descriptor_pool =
            unsafe { device.create_descriptor_pool(&descriptor_pool_info, None)? };
        vk_trace!(
            "vulkan init: descriptor pool max_sets={} storage={} uniform={}",
            limits.max_sets,
            limits.storage_buffers,
            limits.uniform_buffers
        );

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue,
            command_pool,
            descriptor_pool,
            supports_timestamps: props.limits.timestamp_compute_and_graphics != 0,
            timestamp_period: props.limits.timestamp_period,
            config,
            state: Mutex::new(VulkanState::default()),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn state(&self) -> Result<MutexGuard<'_, VulkanState>> {
        self.state
            .lock()
            .map_err(|_| GraphError::LockPoisoned("vulkan device").into())
    }

    fn state_for_release(&self) -> MutexGuard<'_, VulkanState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn buffer_memory(&self, state: &VulkanState, buffer: BufferId) -> Result<(vk::DeviceMemory, u64)> {
        state
            .buffers
            .get(&buffer)
            .map(|b| (b.memory, b.size))
            .ok_or_else(|| anyhow!("vulkan buffer {:?} is not live", buffer))
    }

    fn shader_layout<'s>(
        &self,
        state: &'s mut VulkanState,
        shader: &ShaderInfo,
    ) -> Result<&'s ShaderLayout> {
        let name = shader.kernel_name().to_string();
        if !state.layouts.contains_key(&name) {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = shader
                .layout()
                .iter()
                .enumerate()
                .map(|(slot, kind)| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(slot as u32)
                        .descriptor_type(descriptor_type(*kind))
                        .descriptor_count(1)
                        .stage_flags(vk::ShaderStageFlags::COMPUTE)
                        .build()
                })
                .collect();
            let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
            let set_layout = unsafe {
                self.device
                    .create_descriptor_set_layout(&set_layout_info, None)
                    .map_err(|err| vk_error(err, "vkCreateDescriptorSetLayout"))?
            };
            let pipeline_layout_info = vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(std::slice::from_ref(&set_layout));
            let pipeline_layout = unsafe {
                self.device
                    .create_pipeline_layout(&pipeline_layout_info, None)
                    .map_err(|err| vk_error(err, "vkCreatePipelineLayout"))?
            };
            vk_trace!(
                "created layout for {} ({} bindings)",
                name,
                bindings.len()
            );
            state.layouts.insert(
                name.clone(),
                ShaderLayout {
                    set_layout,
                    pipeline_layout,
                },
            );
        }
        state
            .layouts
            .get(&name)
            .ok_or_else(|| anyhow!("layout for {} missing after creation", name))
    }

    fn pipeline(
        &self,
        state: &mut VulkanState,
        shader: &ShaderInfo,
        local: UVec3,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        let pipeline_layout = self.shader_layout(state, shader)?.pipeline_layout;
        let key = (shader.kernel_name().to_string(), local);
        if let Some(pipeline) = state.pipelines.get(&key) {
            return Ok((*pipeline, pipeline_layout));
        }
        let spirv = shader
            .spirv()
            .ok_or_else(|| anyhow!("shader {} has no SPIR-V module", shader.kernel_name()))?;
        let module_info = vk::ShaderModuleCreateInfo::builder().code(spirv);
        let module = unsafe {
            self.device
                .create_shader_module(&module_info, None)
                .map_err(|err| vk_error(err, "vkCreateShaderModule"))?
        };
        let entry = CString::new(shader.entry_point())
            .map_err(|_| anyhow!("invalid Vulkan entry point {}", shader.entry_point()))?;
        let spec_entries = [0u32, 1, 2].map(|id| vk::SpecializationMapEntry {
            constant_id: id,
            offset: id * 4,
            size: 4,
        });
        let spec_data: Vec<u8> = [local.x, local.y, local.z]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let spec_info = vk::SpecializationInfo::builder()
            .map_entries(&spec_entries)
            .data(&spec_data);
        let stage_info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry)
            .specialization_info(&spec_info)
            .build();
        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage_info)
            .layout(pipeline_layout);
        let created = unsafe {
            self.device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            )
        };
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipeline = created
            .map_err(|(_, err)| vk_error(err, "vkCreateComputePipelines"))?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no pipeline created for {}", shader.kernel_name()))?;
        vk_trace!("created pipeline {} local={}", shader.kernel_name(), local);
        state.pipelines.insert(key, pipeline);
        Ok((pipeline, pipeline_layout))
    }

    fn record_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        state: &VulkanState,
        barrier: &PipelineBarrier,
    ) -> Result<()> {
        if barrier.is_empty() {
            return Ok(());
        }
        let mut buffer_barriers = Vec::with_capacity(barrier.buffers().len());
        for BufferBarrier {
            buffer,
            src_access,
            dst_access,
        } in barrier.buffers()
        {
            let native = state
                .buffers
                .get(buffer)
                .ok_or_else(|| anyhow!("barrier on released buffer {:?}", buffer))?;
            buffer_barriers.push(
                vk::BufferMemoryBarrier::builder()
                    .src_access_mask(access_flags(*src_access))
                    .dst_access_mask(access_flags(*dst_access))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(native.buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build(),
            );
        }
        let stages = vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER;
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                stages,
                stages,
                vk::DependencyFlags::empty(),
                &[],
                &buffer_barriers,
                &[],
            );
        }
        Ok(())
    }

    fn record_dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        state: &mut VulkanState,
        dispatch: &DispatchCommand,
    ) -> Result<()> {
        let set = *state
            .descriptor_sets
            .get(&dispatch.descriptor_set)
            .ok_or_else(|| anyhow!("descriptor set {:?} is not live", dispatch.descriptor_set))?;
        let mut infos = Vec::with_capacity(dispatch.bindings.len());
        for binding in &dispatch.bindings {
            let native = state
                .buffers
                .get(&binding.buffer)
                .ok_or_else(|| anyhow!("binding of released buffer {:?}", binding.buffer))?;
            infos.push(vk::DescriptorBufferInfo {
                buffer: native.buffer,
                offset: 0,
                range: binding.range.max(MIN_BUFFER_SIZE),
            });
        }
        let writes: Vec<vk::WriteDescriptorSet> = dispatch
            .bindings
            .iter()
            .zip(infos.iter())
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding.slot)
                    .descriptor_type(descriptor_type(binding.kind))
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        let (pipeline, pipeline_layout) =
            self.pipeline(state, &dispatch.shader, dispatch.local_workgroup_size)?;
        self.record_barrier(command_buffer, state, &dispatch.barrier)?;
        let groups = dispatch
            .global_workgroup_size
            .div_up(dispatch.local_workgroup_size);
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline);
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline_layout,
                0,
                std::slice::from_ref(&set),
                &[],
            );
            self.device
                .cmd_dispatch(command_buffer, groups.x, groups.y, groups.z);
        }
        Ok(())
    }

    fn record_copy(
        &self,
        command_buffer: vk::CommandBuffer,
        state: &VulkanState,
        src: BufferId,
        dst: BufferId,
        size: u64,
        barrier: &PipelineBarrier,
    ) -> Result<()> {
        self.record_barrier(command_buffer, state, barrier)?;
        let lookup = |id: BufferId| {
            state
                .buffers
                .get(&id)
                .map(|b| b.buffer)
                .ok_or_else(|| anyhow!("copy involving released buffer {:?}", id))
        };
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        if size == 0 {
            return Ok(());
        }
        unsafe {
            self.device.cmd_copy_buffer(
                command_buffer,
                lookup(src)?,
                lookup(dst)?,
                std::slice::from_ref(&region),
            );
        }
        Ok(())
    }

    fn record_and_wait(&self, state: &mut VulkanState, commands: &[Command]) -> Result<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(|err| vk_error(err, "vkAllocateCommandBuffers"))?
        }
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("failed to allocate command buffer"))?;

        struct Scoped<'a> {
            device: &'a ash::Device,
            pool: vk::CommandPool,
            command_buffer: vk::CommandBuffer,
            fence: vk::Fence,
            query_pool: Option<vk::QueryPool>,
        }

        impl Drop for Scoped<'_> {
            fn drop(&mut self) {
                unsafe {
                    if let Some(pool) = self.query_pool {
                        self.device.destroy_query_pool(pool, None);
                    }
                    if self.fence != vk::Fence::null() {
                        self.device.destroy_fence(self.fence, None);
                    }
                    self.device
                        .free_command_buffers(self.pool, std::slice::from_ref(&self.command_buffer));
                }
            }
        }

        let mut scoped = Scoped {
            device: &self.device,
            pool: self.command_pool,
            command_buffer,
            fence: vk::Fence::null(),
            query_pool: None,
        };
        if self.config.enable_timestamps && self.supports_timestamps {
            let info = vk::QueryPoolCreateInfo::builder()
                .query_type(vk::QueryType::TIMESTAMP)
                .query_count(2);
            scoped.query_pool = Some(unsafe {
                self.device
                    .create_query_pool(&info, None)
                    .map_err(|err| vk_error(err, "vkCreateQueryPool"))?
            });
        }

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(|err| vk_error(err, "vkBeginCommandBuffer"))?;
            let host_barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::HOST_WRITE)
                .dst_access_mask(
                    vk::AccessFlags::SHADER_READ
                        | vk::AccessFlags::SHADER_WRITE
                        | vk::AccessFlags::TRANSFER_READ,
                )
                .build();
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                std::slice::from_ref(&host_barrier),
                &[],
                &[],
            );
            if let Some(pool) = scoped.query_pool {
                self.device.cmd_reset_query_pool(command_buffer, pool, 0, 2);
                self.device.cmd_write_timestamp(
                    command_buffer,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    pool,
                    0,
                );
            }
        }

        for command in commands {
            match command {
                Command::Dispatch(dispatch) => self.record_dispatch(command_buffer, state, dispatch)?,
                Command::CopyBuffer {
                    src,
                    dst,
                    size,
                    barrier,
                } => self.record_copy(command_buffer, state, *src, *dst, *size, barrier)?,
            }
        }

        unsafe {
            let host_barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ)
                .build();
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                std::slice::from_ref(&host_barrier),
                &[],
                &[],
            );
            if let Some(pool) = scoped.query_pool {
                self.device.cmd_write_timestamp(
                    command_buffer,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    pool,
                    1,
                );
            }
            self.device
                .end_command_buffer(command_buffer)
                .map_err(|err| vk_error(err, "vkEndCommandBuffer"))?;

            let fence_info = vk::FenceCreateInfo::builder();
            scoped.fence = self
                .device
                .create_fence(&fence_info, None)
                .map_err(|err| vk_error(err, "vkCreateFence"))?;
            let submit_info =
                vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&command_buffer));
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&submit_info), scoped.fence)
                .map_err(|err| vk_error(err, "vkQueueSubmit"))?;
            self.device
                .wait_for_fences(std::slice::from_ref(&scoped.fence), true, u64::MAX)
                .map_err(|err| vk_error(err, "vkWaitForFences"))?;
        }

        if let Some(pool) = scoped.query_pool {
            let mut timestamps = [0u64; 2];
            unsafe {
                self.device
                    .get_query_pool_results(
                        pool,
                        0,
                        2,
                        &mut timestamps,
                        vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                    )
                    .map_err(|err| vk_error(err, "vkGetQueryPoolResults"))?;
            }
            let delta = timestamps[1].saturating_sub(timestamps[0]) as f64;
            vk_trace!(
                "submission of {} commands took {} ns",
                commands.len(),
                (delta * self.timestamp_period as f64) as u128
            );
        }
        Ok(())
    }

    fn free_buffer(&self, state: &mut VulkanState, id: BufferId) {
        if let Some(buffer) = state.buffers.remove(&id) {
            unsafe {
                self.device.destroy_buffer(buffer.buffer, None);
                self.device.free_memory(buffer.memory, None);
            }
            state.memory_in_use = state.memory_in_use.saturating_sub(buffer.size);
            vk_trace!("freed vulkan buffer {:?} ({} bytes)", id, buffer.size);
        }
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("config", &self.config)
            .field("supports_timestamps", &self.supports_timestamps)
            .finish()
    }
}

impl DeviceBackend for VulkanDevice {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn allocate_buffer(&self, size: u64, usage: BufferUsage) -> Result<BufferId> {
        let mut state = self.state()?;
        let size = size.max(MIN_BUFFER_SIZE);
        if let Some(limit) = self.config.memory_limit_bytes {
            if state.memory_in_use.saturating_add(size) > limit {
                return Err(GraphError::OutOfDeviceMemory(format!(
                    "allocating {} bytes with {} of {} bytes in use",
                    size, state.memory_in_use, limit
                ))
                .into());
            }
        }
        let usage_flags = match usage {
            BufferUsage::Storage | BufferUsage::Staging => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        };
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(|err| vk_error(err, "vkCreateBuffer"))?
        };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = match find_memory_type(
            &self.instance,
            self.physical_device,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) {
            Ok(index) => index,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { self.device.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(vk_error(err, "vkAllocateMemory"));
            }
        };
        if let Err(err) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            return Err(vk_error(err, "vkBindBufferMemory"));
        }
        state.next_buffer += 1;
        let id = BufferId(state.next_buffer);
        state.buffers.insert(
            id,
            VulkanBuffer {
                buffer,
                memory,
                size,
            },
        );
        state.memory_in_use += size;
        vk_trace!("allocated vulkan buffer {:?} size={} usage={:?}", id, size, usage);
        Ok(id)
    }

    fn release_buffer(&self, buffer: BufferId) {
        let mut state = self.state_for_release();
        self.free_buffer(&mut state, buffer);
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let state = self.state()?;
        let (memory, size) = self.buffer_memory(&state, buffer)?;
        if offset + bytes.len() as u64 > size {
            return Err(GraphError::ShapeMismatch(format!(
                "write of {} bytes at offset {} exceeds vulkan buffer of {} bytes",
                bytes.len(),
                offset,
                size
            ))
            .into());
        }
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, offset, bytes.len() as u64, vk::MemoryMapFlags::empty())
                .map_err(|err| vk_error(err, "vkMapMemory"))?;
            if ptr.is_null() {
                return Err(anyhow!("vulkan map_memory returned null pointer"));
            }
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let state = self.state()?;
        let (memory, size) = self.buffer_memory(&state, buffer)?;
        if offset + out.len() as u64 > size {
            return Err(GraphError::ShapeMismatch(format!(
                "read of {} bytes at offset {} exceeds vulkan buffer of {} bytes",
                out.len(),
                offset,
                size
            ))
            .into());
        }
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, offset, out.len() as u64, vk::MemoryMapFlags::empty())
                .map_err(|err| vk_error(err, "vkMapMemory"))?;
            if ptr.is_null() {
                return Err(anyhow!("vulkan map_memory returned null pointer"));
            }
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), out.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        shader: &ShaderInfo,
        _local_workgroup_size: UVec3,
    ) -> Result<DescriptorSetId> {
        let mut state = self.state()?;
        let set_layout = self.shader_layout(&mut state, shader)?.set_layout;
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(std::slice::from_ref(&set_layout));
        let set = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|err| vk_error(err, "vkAllocateDescriptorSets"))?
        }
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("failed to allocate descriptor set"))?;
        state.next_set += 1;
        let id = DescriptorSetId(state.next_set);
        state.descriptor_sets.insert(id, set);
        Ok(id)
    }

    fn release_descriptor_set(&self, set: DescriptorSetId) {
        let mut state = self.state_for_release();
        if let Some(native) = state.descriptor_sets.remove(&set) {
            let freed = unsafe {
                self.device
                    .free_descriptor_sets(self.descriptor_pool, std::slice::from_ref(&native))
            };
            if let Err(err) = freed {
                vk_trace!("failed to free descriptor set {:?}: {:?}", set, err);
            }
        }
    }

    fn submit(&self, commands: &[Command]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut state = self.state()?;
        self.record_and_wait(&mut state, commands)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            let state = self
                .state
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for pipeline in state.pipelines.values() {
                self.device.destroy_pipeline(*pipeline, None);
            }
            for layout in state.layouts.values() {
                self.device
                    .destroy_pipeline_layout(layout.pipeline_layout, None);
                self.device
                    .destroy_descriptor_set_layout(layout.set_layout, None);
            }
            for buffer in state.buffers.values() {
                self.device.destroy_buffer(buffer.buffer, None);
                self.device.free_memory(buffer.memory, None);
            }
            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
    }
}

fn access_flags(access: MemoryAccess) -> vk::AccessFlags {
    match access {
        MemoryAccess::Read => vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ,
        MemoryAccess::Write => vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE,
    }
}

/// Out-of-memory results become `OutOfDeviceMemory`; everything else stays opaque.
fn vk_error(result: vk::Result, what: &str) -> anyhow::Error {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY
        | vk::Result::ERROR_FRAGMENTED_POOL => {
            GraphError::OutOfDeviceMemory(format!("{} returned {:?}", what, result)).into()
        }
        vk::Result::ERROR_DEVICE_LOST => {
            critical!("{} reported device lost", what);
            anyhow!("{} failed: {:?}", what, result)
        }
        other => anyhow!("{} failed: {:?}", what, other),
    }
}

fn pick_compute_queue(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> Option<(vk::PhysicalDevice, u32)> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    families
        .iter()
        .enumerate()
        .find(|(_, family)| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|(index, _)| (device, index as u32))
}

fn find_memory_type(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    (0..props.memory_type_count)
        .find(|i| {
            (type_bits & (1 << i)) != 0
                && props.memory_types[*i as usize].property_flags.contains(flags)
        })
        .ok_or_else(|| anyhow!("failed to find a host-visible coherent Vulkan memory type"))
}
