use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use vkgraph::ops::{ElementwiseParams, PackParams};
use vkgraph::runtime::{BufferId, BufferUsage, Command, DescriptorSetId, DeviceBuffer, LockStats};
use vkgraph::{
    ArgGroup, Context, DType, DeviceBackend, DeviceConfig, DeviceTensor, ExecuteNode,
    GpuMemoryLayout, HostData, HostDevice, ParamsBuffer, PrepackNode, ShaderInfo,
    ShaderRegistry, TensorRef, UVec3, Value, ValueRef, ValueStore,
};

use crate::common::{bytes_to_f32, f32_bytes, host_context, host_device, reference_catalog};

const THREADS: usize = 4;
const NODES_PER_THREAD: usize = 25;

struct Encoded {
    values: ValueStore,
    out: ValueRef,
    expected: Vec<f32>,
}

fn tensor(values: &mut ValueStore, context: &Context, data: &[f32]) -> Result<ValueRef> {
    let tensor = DeviceTensor::new(
        context,
        &[data.len()],
        DType::F32,
        GpuMemoryLayout::WidthPacked,
    )?;
    tensor.buffer().write(0, &f32_bytes(data))?;
    Ok(values.add(Value::Tensor(tensor)))
}

/// Chain of `next = cur + step` nodes alternating between two tensors, in a store of its own.
fn encode_chain(context: &Context, seed: usize) -> Result<Encoded> {
    let shader = reference_catalog().get_shader_info("binary_add_f32")?;
    let mut values = ValueStore::new();
    let step = vec![seed as f32 + 1.0; 4];
    let mut cur = tensor(&mut values, context, &[0.0; 4])?;
    let mut next = tensor(&mut values, context, &[0.0; 4])?;
    let step_ref = tensor(&mut values, context, &step)?;
    for _ in 0..NODES_PER_THREAD {
        let params = ParamsBuffer::new(context, &ElementwiseParams::new(4, DType::F32)?)?;
        let node = ExecuteNode::new(
            shader.clone(),
            UVec3::new(4, 1, 1),
            UVec3::new(64, 1, 1),
            vec![ArgGroup::read(vec![cur, step_ref]), ArgGroup::write(vec![next])],
            params,
        );
        node.encode(&mut values, context)?;
        std::mem::swap(&mut cur, &mut next);
    }
    Ok(Encoded {
        values,
        out: cur,
        expected: vec![(seed as f32 + 1.0) * NODES_PER_THREAD as f32; 4],
    })
}

#[test]
fn concurrent_encoders_share_one_context() -> Result<()> {
    let (device, context) = host_context(DeviceConfig::default())?;

    let encoded: Vec<Encoded> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|seed| {
                let context = Arc::clone(&context);
                scope.spawn(move || encode_chain(&context, seed))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("encoder thread panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    assert_eq!(
        context.lock_stats(),
        LockStats {
            acquired: THREADS * NODES_PER_THREAD,
            released: THREADS * NODES_PER_THREAD,
        }
    );
    assert_eq!(context.pending_commands()?, THREADS * NODES_PER_THREAD);

    context.submit()?;
    assert_eq!(device.submitted_commands()?.len(), THREADS * NODES_PER_THREAD);
    for encoded in &encoded {
        let out = encoded.values.tensor(encoded.out)?.buffer().read_to_vec()?;
        assert_eq!(bytes_to_f32(&out), encoded.expected);
    }
    Ok(())
}

#[test]
fn guard_serializes_registration() -> Result<()> {
    let (_device, context) = host_context(DeviceConfig::default())?;
    let guard = context.dispatch_lock()?;
    assert_eq!(guard.pending_commands(), 0);

    thread::scope(|scope| {
        let waiter = scope.spawn(|| -> Result<usize> {
            let guard = context.dispatch_lock()?;
            Ok(guard.pending_commands())
        });
        // the waiter cannot take the lock until this guard is gone
        assert_eq!(context.lock_stats().acquired, 1);
        drop(guard);
        waiter.join().expect("waiter panicked")
    })?;

    assert_eq!(
        context.lock_stats(),
        LockStats {
            acquired: 2,
            released: 2
        }
    );
    Ok(())
}

#[test]
fn dropped_buffers_are_freed_by_the_next_submit() -> Result<()> {
    let (device, context) = host_context(DeviceConfig::default())?;
    let buffer = DeviceBuffer::new(&context, 64, BufferUsage::Staging)?;
    let id = buffer.id();
    drop(buffer);

    assert_eq!(context.pending_releases()?, 1);
    assert_eq!(device.live_buffers()?, 1);
    let mut out = [0u8; 4];
    device.read_buffer(id, 0, &mut out)?;

    context.submit()?;
    assert_eq!(context.pending_releases()?, 0);
    assert_eq!(device.live_buffers()?, 0);
    assert_eq!(device.memory_in_use()?, 0);
    Ok(())
}

/// Host device whose next submit parks until the test lets it continue.
#[derive(Debug)]
struct GatedDevice {
    inner: Arc<HostDevice>,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl DeviceBackend for GatedDevice {
    fn name(&self) -> &str {
        "gated-host"
    }

    fn allocate_buffer(&self, size: u64, usage: BufferUsage) -> Result<BufferId> {
        self.inner.allocate_buffer(size, usage)
    }

    fn release_buffer(&self, buffer: BufferId) {
        self.inner.release_buffer(buffer)
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, bytes: &[u8]) -> Result<()> {
        self.inner.write_buffer(buffer, offset, bytes)
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> Result<()> {
        self.inner.read_buffer(buffer, offset, out)
    }

    fn allocate_descriptor_set(
        &self,
        shader: &ShaderInfo,
        local_workgroup_size: UVec3,
    ) -> Result<DescriptorSetId> {
        self.inner.allocate_descriptor_set(shader, local_workgroup_size)
    }

    fn release_descriptor_set(&self, set: DescriptorSetId) {
        self.inner.release_descriptor_set(set)
    }

    fn submit(&self, commands: &[Command]) -> Result<()> {
        let gate = self
            .gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((entered, proceed)) = gate {
            entered.send(())?;
            proceed.recv()?;
        }
        self.inner.submit(commands)
    }
}

#[test]
fn staging_outlives_a_submit_already_in_flight() -> Result<()> {
    let inner = host_device(DeviceConfig::default())?;
    let (entered_tx, entered_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    let context = Context::new(Arc::new(GatedDevice {
        inner,
        gate: Mutex::new(Some((entered_tx, proceed_rx))),
    }));

    let mut values = ValueStore::new();
    let tref = values.add(Value::TensorRef(TensorRef::new(
        vec![4],
        DType::F32,
        HostData::from(f32_bytes(&[1.0, 2.0, 3.0, 4.0])),
    )));
    let layout = GpuMemoryLayout::WidthPacked;
    let packed = values.add(Value::Tensor(DeviceTensor::new(
        &context,
        &[4],
        DType::F32,
        layout,
    )?));
    let node = PrepackNode::new(
        reference_catalog().get_shader_info("nchw_to_buffer_f32")?,
        UVec3::new(4, 1, 1),
        UVec3::new(64, 1, 1),
        tref,
        packed,
        ParamsBuffer::new(&context, &PackParams::new(&[4], layout, DType::F32)?)?,
    );

    thread::scope(|scope| -> Result<()> {
        // an empty submit is parked inside the device while the node is encoded
        let parked = scope.spawn(|| context.submit());
        entered_rx.recv()?;
        node.encode(&mut values, &context)?;
        proceed_tx.send(())?;
        parked.join().expect("submitting thread panicked")
    })?;

    assert_eq!(context.pending_releases()?, 1);
    context.submit()?;
    assert_eq!(
        bytes_to_f32(&values.tensor(packed)?.buffer().read_to_vec()?),
        vec![1.0, 2.0, 3.0, 4.0]
    );
    assert_eq!(context.pending_releases()?, 0);
    Ok(())
}
