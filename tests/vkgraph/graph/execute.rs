use std::sync::Arc;

use anyhow::Result;
use vkgraph::ops::ElementwiseParams;
use vkgraph::runtime::{BufferBarrier, DescriptorKind, DispatchCommand, LockStats};
use vkgraph::{
    ArgGroup, Context, DType, DeviceConfig, DeviceTensor, ExecuteNode, GpuMemoryLayout,
    GraphError, HostDevice, MemoryAccess, ParamsBuffer, ShaderInfo, ShaderRegistry, UVec3, Value,
    ValueRef, ValueStore,
};

use crate::common::{
    bytes_to_f32, f32_bytes, graph_error, host_context, reference_catalog, BINARY_LAYOUT,
    PACK_LAYOUT,
};

fn add_tensor(values: &mut ValueStore, context: &Context, data: &[f32]) -> Result<ValueRef> {
    let tensor = DeviceTensor::new(
        context,
        &[data.len()],
        DType::F32,
        GpuMemoryLayout::ChannelsPacked,
    )?;
    tensor.buffer().write(0, &f32_bytes(data))?;
    Ok(values.add(Value::Tensor(tensor)))
}

fn elementwise_node(
    context: &Context,
    shader: ShaderInfo,
    args: Vec<ArgGroup>,
    numel: usize,
) -> Result<ExecuteNode> {
    let params = ParamsBuffer::new(context, &ElementwiseParams::new(numel, DType::F32)?)?;
    Ok(ExecuteNode::new(
        shader,
        UVec3::new(numel as u32, 1, 1),
        UVec3::new(64, 1, 1),
        args,
        params,
    ))
}

fn read_f32(values: &ValueStore, value: ValueRef) -> Result<Vec<f32>> {
    Ok(bytes_to_f32(&values.tensor(value)?.buffer().read_to_vec()?))
}

fn dispatches(device: &HostDevice) -> Result<Vec<DispatchCommand>> {
    Ok(device
        .submitted_commands()?
        .iter()
        .filter_map(|command| command.as_dispatch().cloned())
        .collect())
}

#[test]
fn execute_binds_groups_then_params() -> Result<()> {
    let (device, context) = host_context(DeviceConfig::default())?;
    let shader = reference_catalog().get_shader_info("binary_add_f32")?;
    let mut values = ValueStore::new();
    let a = add_tensor(&mut values, &context, &[1.0, 2.0, 3.0, 4.0])?;
    let b = add_tensor(&mut values, &context, &[10.0, 20.0, 30.0, 40.0])?;
    let c = add_tensor(&mut values, &context, &[0.0; 4])?;
    let node = elementwise_node(
        &context,
        shader,
        vec![ArgGroup::read(vec![a, b]), ArgGroup::write(vec![c])],
        4,
    )?;
    assert_eq!(node.binding_count(), 4);

    node.encode(&mut values, &context)?;
    assert_eq!(
        context.lock_stats(),
        LockStats {
            acquired: 1,
            released: 1
        }
    );
    context.submit()?;

    let dispatches = dispatches(&device)?;
    assert_eq!(dispatches.len(), 1);
    let bindings = &dispatches[0].bindings;
    assert_eq!(bindings.len(), 4);
    let expected = [
        (values.tensor(a)?.buffer().id(), MemoryAccess::Read),
        (values.tensor(b)?.buffer().id(), MemoryAccess::Read),
        (values.tensor(c)?.buffer().id(), MemoryAccess::Write),
    ];
    for (binding, (buffer, access)) in bindings.iter().zip(expected) {
        assert_eq!(binding.buffer, buffer);
        assert_eq!(binding.access, access);
        assert_eq!(binding.kind, DescriptorKind::StorageBuffer);
    }
    assert_eq!(bindings[3].kind, DescriptorKind::UniformBuffer);
    assert_eq!(read_f32(&values, c)?, vec![11.0, 22.0, 33.0, 44.0]);
    Ok(())
}

#[test]
fn dependent_dispatch_gets_read_after_write_barrier() -> Result<()> {
    let (device, context) = host_context(DeviceConfig::default())?;
    let catalog = reference_catalog();
    let mut values = ValueStore::new();
    let a = add_tensor(&mut values, &context, &[1.0, 2.0])?;
    let b = add_tensor(&mut values, &context, &[3.0, 4.0])?;
    let c = add_tensor(&mut values, &context, &[0.0; 2])?;
    let d = add_tensor(&mut values, &context, &[0.0; 2])?;
    let add = elementwise_node(
        &context,
        catalog.get_shader_info("binary_add_f32")?,
        vec![ArgGroup::read(vec![a, b]), ArgGroup::write(vec![c])],
        2,
    )?;
    let mul = elementwise_node(
        &context,
        catalog.get_shader_info("binary_mul_f32")?,
        vec![ArgGroup::read(vec![c, a]), ArgGroup::write(vec![d])],
        2,
    )?;

    add.encode(&mut values, &context)?;
    mul.encode(&mut values, &context)?;
    context.submit()?;

    let dispatches = dispatches(&device)?;
    assert!(dispatches[0].barrier.is_empty());
    let c_id = values.tensor(c)?.buffer().id();
    assert_eq!(
        dispatches[1].barrier.buffers(),
        &[BufferBarrier {
            buffer: c_id,
            src_access: MemoryAccess::Write,
            dst_access: MemoryAccess::Read,
        }]
    );
    assert_eq!(read_f32(&values, d)?, vec![4.0, 12.0]);
    Ok(())
}

#[test]
fn unissued_handle_fails_before_any_dispatch() -> Result<()> {
    let (device, context) = host_context(DeviceConfig::default())?;
    let shader = reference_catalog().get_shader_info("binary_add_f32")?;
    let mut values = ValueStore::new();
    let a = add_tensor(&mut values, &context, &[1.0])?;
    let out = add_tensor(&mut values, &context, &[0.0])?;
    let missing = ValueRef::from_raw(values.id(), 42);
    let node = elementwise_node(
        &context,
        shader,
        vec![ArgGroup::read(vec![a, missing]), ArgGroup::write(vec![out])],
        1,
    )?;

    let err = node.check_args(&values).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::InvalidHandle { index: 42, .. }
    ));
    let err = node.encode(&mut values, &context).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::InvalidHandle { index: 42, .. }
    ));
    assert_eq!(context.pending_commands()?, 0);
    assert_eq!(context.lock_stats().acquired, context.lock_stats().released);
    assert_eq!(device.live_descriptor_sets()?, 0);
    Ok(())
}

#[test]
fn kind_mismatch_is_a_binding_violation() -> Result<()> {
    let (device, context) = host_context(DeviceConfig::default())?;
    // three storage tensors against a layout whose third slot is the uniform block
    let shader = reference_catalog().get_shader_info("nchw_to_buffer_f32")?;
    let mut values = ValueStore::new();
    let a = add_tensor(&mut values, &context, &[1.0])?;
    let b = add_tensor(&mut values, &context, &[2.0])?;
    let c = add_tensor(&mut values, &context, &[0.0])?;
    let node = elementwise_node(
        &context,
        shader,
        vec![ArgGroup::read(vec![a, b]), ArgGroup::write(vec![c])],
        1,
    )?;

    let err = node.encode(&mut values, &context).unwrap_err();
    match graph_error(&err) {
        GraphError::BindingContractViolation { shader, reason } => {
            assert_eq!(shader, "nchw_to_buffer_f32");
            assert!(reason.contains("slot 2"), "{}", reason);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(context.lock_stats().acquired, 1);
    assert_eq!(context.lock_stats().released, 1);
    assert_eq!(device.live_descriptor_sets()?, 0);
    Ok(())
}

#[test]
fn unbound_slot_is_a_binding_violation() -> Result<()> {
    let (_device, context) = host_context(DeviceConfig::default())?;
    let mut layout = BINARY_LAYOUT.to_vec();
    layout.push(DescriptorKind::StorageBuffer);
    let shader = ShaderInfo::new("binary_add_f32", layout);
    let mut values = ValueStore::new();
    let a = add_tensor(&mut values, &context, &[1.0])?;
    let b = add_tensor(&mut values, &context, &[2.0])?;
    let c = add_tensor(&mut values, &context, &[0.0])?;
    let node = elementwise_node(
        &context,
        shader,
        vec![ArgGroup::read(vec![a, b]), ArgGroup::write(vec![c])],
        1,
    )?;

    let err = node.encode(&mut values, &context).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::BindingContractViolation { .. }
    ));
    assert_eq!(context.pending_commands()?, 0);
    for value in [a, b, c] {
        assert_eq!(values.tensor(value)?.last_access(), None);
    }
    Ok(())
}

#[test]
fn failed_encode_leaves_access_history_untouched() -> Result<()> {
    let (_device, context) = host_context(DeviceConfig::default())?;
    let shader = ShaderInfo::new("unary_copy_f32", PACK_LAYOUT.to_vec());
    let mut values = ValueStore::new();
    let a = add_tensor(&mut values, &context, &[1.0])?;
    let missing = ValueRef::from_raw(values.id(), 42);
    let node = elementwise_node(
        &context,
        shader.clone(),
        vec![ArgGroup::write(vec![a]), ArgGroup::read(vec![missing])],
        1,
    )?;

    let err = node.encode(&mut values, &context).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::InvalidHandle { index: 42, .. }
    ));
    assert_eq!(values.tensor(a)?.last_access(), None);

    // a later reader of `a` sees no pending write
    let b = add_tensor(&mut values, &context, &[2.0])?;
    let reader = elementwise_node(
        &context,
        shader,
        vec![ArgGroup::read(vec![a]), ArgGroup::write(vec![b])],
        1,
    )?;
    reader.encode(&mut values, &context)?;
    assert_eq!(values.tensor(a)?.last_access(), Some(MemoryAccess::Read));
    assert_eq!(values.tensor(b)?.last_access(), Some(MemoryAccess::Write));
    Ok(())
}

#[test]
fn read_only_bindings_are_never_written_back() -> Result<()> {
    let device = Arc::new(HostDevice::new(DeviceConfig::default()));
    device.register_kernel("scribble", |slots: &mut [Vec<u8>], _: &DispatchCommand| {
        for slot in slots.iter_mut() {
            slot.fill(0xff);
        }
        Ok(())
    })?;
    let context = Context::new(device.clone());
    let shader = ShaderInfo::new("scribble", BINARY_LAYOUT.to_vec());
    let mut values = ValueStore::new();
    let a = add_tensor(&mut values, &context, &[1.0, 2.0])?;
    let b = add_tensor(&mut values, &context, &[3.0, 4.0])?;
    let c = add_tensor(&mut values, &context, &[0.0; 2])?;
    let node = elementwise_node(
        &context,
        shader,
        vec![ArgGroup::read(vec![a, b]), ArgGroup::write(vec![c])],
        2,
    )?;

    node.encode(&mut values, &context)?;
    context.submit()?;
    assert_eq!(read_f32(&values, a)?, vec![1.0, 2.0]);
    assert_eq!(read_f32(&values, b)?, vec![3.0, 4.0]);
    assert_eq!(values.tensor(c)?.buffer().read_to_vec()?, vec![0xff; 8]);
    Ok(())
}

#[test]
fn unknown_kernel_surfaces_at_submit() -> Result<()> {
    let (_device, context) = host_context(DeviceConfig::default())?;
    let shader = ShaderInfo::new("not_a_kernel", BINARY_LAYOUT.to_vec());
    let mut values = ValueStore::new();
    let a = add_tensor(&mut values, &context, &[1.0])?;
    let b = add_tensor(&mut values, &context, &[1.0])?;
    let c = add_tensor(&mut values, &context, &[1.0])?;
    let node = elementwise_node(
        &context,
        shader,
        vec![ArgGroup::read(vec![a, b]), ArgGroup::write(vec![c])],
        1,
    )?;

    node.encode(&mut values, &context)?;
    let err = context.submit().unwrap_err();
    assert_eq!(
        graph_error(&err),
        GraphError::UnknownShader("not_a_kernel".to_string())
    );
    assert_eq!(context.pending_commands()?, 0);
    Ok(())
}
