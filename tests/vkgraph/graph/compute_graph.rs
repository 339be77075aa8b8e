use anyhow::Result;
use vkgraph::ops::{self, BinaryOp, ElementwiseParams};
use vkgraph::{
    ArgGroup, DType, ExecuteNode, GpuMemoryLayout, GraphConfig, GraphError, ShaderRegistry,
    TypeTag, UVec3, Value, ValueRef,
};

use crate::common::{
    bytes_to_f32, bytes_to_i32, checksum, f32_bytes, graph_error, host_graph, i32_bytes,
    reference_catalog,
};

#[test]
fn prepare_once_then_execute_many() -> Result<()> {
    let catalog = reference_catalog();
    let (device, mut graph) = host_graph(GraphConfig::default())?;
    let weight = graph.add_tensorref(
        &[2, 4],
        DType::F32,
        f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
    );
    let packed = ops::prepack_constant(&mut graph, &catalog, weight, GpuMemoryLayout::WidthPacked)?;
    let input = graph.add_input_tensor(&[2, 4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    let out = graph.add_tensor(&[2, 4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    ops::add_binary_op(&mut graph, &catalog, BinaryOp::Add, input.value, packed, out)?;
    let out_staging = graph.set_output_tensor(out, true)?;
    let input_staging = input.staging.expect("input staging");

    graph.prepare()?;
    assert!(graph.is_prepared());
    let packed_sum = checksum(&graph.values().tensor(packed)?.buffer().read_to_vec()?);

    for step in 0..3 {
        let x: Vec<f32> = (0..8).map(|i| (i * step) as f32).collect();
        graph.copy_into_staging(input_staging, &f32_bytes(&x))?;
        graph.execute()?;

        let mut result = vec![0u8; 32];
        graph.copy_from_staging(out_staging, &mut result)?;
        let expected: Vec<f32> = x.iter().enumerate().map(|(i, v)| v + (i + 1) as f32).collect();
        assert_eq!(bytes_to_f32(&result), expected, "step {}", step);
    }

    let after = checksum(&graph.values().tensor(packed)?.buffer().read_to_vec()?);
    assert_eq!(packed_sum, after);
    // one prepack submission plus one per execute
    assert_eq!(graph.context().submissions(), 4);
    assert_eq!(device.submissions()?, 4);
    let stats = graph.context().lock_stats();
    assert_eq!(stats.acquired, stats.released);
    Ok(())
}

#[test]
fn execute_registers_copies_around_nodes() -> Result<()> {
    let catalog = reference_catalog();
    let (device, mut graph) = host_graph(GraphConfig::default())?;
    let lhs = graph.add_input_tensor(&[4], DType::I32, GpuMemoryLayout::WidthPacked)?;
    let rhs = graph.add_input_tensor(&[4], DType::I32, GpuMemoryLayout::WidthPacked)?;
    let out = graph.add_tensor(&[4], DType::I32, GpuMemoryLayout::WidthPacked)?;
    ops::add_binary_op(&mut graph, &catalog, BinaryOp::Sub, lhs.value, rhs.value, out)?;
    let out_staging = graph.set_output_tensor(out, true)?;

    graph.copy_into_staging(lhs.staging.expect("lhs staging"), &i32_bytes(&[5, 6, 7, 8]))?;
    graph.copy_into_staging(rhs.staging.expect("rhs staging"), &i32_bytes(&[1, 1, 1, i32::MIN]))?;
    graph.execute()?;

    let commands = device.submitted_commands()?;
    let kinds: Vec<bool> = commands.iter().map(|c| c.as_dispatch().is_some()).collect();
    assert_eq!(kinds, vec![false, false, true, false]);

    let mut result = vec![0u8; 16];
    graph.copy_from_staging(out_staging, &mut result)?;
    assert_eq!(
        bytes_to_i32(&result),
        vec![4, 5, 6, 8i32.wrapping_sub(i32::MIN)]
    );
    Ok(())
}

#[test]
fn execute_before_prepare_is_rejected() -> Result<()> {
    let catalog = reference_catalog();
    let (device, mut graph) = host_graph(GraphConfig::default())?;
    let tref = graph.add_tensorref(&[4], DType::F32, f32_bytes(&[1.0; 4]));
    ops::prepack_constant(&mut graph, &catalog, tref, GpuMemoryLayout::WidthPacked)?;

    let err = graph.execute().unwrap_err();
    assert_eq!(graph_error(&err), GraphError::NotPrepared);
    assert!(device.submitted_commands()?.is_empty());
    Ok(())
}

#[test]
fn graph_without_prepack_nodes_executes_directly() -> Result<()> {
    let catalog = reference_catalog();
    let (_device, mut graph) = host_graph(GraphConfig::default())?;
    let a = graph.add_tensor(&[4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    let b = graph.add_tensor(&[4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    ops::add_binary_op(&mut graph, &catalog, BinaryOp::Mul, a, a, b)?;
    graph.execute()?;
    assert!(graph.is_prepared());
    Ok(())
}

#[test]
fn prepare_runs_once() -> Result<()> {
    let catalog = reference_catalog();
    let (_device, mut graph) = host_graph(GraphConfig::default())?;
    let tref = graph.add_tensorref(&[4], DType::F32, f32_bytes(&[1.0; 4]));
    ops::prepack_constant(&mut graph, &catalog, tref, GpuMemoryLayout::WidthPacked)?;
    graph.prepare()?;
    graph.prepare()?;
    assert_eq!(graph.context().submissions(), 1);
    assert_eq!(graph.context().lock_stats().acquired, 1);
    Ok(())
}

#[test]
fn prepack_nodes_added_after_prepare_are_uploaded_next_time() -> Result<()> {
    let catalog = reference_catalog();
    let (_device, mut graph) = host_graph(GraphConfig::default())?;
    let first = graph.add_tensorref(&[4], DType::F32, f32_bytes(&[1.0; 4]));
    ops::prepack_constant(&mut graph, &catalog, first, GpuMemoryLayout::WidthPacked)?;
    graph.prepare()?;
    assert_eq!(graph.context().lock_stats().acquired, 1);

    let second = graph.add_tensorref(&[4], DType::F32, f32_bytes(&[7.0; 4]));
    let packed = ops::prepack_constant(&mut graph, &catalog, second, GpuMemoryLayout::WidthPacked)?;
    assert!(!graph.is_prepared());
    let err = graph.execute().unwrap_err();
    assert_eq!(graph_error(&err), GraphError::NotPrepared);

    graph.prepare()?;
    assert!(graph.is_prepared());
    // only the new node is encoded
    assert_eq!(graph.context().lock_stats().acquired, 2);
    assert_eq!(graph.context().submissions(), 2);
    let out = ops::read_tensor(&mut graph, &catalog, packed)?;
    assert_eq!(bytes_to_f32(&out), vec![7.0; 4]);
    Ok(())
}

#[test]
fn prepare_can_release_host_data() -> Result<()> {
    let catalog = reference_catalog();
    let config = GraphConfig {
        release_host_data_after_prepack: true,
        ..GraphConfig::default()
    };
    let (_device, mut graph) = host_graph(config)?;
    let tref = graph.add_tensorref(&[4], DType::F32, f32_bytes(&[1.0, 2.0, 3.0, 4.0]));
    let packed = ops::prepack_constant(&mut graph, &catalog, tref, GpuMemoryLayout::WidthPacked)?;
    graph.prepare()?;

    assert!(graph.values().tensor_ref(tref)?.data.is_released());
    let restored = ops::read_tensor(&mut graph, &catalog, packed)?;
    assert_eq!(bytes_to_f32(&restored), vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn failed_prepare_discards_partial_work() -> Result<()> {
    let catalog = reference_catalog();
    let (device, mut graph) = host_graph(GraphConfig::default())?;
    let good = graph.add_tensorref(&[4], DType::F32, f32_bytes(&[1.0; 4]));
    ops::prepack_constant(&mut graph, &catalog, good, GpuMemoryLayout::WidthPacked)?;
    // second node stages eight elements into a four element tensor
    let big = graph.add_tensorref(&[8], DType::F32, f32_bytes(&[2.0; 8]));
    let small = graph.add_tensor(&[4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    let node = {
        let shader = catalog.get_shader_info("nchw_to_buffer_f32")?;
        let params = vkgraph::ParamsBuffer::new(
            graph.context(),
            &ops::PackParams::new(&[4], GpuMemoryLayout::WidthPacked, DType::F32)?,
        )?;
        vkgraph::PrepackNode::new(shader, UVec3::new(4, 1, 1), UVec3::new(64, 1, 1), big, small, params)
    };
    graph.add_node(node);

    let err = graph.prepare().unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::ShapeMismatch(_)));
    assert!(!graph.is_prepared());
    assert_eq!(graph.context().pending_commands()?, 0);
    assert!(device.submitted_commands()?.is_empty());
    let stats = graph.context().lock_stats();
    assert_eq!((stats.acquired, stats.released), (2, 2));
    Ok(())
}

#[test]
fn execute_with_unissued_handle_registers_nothing() -> Result<()> {
    let catalog = reference_catalog();
    let (device, mut graph) = host_graph(GraphConfig::default())?;
    let a = graph.add_tensor(&[4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    let b = graph.add_tensor(&[4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    ops::add_binary_op(&mut graph, &catalog, BinaryOp::Add, a, a, b)?;
    let missing = ValueRef::from_raw(graph.values().id(), 1000);
    let params = vkgraph::ParamsBuffer::new(graph.context(), &ElementwiseParams::new(4, DType::F32)?)?;
    graph.add_node(ExecuteNode::new(
        catalog.get_shader_info("binary_add_f32")?,
        UVec3::new(4, 1, 1),
        UVec3::new(64, 1, 1),
        vec![ArgGroup::read(vec![a, missing]), ArgGroup::write(vec![b])],
        params,
    ));

    let err = graph.execute().unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::InvalidHandle { index: 1000, .. }
    ));
    assert_eq!(graph.context().pending_commands()?, 0);
    assert_eq!(graph.context().lock_stats().acquired, 0);
    assert!(device.submitted_commands()?.is_empty());
    Ok(())
}

#[test]
fn staged_io_requires_unpadded_layout() -> Result<()> {
    let (_device, mut graph) = host_graph(GraphConfig::default())?;
    let err = graph
        .add_input_tensor(&[2, 3], DType::F32, GpuMemoryLayout::WidthPacked)
        .unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::ShapeMismatch(_)));

    let padded = graph.add_tensor(&[3], DType::F32, GpuMemoryLayout::WidthPacked)?;
    assert_eq!(graph.set_output_tensor(padded, false)?, padded);
    assert_eq!(graph.outputs().len(), 1);
    assert!(graph.set_output_tensor(padded, true).is_err());
    Ok(())
}

#[test]
fn staging_copies_are_bounds_checked() -> Result<()> {
    let (_device, mut graph) = host_graph(GraphConfig::default())?;
    let io = graph.add_input_tensor(&[4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    let staging = io.staging.expect("staging");
    let err = graph
        .copy_into_staging(staging, &f32_bytes(&[0.0; 5]))
        .unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::ShapeMismatch(_)));
    let err = graph.copy_into_staging(io.value, &[0u8; 4]).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::TypeMismatch {
            expected: TypeTag::Staging,
            actual: TypeTag::Tensor,
            ..
        }
    ));
    Ok(())
}

#[test]
fn value_queries_cover_every_kind() -> Result<()> {
    let (_device, mut graph) = host_graph(GraphConfig::default())?;
    let tensor = graph.add_tensor_default(&[2, 2], DType::I32)?;
    let tref = graph.add_tensorref(&[3], DType::F32, f32_bytes(&[0.0; 3]));
    let staging = graph.add_staging(DType::U8, 5)?;
    let int = graph.add_int(3);
    let double = graph.add_double(1.5);
    let flag = graph.add_bool(true);
    let params = graph.add_params(&ElementwiseParams::new(4, DType::F32)?)?;

    assert_eq!(graph.get_val_sizes(tensor)?, vec![2, 2]);
    assert_eq!(graph.get_val_sizes(tref)?, vec![3]);
    assert_eq!(graph.get_val_sizes(staging)?, vec![5]);
    assert_eq!(graph.get_val_dtype(tensor)?, DType::I32);
    assert_eq!(graph.get_val_dtype(staging)?, DType::U8);
    assert_eq!(graph.values().int(int)?, 3);
    assert_eq!(graph.values().double(double)?, 1.5);
    assert!(graph.values().bool(flag)?);
    assert_eq!(graph.values().params(params)?.nbytes(), 16);
    assert!(matches!(graph.get_val(params)?, Value::Params(_)));

    let err = graph.get_val_sizes(int).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::TypeMismatch {
            actual: TypeTag::Int,
            ..
        }
    ));
    assert_eq!(graph.values().len(), 7);
    Ok(())
}

#[test]
fn nodes_are_partitioned_by_kind() -> Result<()> {
    let catalog = reference_catalog();
    let (_device, mut graph) = host_graph(GraphConfig::default())?;
    let tref = graph.add_tensorref(&[4], DType::F32, f32_bytes(&[1.0; 4]));
    let packed = ops::prepack_constant(&mut graph, &catalog, tref, GpuMemoryLayout::WidthPacked)?;
    let out = graph.add_tensor(&[4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    ops::add_binary_op(&mut graph, &catalog, BinaryOp::Add, packed, packed, out)?;

    assert_eq!(graph.prepack_nodes().len(), 1);
    assert_eq!(graph.execute_nodes().len(), 1);
    assert_eq!(graph.prepack_nodes()[0].packed(), packed);
    assert_eq!(graph.execute_nodes()[0].args().len(), 2);
    Ok(())
}

#[test]
fn binary_op_rejects_mismatched_operands() -> Result<()> {
    let catalog = reference_catalog();
    let (_device, mut graph) = host_graph(GraphConfig::default())?;
    let a = graph.add_tensor(&[4], DType::F32, GpuMemoryLayout::WidthPacked)?;
    let b = graph.add_tensor(&[8], DType::F32, GpuMemoryLayout::WidthPacked)?;
    let c = graph.add_tensor(&[4], DType::I32, GpuMemoryLayout::WidthPacked)?;
    let err = ops::add_binary_op(&mut graph, &catalog, BinaryOp::Add, a, b, a).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::ShapeMismatch(_)));
    let err = ops::add_binary_op(&mut graph, &catalog, BinaryOp::Add, a, c, a).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::ShapeMismatch(_)));

    let half = graph.add_tensor(&[4], DType::F16, GpuMemoryLayout::WidthPacked)?;
    let err = ops::add_binary_op(&mut graph, &catalog, BinaryOp::Add, half, half, half).unwrap_err();
    assert_eq!(
        graph_error(&err),
        GraphError::UnknownShader("binary_add_f16".to_string())
    );
    assert!(graph.execute_nodes().is_empty());
    Ok(())
}
