use std::sync::Arc;

use anyhow::Result;
use bytemuck::Pod;

use crate::config::GraphConfig;
use crate::error::GraphError;
use crate::runtime::{Context, MemoryAccess, ParamsBuffer, PipelineBarrier};
use crate::tensor::{DType, GpuMemoryLayout};
use crate::{error, trace, warning};

use super::{
    copy_ptr_to_staging, copy_staging_to_ptr, DeviceTensor, ExecuteNode, HostData, IOValueRef,
    PrepackNode, StagingBuffer, TensorRef, TypeTag, Value, ValueRef, ValueStore,
};

/// The two kinds of work a graph runs.
#[derive(Debug)]
pub enum Node {
    Prepack(PrepackNode),
    Execute(ExecuteNode),
}

impl From<PrepackNode> for Node {
    fn from(node: PrepackNode) -> Self {
        Node::Prepack(node)
    }
}

impl From<ExecuteNode> for Node {
    fn from(node: ExecuteNode) -> Self {
        Node::Execute(node)
    }
}

/// Owns every value and node of one model and runs them against a context.
///
/// `prepare()` encodes and submits the prepack nodes added since its last run;
/// `execute()` can then be called any number of times.
#[derive(Debug)]
pub struct ComputeGraph {
    config: GraphConfig,
    context: Arc<Context>,
    values: ValueStore,
    prepack_nodes: Vec<PrepackNode>,
    execute_nodes: Vec<ExecuteNode>,
    inputs: Vec<IOValueRef>,
    outputs: Vec<IOValueRef>,
    /// Leading prepack nodes already submitted.
    prepacked: usize,
}

impl ComputeGraph {
    pub fn new(config: GraphConfig, context: Arc<Context>) -> Self {
        Self {
            config,
            context,
            values: ValueStore::new(),
            prepack_nodes: Vec::new(),
            execute_nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            prepacked: 0,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueStore {
        &mut self.values
    }

    pub fn inputs(&self) -> &[IOValueRef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[IOValueRef] {
        &self.outputs
    }

    pub fn prepack_nodes(&self) -> &[PrepackNode] {
        &self.prepack_nodes
    }

    pub fn execute_nodes(&self) -> &[ExecuteNode] {
        &self.execute_nodes
    }

    /// True once every prepack node has been submitted.
    pub fn is_prepared(&self) -> bool {
        self.prepacked == self.prepack_nodes.len()
    }

    // Value creation

    pub fn add_tensor(
        &mut self,
        sizes: &[usize],
        dtype: DType,
        layout: GpuMemoryLayout,
    ) -> Result<ValueRef> {
        let tensor = DeviceTensor::new(&self.context, sizes, dtype, layout)?;
        Ok(self.values.add(Value::Tensor(tensor)))
    }

    /// Tensor in the configured default memory layout.
    pub fn add_tensor_default(&mut self, sizes: &[usize], dtype: DType) -> Result<ValueRef> {
        let layout = self.config.default_memory_layout;
        self.add_tensor(sizes, dtype, layout)
    }

    pub fn add_tensorref(
        &mut self,
        sizes: &[usize],
        dtype: DType,
        data: impl Into<HostData>,
    ) -> ValueRef {
        let tref = TensorRef::new(sizes.to_vec(), dtype, data.into());
        self.values.add(Value::TensorRef(tref))
    }

    pub fn add_staging(&mut self, dtype: DType, numel: usize) -> Result<ValueRef> {
        let staging = StagingBuffer::new(&self.context, dtype, numel)?;
        Ok(self.values.add(Value::Staging(staging)))
    }

    pub fn add_int(&mut self, value: i64) -> ValueRef {
        self.values.add(Value::Int(value))
    }

    pub fn add_double(&mut self, value: f64) -> ValueRef {
        self.values.add(Value::Double(value))
    }

    pub fn add_bool(&mut self, value: bool) -> ValueRef {
        self.values.add(Value::Bool(value))
    }

    pub fn add_params<T: Pod>(&mut self, params: &T) -> Result<ValueRef> {
        let params = ParamsBuffer::new(&self.context, params)?;
        Ok(self.values.add(Value::Params(params)))
    }

    // Nodes

    pub fn add_node(&mut self, node: impl Into<Node>) {
        match node.into() {
            Node::Prepack(node) => self.prepack_nodes.push(node),
            Node::Execute(node) => self.execute_nodes.push(node),
        }
    }

    pub fn add_prepack_node(&mut self, node: PrepackNode) {
        self.add_node(node);
    }

    pub fn add_execute_node(&mut self, node: ExecuteNode) {
        self.add_node(node);
    }

    // Value queries

    pub fn get_val(&self, value: ValueRef) -> Result<&Value> {
        self.values.get(value)
    }

    pub fn get_val_sizes(&self, value: ValueRef) -> Result<Vec<usize>> {
        match self.values.get(value)? {
            Value::Tensor(tensor) => Ok(tensor.sizes().to_vec()),
            Value::TensorRef(tref) => Ok(tref.sizes.clone()),
            Value::Staging(staging) => Ok(vec![staging.numel()]),
            other => Err(GraphError::TypeMismatch {
                index: value.index(),
                expected: TypeTag::Tensor,
                actual: other.tag(),
            }
            .into()),
        }
    }

    pub fn get_val_dtype(&self, value: ValueRef) -> Result<DType> {
        match self.values.get(value)? {
            Value::Tensor(tensor) => Ok(tensor.dtype()),
            Value::TensorRef(tref) => Ok(tref.dtype),
            Value::Staging(staging) => Ok(staging.dtype()),
            other => Err(GraphError::TypeMismatch {
                index: value.index(),
                expected: TypeTag::Tensor,
                actual: other.tag(),
            }
            .into()),
        }
    }

    // Inputs and outputs

    /// Mark `value` as a graph input. With `use_staging` the host writes into the
    /// returned staging value and `execute()` copies it into the tensor first.
    pub fn set_input_tensor(&mut self, value: ValueRef, use_staging: bool) -> Result<ValueRef> {
        let io = self.io_value(value, use_staging)?;
        self.inputs.push(io);
        Ok(io.staging.unwrap_or(value))
    }

    /// Mark `value` as a graph output. With `use_staging` `execute()` copies the
    /// tensor into the returned staging value after the last node.
    pub fn set_output_tensor(&mut self, value: ValueRef, use_staging: bool) -> Result<ValueRef> {
        let io = self.io_value(value, use_staging)?;
        self.outputs.push(io);
        Ok(io.staging.unwrap_or(value))
    }

    pub fn add_input_tensor(
        &mut self,
        sizes: &[usize],
        dtype: DType,
        layout: GpuMemoryLayout,
    ) -> Result<IOValueRef> {
        let value = self.add_tensor(sizes, dtype, layout)?;
        let staging = self.set_input_tensor(value, true)?;
        Ok(IOValueRef {
            value,
            staging: Some(staging),
        })
    }

    fn io_value(&mut self, value: ValueRef, use_staging: bool) -> Result<IOValueRef> {
        let tensor = self.values.tensor(value)?;
        if !use_staging {
            return Ok(IOValueRef {
                value,
                staging: None,
            });
        }
        if tensor.is_padded() {
            return Err(GraphError::ShapeMismatch(format!(
                "io tensor {} has gpu sizes {:?} for sizes {:?}; staging copies need an unpadded layout",
                value,
                tensor.gpu_sizes(),
                tensor.sizes()
            ))
            .into());
        }
        let (dtype, numel) = (tensor.dtype(), tensor.numel());
        let staging = self.add_staging(dtype, numel)?;
        Ok(IOValueRef {
            value,
            staging: Some(staging),
        })
    }

    pub fn copy_into_staging(&self, staging: ValueRef, data: &[u8]) -> Result<()> {
        copy_ptr_to_staging(data, self.values.staging(staging)?, data.len())
    }

    pub fn copy_from_staging(&self, staging: ValueRef, out: &mut [u8]) -> Result<()> {
        copy_staging_to_ptr(self.values.staging(staging)?, out, out.len())
    }

    // Prepack

    /// Encode the prepack nodes not yet submitted.
    pub fn encode_prepack(&mut self) -> Result<()> {
        let pending = &self.prepack_nodes[self.prepacked..];
        for node in pending {
            node.check_args(&self.values)?;
        }
        for node in pending {
            node.encode(&mut self.values, &self.context)?;
        }
        Ok(())
    }

    /// Upload the constants of every prepack node added since the last call.
    /// Returns immediately when there are none.
    pub fn prepare(&mut self) -> Result<()> {
        if self.is_prepared() {
            return Ok(());
        }
        trace!(
            "prepare: {} of {} prepack nodes",
            self.prepack_nodes.len() - self.prepacked,
            self.prepack_nodes.len()
        );
        if let Err(err) = self.encode_prepack() {
            self.discard_pending("prepack");
            return Err(err);
        }
        self.context.submit()?;
        if self.config.release_host_data_after_prepack {
            let released = self.values.release_host_data();
            trace!("released host data of {} tensor refs", released);
        }
        self.prepacked = self.prepack_nodes.len();
        Ok(())
    }

    // Execute

    /// Register input copies, every execute node in order, then output copies.
    pub fn encode_execute(&mut self) -> Result<()> {
        if !self.is_prepared() {
            return Err(GraphError::NotPrepared.into());
        }
        for node in &self.execute_nodes {
            node.check_args(&self.values)?;
        }

        for io in &self.inputs {
            if let Some(staging) = io.staging {
                encode_staging_copy(&mut self.values, &self.context, staging, io.value, true)?;
            }
        }
        for node in &self.execute_nodes {
            node.encode(&mut self.values, &self.context)?;
        }
        for io in &self.outputs {
            if let Some(staging) = io.staging {
                encode_staging_copy(&mut self.values, &self.context, staging, io.value, false)?;
            }
        }
        Ok(())
    }

    pub fn execute(&mut self) -> Result<()> {
        if let Err(err) = self.encode_execute() {
            self.discard_pending("execute");
            return Err(err);
        }
        self.context.submit()
    }

    fn discard_pending(&self, phase: &str) {
        match self.context.discard() {
            Ok(dropped) if dropped > 0 => {
                error!("{} failed; discarded {} encoded commands", phase, dropped)
            }
            Ok(_) => {}
            Err(err) => warning!("{} failed and pending commands were not discarded: {}", phase, err),
        }
    }
}

fn encode_staging_copy(
    values: &mut ValueStore,
    context: &Context,
    staging: ValueRef,
    tensor: ValueRef,
    into_tensor: bool,
) -> Result<()> {
    let mut guard = context.dispatch_lock()?;
    let access = if into_tensor {
        MemoryAccess::Write
    } else {
        MemoryAccess::Read
    };
    let mut barrier = PipelineBarrier::new();
    {
        let staging = values.staging(staging)?;
        let device = values.tensor(tensor)?;
        device.add_barrier(&mut barrier, access);
        let size = staging.nbytes() as u64;
        if into_tensor {
            guard.register_buffer_copy(staging.buffer(), device.buffer(), size, barrier)?;
        } else {
            guard.register_buffer_copy(device.buffer(), staging.buffer(), size, barrier)?;
        }
    }
    values.tensor_mut(tensor)?.record_access(access);
    Ok(())
}
