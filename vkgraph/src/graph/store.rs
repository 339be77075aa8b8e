use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;

use crate::error::GraphError;
use crate::runtime::{MemoryAccess, ParamsBuffer};

use super::{DeviceTensor, HostData, StagingBuffer, TensorRef, TypeTag, Value, ValueRef};

static NEXT_STORE_ID: AtomicU32 = AtomicU32::new(1);

/// Append-only table of graph values.
///
/// There is no removal: a handle stays valid for as long as the store lives.
/// Typed accessors hand out references to the payload only, so a value's tag
/// can never change after `add`.
#[derive(Debug)]
pub struct ValueStore {
    id: u32,
    values: Vec<Value>,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStore {
    pub fn new() -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            values: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn add(&mut self, value: Value) -> ValueRef {
        let value_ref = ValueRef::new(self.id, self.values.len() as u32);
        self.values.push(value);
        value_ref
    }

    pub fn get(&self, value: ValueRef) -> Result<&Value> {
        self.check(value)?;
        Ok(&self.values[value.index() as usize])
    }

    fn get_mut(&mut self, value: ValueRef) -> Result<&mut Value> {
        self.check(value)?;
        Ok(&mut self.values[value.index() as usize])
    }

    fn check(&self, value: ValueRef) -> Result<()> {
        if value.store() != self.id || value.index() as usize >= self.values.len() {
            return Err(GraphError::InvalidHandle {
                index: value.index(),
                len: self.values.len(),
            }
            .into());
        }
        Ok(())
    }

    pub fn tensor(&self, value: ValueRef) -> Result<&DeviceTensor> {
        match self.get(value)? {
            Value::Tensor(tensor) => Ok(tensor),
            other => Err(mismatch(value, TypeTag::Tensor, other)),
        }
    }

    pub fn tensor_mut(&mut self, value: ValueRef) -> Result<&mut DeviceTensor> {
        match self.get_mut(value)? {
            Value::Tensor(tensor) => Ok(tensor),
            other => Err(mismatch(value, TypeTag::Tensor, other)),
        }
    }

    /// Commit the accesses of a registered command. Writes are applied after
    /// reads so a tensor bound both ways ends up as written.
    pub(crate) fn record_accesses(&mut self, bound: &[(ValueRef, MemoryAccess)]) -> Result<()> {
        let reads = bound.iter().filter(|(_, access)| *access == MemoryAccess::Read);
        let writes = bound.iter().filter(|(_, access)| *access == MemoryAccess::Write);
        for (value, access) in reads.chain(writes) {
            self.tensor_mut(*value)?.record_access(*access);
        }
        Ok(())
    }

    pub fn tensor_ref(&self, value: ValueRef) -> Result<&TensorRef> {
        match self.get(value)? {
            Value::TensorRef(tref) => Ok(tref),
            other => Err(mismatch(value, TypeTag::TensorRef, other)),
        }
    }

    pub fn tensor_ref_mut(&mut self, value: ValueRef) -> Result<&mut TensorRef> {
        match self.get_mut(value)? {
            Value::TensorRef(tref) => Ok(tref),
            other => Err(mismatch(value, TypeTag::TensorRef, other)),
        }
    }

    pub fn staging(&self, value: ValueRef) -> Result<&StagingBuffer> {
        match self.get(value)? {
            Value::Staging(staging) => Ok(staging),
            other => Err(mismatch(value, TypeTag::Staging, other)),
        }
    }

    pub fn int(&self, value: ValueRef) -> Result<i64> {
        match self.get(value)? {
            Value::Int(v) => Ok(*v),
            other => Err(mismatch(value, TypeTag::Int, other)),
        }
    }

    pub fn double(&self, value: ValueRef) -> Result<f64> {
        match self.get(value)? {
            Value::Double(v) => Ok(*v),
            other => Err(mismatch(value, TypeTag::Double, other)),
        }
    }

    pub fn bool(&self, value: ValueRef) -> Result<bool> {
        match self.get(value)? {
            Value::Bool(v) => Ok(*v),
            other => Err(mismatch(value, TypeTag::Bool, other)),
        }
    }

    pub fn params(&self, value: ValueRef) -> Result<&ParamsBuffer> {
        match self.get(value)? {
            Value::Params(params) => Ok(params),
            other => Err(mismatch(value, TypeTag::Params, other)),
        }
    }

    /// Drop the host bytes of every TensorRef. Returns how many were released.
    pub fn release_host_data(&mut self) -> usize {
        let mut released = 0;
        for value in &mut self.values {
            if let Value::TensorRef(tref) = value {
                if !tref.data.is_released() {
                    tref.data = HostData::Released;
                    released += 1;
                }
            }
        }
        released
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueRef, &Value)> {
        let id = self.id;
        self.values
            .iter()
            .enumerate()
            .map(move |(index, value)| (ValueRef::new(id, index as u32), value))
    }
}

fn mismatch(value: ValueRef, expected: TypeTag, actual: &Value) -> anyhow::Error {
    GraphError::TypeMismatch {
        index: value.index(),
        expected,
        actual: actual.tag(),
    }
    .into()
}
