use std::fmt;
use std::fs::File;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytemuck::Pod;
use memmap2::Mmap;

use crate::runtime::ParamsBuffer;
use crate::tensor::{numel, DType};

use super::{DeviceTensor, StagingBuffer};

/// Handle to a value in a [`super::ValueStore`].
///
/// Carries no ownership. It only resolves against the store that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueRef {
    store: u32,
    index: u32,
}

impl ValueRef {
    pub(crate) fn new(store: u32, index: u32) -> Self {
        Self { store, index }
    }

    /// Rebuild a handle from its parts, e.g. after passing it through a plan file.
    pub fn from_raw(store: u32, index: u32) -> Self {
        Self::new(store, index)
    }

    pub fn store(self) -> u32 {
        self.store
    }

    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Tensor,
    Staging,
    TensorRef,
    Int,
    Double,
    Bool,
    Params,
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Tensor => "Tensor",
            TypeTag::Staging => "Staging",
            TypeTag::TensorRef => "TensorRef",
            TypeTag::Int => "Int",
            TypeTag::Double => "Double",
            TypeTag::Bool => "Bool",
            TypeTag::Params => "Params",
        };
        f.write_str(name)
    }
}

/// Host bytes backing a [`TensorRef`].
#[derive(Debug, Clone)]
pub enum HostData {
    Shared(Arc<[u8]>),
    Mapped(MappedSlice),
    /// Dropped after prepacking; reading it fails with `HostDataUnavailable`.
    Released,
}

impl HostData {
    pub fn from_pod<T: Pod>(data: &[T]) -> Self {
        HostData::Shared(Arc::from(bytemuck::cast_slice::<T, u8>(data)))
    }

    /// Map `range` of the file at `path` without copying it.
    pub fn map_file(path: impl AsRef<Path>, range: Range<usize>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open host data file {}", path.display()))?;
        let mmap = unsafe {
            Mmap::map(&file)
                .with_context(|| format!("failed to mmap host data file {}", path.display()))?
        };
        if range.start > range.end || range.end > mmap.len() {
            return Err(anyhow!(
                "range {:?} is outside {} ({} bytes)",
                range,
                path.display(),
                mmap.len()
            ));
        }
        Ok(HostData::Mapped(MappedSlice {
            mmap: Arc::new(mmap),
            range,
        }))
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            HostData::Shared(bytes) => Some(&bytes[..]),
            HostData::Mapped(slice) => Some(slice.as_bytes()),
            HostData::Released => None,
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self, HostData::Released)
    }
}

impl From<Vec<u8>> for HostData {
    fn from(bytes: Vec<u8>) -> Self {
        HostData::Shared(Arc::from(bytes))
    }
}

impl From<Arc<[u8]>> for HostData {
    fn from(bytes: Arc<[u8]>) -> Self {
        HostData::Shared(bytes)
    }
}

/// A slice into a memory-mapped file.
#[derive(Debug, Clone)]
pub struct MappedSlice {
    mmap: Arc<Mmap>,
    range: Range<usize>,
}

impl MappedSlice {
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[self.range.clone()]
    }
}

/// Shape and dtype of constant host data consumed by a prepack node.
#[derive(Debug, Clone)]
pub struct TensorRef {
    pub sizes: Vec<usize>,
    pub dtype: DType,
    pub data: HostData,
}

impl TensorRef {
    pub fn new(sizes: Vec<usize>, dtype: DType, data: HostData) -> Self {
        Self { sizes, dtype, data }
    }

    pub fn numel(&self) -> usize {
        numel(&self.sizes)
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.element_size()
    }
}

/// Graph value, tagged by what it holds. The tag is fixed at creation.
#[derive(Debug)]
pub enum Value {
    Tensor(DeviceTensor),
    Staging(StagingBuffer),
    TensorRef(TensorRef),
    Int(i64),
    Double(f64),
    Bool(bool),
    Params(ParamsBuffer),
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Tensor(_) => TypeTag::Tensor,
            Value::Staging(_) => TypeTag::Staging,
            Value::TensorRef(_) => TypeTag::TensorRef,
            Value::Int(_) => TypeTag::Int,
            Value::Double(_) => TypeTag::Double,
            Value::Bool(_) => TypeTag::Bool,
            Value::Params(_) => TypeTag::Params,
        }
    }
}

/// A graph input or output and, if the host feeds it through one, its staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IOValueRef {
    pub value: ValueRef,
    pub staging: Option<ValueRef>,
}
