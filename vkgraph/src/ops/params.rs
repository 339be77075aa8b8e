use anyhow::{anyhow, Result};
use bytemuck::{Pod, Zeroable};

use crate::error::GraphError;
use crate::tensor::{numel, DType, GpuMemoryLayout};

/// Highest tensor rank a params block can describe.
pub const MAX_RANK: usize = 8;

const NO_PACKED_DIM: u32 = u32::MAX;

/// Sizes packed four to a `uvec4`. std140 gives every element of a scalar array
/// a 16-byte stride, so `uint sizes[8]` would not match a tightly packed array.
pub type PackedSizes = [[u32; 4]; MAX_RANK / 4];

/// Uniform block of the `nchw_to_buffer_*` and `buffer_to_nchw_*` kernels.
///
/// Matches this std140 block, 80 bytes:
///
/// ```glsl
/// layout(std140) uniform PackParams {
///     uvec4 sizes[2];      // offset 0,  dim i at sizes[i / 4][i % 4]
///     uvec4 gpu_sizes[2];  // offset 32
///     uint rank;           // offset 64
///     uint packed_dim;
///     uint element_size;
///     uint numel;
/// };
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PackParams {
    pub sizes: PackedSizes,
    pub gpu_sizes: PackedSizes,
    pub rank: u32,
    /// Index of the padded dimension, `u32::MAX` when the layout pads nothing.
    pub packed_dim: u32,
    pub element_size: u32,
    pub numel: u32,
}

impl PackParams {
    pub fn new(sizes: &[usize], layout: GpuMemoryLayout, dtype: DType) -> Result<Self> {
        if sizes.len() > MAX_RANK {
            return Err(GraphError::ShapeMismatch(format!(
                "rank {} exceeds the packing limit of {}",
                sizes.len(),
                MAX_RANK
            ))
            .into());
        }
        let gpu_sizes = layout.gpu_sizes(sizes);
        let mut params = PackParams {
            rank: sizes.len() as u32,
            packed_dim: layout
                .packed_dim(sizes.len())
                .map(|dim| dim as u32)
                .unwrap_or(NO_PACKED_DIM),
            element_size: dtype.element_size() as u32,
            numel: to_u32(numel(sizes), "element count")?,
            ..PackParams::default()
        };
        for (i, (size, gpu_size)) in sizes.iter().zip(gpu_sizes.iter()).enumerate() {
            params.sizes[i / 4][i % 4] = to_u32(*size, "dimension")?;
            params.gpu_sizes[i / 4][i % 4] = to_u32(*gpu_size, "dimension")?;
        }
        Ok(params)
    }

    /// The first `rank` entries of `sizes`.
    pub fn logical_sizes(&self) -> Vec<usize> {
        unpack(&self.sizes, self.rank)
    }

    /// The first `rank` entries of `gpu_sizes`.
    pub fn padded_sizes(&self) -> Vec<usize> {
        unpack(&self.gpu_sizes, self.rank)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        read_pod(bytes, "PackParams")
    }

    pub fn packed_dim(&self) -> Option<usize> {
        (self.packed_dim != NO_PACKED_DIM).then_some(self.packed_dim as usize)
    }
}

/// Uniform block of the elementwise kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ElementwiseParams {
    pub numel: u32,
    pub element_size: u32,
    _pad: [u32; 2],
}

impl ElementwiseParams {
    pub fn new(numel: usize, dtype: DType) -> Result<Self> {
        Ok(Self {
            numel: to_u32(numel, "element count")?,
            element_size: dtype.element_size() as u32,
            _pad: [0; 2],
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        read_pod(bytes, "ElementwiseParams")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    pub fn all() -> &'static [BinaryOp] {
        &[BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
        }
    }

    /// Kernel name for this op over `dtype`, e.g. `binary_add_f32`.
    pub fn shader_name(self, dtype: DType) -> String {
        format!("binary_{}_{}", self.as_str(), dtype)
    }

    pub fn apply_f32(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
        }
    }

    /// Integer ops wrap on overflow, matching GPU integer arithmetic.
    pub fn apply_i32(self, lhs: i32, rhs: i32) -> i32 {
        match self {
            BinaryOp::Add => lhs.wrapping_add(rhs),
            BinaryOp::Sub => lhs.wrapping_sub(rhs),
            BinaryOp::Mul => lhs.wrapping_mul(rhs),
        }
    }
}

fn unpack(packed: &PackedSizes, rank: u32) -> Vec<usize> {
    packed
        .iter()
        .flatten()
        .take(rank as usize)
        .map(|v| *v as usize)
        .collect()
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        GraphError::ShapeMismatch(format!("{} {} does not fit in 32 bits", what, value)).into()
    })
}

fn read_pod<T: Pod>(bytes: &[u8], what: &str) -> Result<T> {
    bytemuck::try_pod_read_unaligned(bytes)
        .map_err(|err| anyhow!("invalid {} block of {} bytes: {:?}", what, bytes.len(), err))
}

