use serde::{Deserialize, Serialize};

use super::shape::align_up;

/// Texel width the packed dimension is aligned to.
pub const PACKED_DIM_ALIGNMENT: usize = 4;

/// Which logical dimension is packed into contiguous groups of four on the device.
///
/// Dimensions are counted from the innermost one: width is the last dimension,
/// height the second to last and channels the third to last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuMemoryLayout {
    #[default]
    WidthPacked,
    HeightPacked,
    ChannelsPacked,
}

impl GpuMemoryLayout {
    /// Offset of the packed dimension from the innermost dimension.
    pub fn packed_dim_from_inner(self) -> usize {
        match self {
            GpuMemoryLayout::WidthPacked => 0,
            GpuMemoryLayout::HeightPacked => 1,
            GpuMemoryLayout::ChannelsPacked => 2,
        }
    }

    /// Index of the packed dimension in `sizes`, if the tensor has that many dims.
    pub fn packed_dim(self, rank: usize) -> Option<usize> {
        let from_inner = self.packed_dim_from_inner();
        (from_inner < rank).then(|| rank - 1 - from_inner)
    }

    /// Sizes of the device allocation: the packed dimension rounded up to the alignment.
    pub fn gpu_sizes(self, sizes: &[usize]) -> Vec<usize> {
        let mut gpu_sizes = sizes.to_vec();
        if let Some(dim) = self.packed_dim(sizes.len()) {
            gpu_sizes[dim] = align_up(gpu_sizes[dim], PACKED_DIM_ALIGNMENT);
        }
        gpu_sizes
    }
}
