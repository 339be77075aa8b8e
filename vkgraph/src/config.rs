use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::runtime::UVec3;
use crate::tensor::GpuMemoryLayout;

pub const CONFIG_ENV: &str = "VKGRAPH_CONFIG";

/// Sizing of the descriptor pool a device hands descriptor sets out of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorPoolConfig {
    pub max_sets: u32,
    pub storage_buffers: u32,
    pub uniform_buffers: u32,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            max_sets: 1024,
            storage_buffers: 4096,
            uniform_buffers: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub descriptor_pool: DescriptorPoolConfig,
    /// Upper bound on live device memory. `None` leaves it to the device.
    pub memory_limit_bytes: Option<u64>,
    pub enable_timestamps: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub default_memory_layout: GpuMemoryLayout,
    pub default_local_workgroup_size: [u32; 3],
    /// Drop every TensorRef's host data once `prepare()` has been submitted.
    pub release_host_data_after_prepack: bool,
    pub device: DeviceConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_memory_layout: GpuMemoryLayout::WidthPacked,
            default_local_workgroup_size: [64, 1, 1],
            release_host_data_after_prepack: false,
            device: DeviceConfig::default(),
        }
    }
}

impl GraphConfig {
    pub fn from_json_str(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("failed to parse graph config")
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read graph config at {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse graph config at {}", path.display()))
    }

    /// Load the file named by `VKGRAPH_CONFIG`, or the defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load_from_file(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    pub fn local_workgroup_size(&self) -> UVec3 {
        UVec3::from(self.default_local_workgroup_size)
    }
}
