use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::vk_trace;

use super::UVec3;

const SPIRV_MAGIC: u32 = 0x0723_0203;
const DEFAULT_ENTRY_POINT: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    StorageBuffer,
    UniformBuffer,
}

#[derive(Debug, Clone)]
struct ShaderInner {
    kernel_name: String,
    layout: Vec<DescriptorKind>,
    local_workgroup_size: Option<UVec3>,
    entry_point: String,
    spirv: Option<Vec<u32>>,
}

/// A compiled kernel and the binding layout it expects, in slot order.
///
/// Cheap to clone; two infos compare equal when kernel name and layout match.
#[derive(Debug, Clone)]
pub struct ShaderInfo {
    inner: Arc<ShaderInner>,
}

impl ShaderInfo {
    pub fn new(kernel_name: impl Into<String>, layout: Vec<DescriptorKind>) -> Self {
        Self {
            inner: Arc::new(ShaderInner {
                kernel_name: kernel_name.into(),
                layout,
                local_workgroup_size: None,
                entry_point: DEFAULT_ENTRY_POINT.to_string(),
                spirv: None,
            }),
        }
    }

    pub fn with_local_workgroup_size(mut self, size: UVec3) -> Self {
        Arc::make_mut(&mut self.inner).local_workgroup_size = Some(size);
        self
    }

    pub fn with_spirv(mut self, words: Vec<u32>) -> Self {
        let entrypoints = spirv_entrypoints(&words);
        let inner = Arc::make_mut(&mut self.inner);
        inner.entry_point = select_entrypoint(&entrypoints, DEFAULT_ENTRY_POINT).to_string();
        inner.spirv = Some(words);
        self
    }

    pub fn kernel_name(&self) -> &str {
        &self.inner.kernel_name
    }

    pub fn layout(&self) -> &[DescriptorKind] {
        &self.inner.layout
    }

    pub fn binding_count(&self) -> usize {
        self.inner.layout.len()
    }

    pub fn local_workgroup_size(&self) -> Option<UVec3> {
        self.inner.local_workgroup_size
    }

    pub fn entry_point(&self) -> &str {
        &self.inner.entry_point
    }

    pub fn spirv(&self) -> Option<&[u32]> {
        self.inner.spirv.as_deref()
    }
}

impl PartialEq for ShaderInfo {
    fn eq(&self, other: &Self) -> bool {
        self.inner.kernel_name == other.inner.kernel_name && self.inner.layout == other.inner.layout
    }
}

impl Eq for ShaderInfo {}

/// Name → kernel lookup provided by the shader registry subsystem.
pub trait ShaderRegistry: Send + Sync {
    fn get_shader_info(&self, name: &str) -> Result<ShaderInfo>;

    fn contains(&self, name: &str) -> bool {
        self.get_shader_info(name).is_ok()
    }
}

#[derive(Debug, Deserialize)]
struct ShaderManifest {
    shaders: HashMap<String, ShaderManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ShaderManifestEntry {
    #[serde(default)]
    spv: Option<String>,
    layout: Vec<DescriptorKind>,
    #[serde(default)]
    local_workgroup_size: Option<[u32; 3]>,
}

/// In-memory shader registry, optionally populated from a JSON manifest.
#[derive(Debug, Default, Clone)]
pub struct ShaderCatalog {
    shaders: HashMap<String, ShaderInfo>,
}

impl ShaderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `shader` under its kernel name, returning any shader it replaced.
    pub fn register(&mut self, shader: ShaderInfo) -> Option<ShaderInfo> {
        self.shaders.insert(shader.kernel_name().to_string(), shader)
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.shaders.keys().map(|name| name.as_str())
    }

    /// Load a manifest of the form
    /// `{"shaders": {"name": {"spv": "rel/path.spv", "layout": ["storage_buffer", ...]}}}`.
    ///
    /// SPIR-V paths are resolved relative to the manifest's directory.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read shader manifest at {}", path.display()))?;
        let manifest: ShaderManifest = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse shader manifest at {}", path.display()))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut catalog = Self::new();
        for (name, entry) in manifest.shaders {
            let mut shader = ShaderInfo::new(name.clone(), entry.layout);
            if let Some(size) = entry.local_workgroup_size {
                shader = shader.with_local_workgroup_size(UVec3::from(size));
            }
            if let Some(spv) = entry.spv {
                let spv_path = resolve_spv_path(&base_dir, &spv);
                let bytes = std::fs::read(&spv_path)
                    .with_context(|| format!("failed to read {}", spv_path.display()))?;
                shader = shader.with_spirv(validate_spirv(&bytes, &name)?);
            }
            vk_trace!(
                "registered shader {} ({} bindings)",
                name,
                shader.binding_count()
            );
            catalog.register(shader);
        }
        Ok(catalog)
    }
}

impl ShaderRegistry for ShaderCatalog {
    fn get_shader_info(&self, name: &str) -> Result<ShaderInfo> {
        self.shaders
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownShader(name.to_string()).into())
    }

    fn contains(&self, name: &str) -> bool {
        self.shaders.contains_key(name)
    }
}

fn resolve_spv_path(base_dir: &Path, spv: &str) -> PathBuf {
    let path = PathBuf::from(spv);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

/// Check the SPIR-V header and return the module as little-endian words.
pub fn validate_spirv(bytes: &[u8], target: &str) -> Result<Vec<u32>> {
    if bytes.len() < 20 || bytes.len() % 4 != 0 {
        return Err(anyhow!(
            "invalid SPIR-V size for {} ({} bytes)",
            target,
            bytes.len()
        ));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    vk_trace!(
        "spv header target={} magic=0x{:08x} version=0x{:08x} bound={}",
        target,
        words[0],
        words[1],
        words[3]
    );
    if words[0] != SPIRV_MAGIC {
        return Err(anyhow!(
            "invalid SPIR-V magic for {} (0x{:08x})",
            target,
            words[0]
        ));
    }
    Ok(words)
}

/// Names of every `OpEntryPoint` in a SPIR-V module.
pub fn spirv_entrypoints(words: &[u32]) -> Vec<String> {
    const OP_ENTRY_POINT: u16 = 15;
    if words.len() < 5 {
        return Vec::new();
    }
    let mut offset = 5usize;
    let mut names = Vec::new();
    while offset < words.len() {
        let word = words[offset];
        let word_count = (word >> 16) as usize;
        let opcode = (word & 0xFFFF) as u16;
        if word_count == 0 || offset + word_count > words.len() {
            break;
        }
        if opcode == OP_ENTRY_POINT {
            let operands = &words[(offset + 1)..(offset + word_count)];
            if operands.len() >= 3 {
                let name = read_spv_string(&operands[2..]);
                if !name.is_empty() {
                    names.push(name);
                }
            }
        }
        offset += word_count;
    }
    names
}

fn select_entrypoint<'a>(entrypoints: &'a [String], target: &'a str) -> &'a str {
    if entrypoints.is_empty() || entrypoints.iter().any(|name| name == target) {
        return target;
    }
    entrypoints[0].as_str()
}

fn read_spv_string(words: &[u32]) -> String {
    let mut bytes = Vec::new();
    for word in words {
        for b in word.to_le_bytes() {
            if b == 0 {
                return String::from_utf8_lossy(&bytes).to_string();
            }
            bytes.push(b);
        }
    }
    String::from_utf8_lossy(&bytes).to_string()
}
