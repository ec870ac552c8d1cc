//! SPIR-V loading and shader modules.
//!
//! Shaders are compiled ahead of time; the engine only ever sees SPIR-V
//! binaries, which are checked for size and magic before reaching the driver.

use crate::error::{GpuError, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode a SPIR-V binary into words.
///
/// Accepts both byte orders; the result is always in host order.
pub fn load_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        tracing::error!("SPIR-V size {} is not a positive multiple of 4", bytes.len());
        return Err(GpuError::ShaderLoad(format!(
            "Invalid SPIR-V size: {} bytes",
            bytes.len()
        )));
    }

    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    match words[0] {
        SPIRV_MAGIC => {}
        magic if magic.swap_bytes() == SPIRV_MAGIC => {
            words.iter_mut().for_each(|word| *word = word.swap_bytes());
        }
        magic => {
            tracing::error!("Bad SPIR-V magic {magic:#010x}");
            return Err(GpuError::ShaderLoad(format!(
                "Invalid SPIR-V magic number: {magic:#010x}"
            )));
        }
    }

    Ok(words)
}

/// Read and decode a SPIR-V file.
pub fn load_spirv_file(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| {
        tracing::error!("Failed to read shader {}: {e}", path.display());
        GpuError::ShaderLoad(format!("{}: {e}", path.display()))
    })?;

    load_spirv(&bytes).map_err(|e| match e {
        GpuError::ShaderLoad(msg) => GpuError::ShaderLoad(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// Owned shader module.
pub struct ShaderModule {
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    device: Arc<ash::Device>,
}

impl ShaderModule {
    /// Create a module from SPIR-V words.
    pub fn new(device: Arc<ash::Device>, code: &[u32], stage: vk::ShaderStageFlags) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| {
            tracing::error!("Shader module creation failed ({stage:?}): {e}");
            GpuError::ShaderLoad(format!("{stage:?}: {e}"))
        })?;

        Ok(Self {
            module,
            stage,
            device,
        })
    }

    /// Load a module straight from a `.spv` file.
    pub fn from_file(
        device: Arc<ash::Device>,
        path: impl AsRef<Path>,
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let code = load_spirv_file(path)?;
        Self::new(device, &code, stage)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Stage info with entry point `main`.
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage)
            .module(self.module)
            .name(c"main")
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn decodes_little_endian_module() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0500, 0, 8, 0]);
        let words = load_spirv(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words[1], 0x0001_0500);
    }

    #[test]
    fn swaps_big_endian_module() {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 0x0001_0500]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        let words = load_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0500]);
    }

    #[test]
    fn rejects_misaligned_size() {
        let mut bytes = module_bytes(&[SPIRV_MAGIC, 1]);
        bytes.push(0);
        assert!(matches!(load_spirv(&bytes), Err(GpuError::ShaderLoad(_))));
        assert!(load_spirv(&[]).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = module_bytes(&[0xDEAD_BEEF, 1]);
        let err = load_spirv(&bytes).unwrap_err();
        assert!(err.to_string().contains("0xdeadbeef"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_spirv_file("does/not/exist.spv").unwrap_err();
        assert!(err.to_string().contains("exist.spv"));
    }
}
