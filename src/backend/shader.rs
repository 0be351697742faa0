// Shader module loading
//
// Shaders are compiled to SPIR-V at build time and read from the content
// directory at runtime. Modules only need to live until the pipeline that
// uses them has been created.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use super::VulkanDevice;

/// Parse SPIR-V bytes into aligned words, validating size and magic number.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V")
}

/// Read and parse a SPIR-V file.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = crate::content::read_asset(path)?;
    parse_spirv(&bytes).with_context(|| format!("Failed to load shader {}", path.display()))
}

pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn new(device: Arc<VulkanDevice>, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let handle = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self { handle, device })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_are_little_endian() {
        let mut bytes = 0x0723_0203u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        assert_eq!(parse_spirv(&bytes).unwrap(), vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn truncated_spirv_is_rejected() {
        assert!(parse_spirv(&[0x03, 0x02, 0x23]).is_err());
    }
}
