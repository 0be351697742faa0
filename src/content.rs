// Content directory layout
//
// Shaders and textures live next to the executable:
//   <exe_dir>/content/shaders/*.spv
//   <exe_dir>/content/textures/*

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ContentDirs {
    root: PathBuf,
}

impl ContentDirs {
    /// Resolve the content directory from the executable path (argv[0]).
    pub fn from_executable(executable: &Path) -> Self {
        let exe_dir = executable
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self {
            root: exe_dir.join("content"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shaders(&self) -> PathBuf {
        self.root.join("shaders")
    }

    pub fn textures(&self) -> PathBuf {
        self.root.join("textures")
    }

    pub fn shader(&self, name: &str) -> PathBuf {
        self.shaders().join(name)
    }

    pub fn texture(&self, name: &str) -> PathBuf {
        self.textures().join(name)
    }
}

/// Read a whole asset file. A missing file is fatal at startup.
pub fn read_asset(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to open file {}", path.display()))
}
