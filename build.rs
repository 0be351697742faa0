// Build script: compile GLSL shaders to SPIR-V and stage content next to the binary
//
// Output layout, inside target/<profile>/:
//   content/shaders/<name>.spv
//   content/textures/<file>

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const SHADERS: [&str; 2] = ["shaders/shader.vert", "shaders/shader.frag"];
const TEXTURES_DIR: &str = "assets/textures";

fn main() {
    println!("cargo:rerun-if-changed=shaders/");
    println!("cargo:rerun-if-changed={}", TEXTURES_DIR);

    let content_dir = profile_dir().join("content");
    let shader_dir = content_dir.join("shaders");
    let texture_dir = content_dir.join("textures");

    for dir in [&shader_dir, &texture_dir] {
        if let Err(e) = fs::create_dir_all(dir) {
            panic!("Failed to create {}: {}", dir.display(), e);
        }
    }

    // Compile shaders using glslc (part of Vulkan SDK)
    for shader in SHADERS {
        let input = Path::new(shader);
        let file_name = input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        compile_shader(input, &shader_dir.join(format!("{}.spv", file_name)));
    }

    copy_dir_files(Path::new(TEXTURES_DIR), &texture_dir);
}

/// target/<profile>, three levels above OUT_DIR (target/<profile>/build/<pkg>-<hash>/out)
fn profile_dir() -> PathBuf {
    let Ok(out_dir) = env::var("OUT_DIR").map(PathBuf::from) else {
        panic!("OUT_DIR is not set; build scripts must run under cargo");
    };
    out_dir
        .ancestors()
        .nth(3)
        .map(Path::to_path_buf)
        .unwrap_or(out_dir)
}

fn compile_shader(input: &Path, output: &Path) {
    let result = Command::new("glslc")
        .arg(input)
        .arg("-o")
        .arg(output)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input.display(), output.display());
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input.display(), status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), shaders were not compiled", e);
            println!(
                "cargo:warning=Install the Vulkan SDK or run: glslc {} -o {}",
                input.display(),
                output.display()
            );
        }
    }
}

fn copy_dir_files(from: &Path, to: &Path) {
    let Ok(entries) = fs::read_dir(from) else {
        println!("cargo:warning=No {} directory, skipping", from.display());
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name() {
            if let Err(e) = fs::copy(&path, to.join(name)) {
                panic!("Failed to copy {}: {}", path.display(), e);
            }
        }
    }
}
