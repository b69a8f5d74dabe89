// build.rs
// Compiles the compositor's GLSL shaders to SPIR-V when the Vulkan SDK is available

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const SHADER_EXTENSIONS: [&str; 2] = ["vert", "frag"];

/// Whether `source` is newer than `output` (or `output` is missing)
fn is_stale(source: &Path, output: &Path) -> bool {
    let modified = |path: &Path| std::fs::metadata(path).and_then(|meta| meta.modified());
    match (modified(source), modified(output)) {
        (Ok(src), Ok(dst)) => src > dst,
        _ => true,
    }
}

/// Compile one shader, keeping its full file name: `compositor.vert` -> `compositor.vert.spv`
fn compile_shader(glslc: &Path, source: &Path, target_dir: &Path) -> bool {
    let Some(file_name) = source.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    let output = target_dir.join(format!("{file_name}.spv"));

    if !is_stale(source, &output) {
        eprintln!("info: Shader {file_name} is up to date");
        return false;
    }

    match Command::new(glslc).arg(source).arg("-o").arg(&output).status() {
        Ok(status) if status.success() => {
            eprintln!("info: Compiled {file_name} -> {}", output.display());
            true
        }
        Ok(status) => {
            eprintln!("error: glslc failed for {file_name} with exit code: {}", status.code().unwrap_or(-1));
            panic!("Shader compilation failed");
        }
        Err(e) => {
            eprintln!("error: Failed to run glslc for {file_name}: {e}");
            panic!("Failed to execute shader compiler");
        }
    }
}

fn main() {
    println!("cargo:rerun-if-changed=resources/shaders");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    if env::var_os("SKIP_SHADERS").is_some() {
        eprintln!("info: Skipping shader compilation (SKIP_SHADERS set)");
        return;
    }

    let Some(vulkan_sdk) = env::var_os("VULKAN_SDK") else {
        eprintln!("warning: VULKAN_SDK not set, shader compilation skipped");
        return;
    };
    let glslc = if cfg!(target_os = "windows") {
        PathBuf::from(vulkan_sdk).join("Bin").join("glslc.exe")
    } else {
        PathBuf::from(vulkan_sdk).join("bin").join("glslc")
    };
    if !glslc.exists() {
        eprintln!("error: glslc not found at: {}", glslc.display());
        panic!("Shader compiler not found");
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string()));
    let shader_dir = manifest_dir.join("resources/shaders");
    // Shared by every workspace member so `ShaderConfig` finds the output from the root
    let target_dir = manifest_dir.join("../../target/shaders");
    if let Err(e) = std::fs::create_dir_all(&target_dir) {
        eprintln!("warning: Failed to create {}: {e}", target_dir.display());
        return;
    }

    let Ok(entries) = std::fs::read_dir(&shader_dir) else {
        eprintln!("info: No shader directory found at: {}", shader_dir.display());
        return;
    };

    let compiled = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SHADER_EXTENSIONS.contains(&ext))
        })
        .filter(|path| compile_shader(&glslc, path, &target_dir))
        .count();

    if compiled > 0 {
        eprintln!("info: Successfully compiled {compiled} shader(s)");
    } else {
        eprintln!("info: All shaders are up to date");
    }
}
