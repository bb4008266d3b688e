use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rustc-check-cfg=cfg(embedded_mipmap_shader)");
    println!("cargo:rerun-if-changed=shaders/mipmap_blend.comp");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    // ========================================================================
    // SPIR-V Shader Compilation (via glslc from the Vulkan SDK)
    // ========================================================================
    // The compute mip blend is built into the crate when glslc is around.
    // Without it the crate still builds; the shader can then be dropped into
    // `vk_shader_dir` by hand, or blended mips stay on the CPU.
    let src = Path::new("shaders").join("mipmap_blend.comp");
    if !src.exists() {
        return;
    }
    let Some(glslc) = find_glslc() else {
        println!("cargo:warning=glslc not found; mipmap_blend.comp not built in (CPU mip blending only)");
        return;
    };

    let Ok(out_dir) = env::var("OUT_DIR") else {
        return;
    };
    let spirv_dir = Path::new(&out_dir).join("spirv");
    if let Err(e) = fs::create_dir_all(&spirv_dir) {
        println!("cargo:warning=can't create {}: {e}", spirv_dir.display());
        return;
    }

    if compile_shader(&glslc, &src, &spirv_dir.join("mipmap_blend.comp.spv"), "compute") {
        println!("cargo:rustc-cfg=embedded_mipmap_shader");
    }
}

/// Compile a single shader file to SPIR-V.
fn compile_shader(glslc: &Path, src_path: &Path, spv_path: &Path, stage: &str) -> bool {
    let output = Command::new(glslc)
        .arg(format!("-fshader-stage={stage}"))
        .args(["--target-env=vulkan1.2", "-O", "-o"])
        .arg(spv_path)
        .arg(src_path)
        .output();

    match output {
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if result.status.success() {
                if !stderr.is_empty() {
                    println!("cargo:warning=glslc {}: {stderr}", src_path.display());
                }
                true
            } else {
                println!("cargo:warning=glslc FAILED {}: {stderr}", src_path.display());
                false
            }
        }
        Err(e) => {
            println!("cargo:warning=glslc: failed to run for {}: {e}", src_path.display());
            false
        }
    }
}

/// Find glslc: PATH first, then VULKAN_SDK.
fn find_glslc() -> Option<PathBuf> {
    if let Ok(output) = Command::new("glslc").arg("--version").output() {
        if output.status.success() {
            return Some(PathBuf::from("glslc"));
        }
    }

    let sdk = PathBuf::from(env::var("VULKAN_SDK").ok()?);
    [sdk.join("Bin").join("glslc.exe"), sdk.join("bin").join("glslc")]
        .into_iter()
        .find(|path| path.exists())
}
