// Build script: compile the demo's GLSL shaders to SPIR-V with glslc

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &["shaders/triangle.vert", "shaders/triangle.frag"];

fn main() {
    for shader in SHADERS {
        println!("cargo:rerun-if-changed={}", shader);
        compile_shader(shader, &format!("{}.spv", shader));
    }
}

fn compile_shader(input: &str, output: &str) {
    if !Path::new(input).exists() {
        println!("cargo:warning=Shader source {} is missing, skipping", input);
        return;
    }

    match Command::new("glslc").arg(input).arg("-o").arg(output).status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        // The library builds without glslc; only the demo needs the SPIR-V
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} not compiled", e, input);
            println!("cargo:warning=Compile manually: glslc {} -o {}", input, output);
        }
    }
}
