// src/shader_reflect.rs
//! Shader loading and input-signature reflection.
//!
//! Shader files are WGSL (`.wgsl`) or SPIR-V (`.spv`). naga parses either one,
//! finds the single entry point for the requested stage and reports every
//! `@location` input of it as a [`ReflectedInput`]. Struct-typed entry point
//! arguments are flattened member by member.

use std::path::Path;

use log::debug;
use naga::{Binding, Module, ScalarKind, TypeInner, VectorSize};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::gpu::ShaderStage;
use crate::vertex_layout::ReflectedInput;

#[derive(Debug, Clone)]
pub enum ShaderSource {
    Wgsl(String),
    SpirV(Vec<u32>),
}

/// A parsed shader ready for backend compilation.
#[derive(Debug, Clone)]
pub struct ShaderProgram {
    /// File name the shader was loaded from (`InstancedVS.wgsl`).
    pub name: String,
    pub stage: ShaderStage,
    pub entry_point: String,
    pub source: ShaderSource,
    /// Vertex inputs in location order; empty for pixel shaders.
    pub inputs: Vec<ReflectedInput>,
}

/// Stage a shader file is compiled for, judged by its file stem: `VS` wins over `PS`.
pub fn stage_for_file_name(stem: &str) -> Option<ShaderStage> {
    if stem.contains("VS") {
        Some(ShaderStage::Vertex)
    } else if stem.contains("PS") {
        Some(ShaderStage::Pixel)
    } else {
        None
    }
}

impl ShaderProgram {
    pub fn from_wgsl(name: &str, stage: ShaderStage, source: &str) -> Result<Self> {
        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| Error::shader(name, e.emit_to_string(source)))?;
        let (entry_point, inputs) = reflect(&module, stage, name)?;
        Ok(Self {
            name: name.to_string(),
            stage,
            entry_point,
            source: ShaderSource::Wgsl(source.to_string()),
            inputs,
        })
    }

    pub fn from_spirv(name: &str, stage: ShaderStage, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(Error::shader(name, "SPIR-V length is not a multiple of 4"));
        }
        let options = naga::front::spv::Options::default();
        let module = naga::front::spv::parse_u8_slice(bytes, &options).map_err(|e| Error::shader(name, e))?;
        let (entry_point, inputs) = reflect(&module, stage, name)?;
        let words = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Ok(Self {
            name: name.to_string(),
            stage,
            entry_point,
            source: ShaderSource::SpirV(words),
            inputs,
        })
    }

    /// Read and reflect a shader file, choosing the front-end by extension.
    pub fn load(path: &Path, stage: ShaderStage) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let program = match ext.as_str() {
            "wgsl" => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("reading shader {}", path.display()))?;
                Self::from_wgsl(&name, stage, &source)?
            }
            "spv" => {
                let bytes = std::fs::read(path).with_context(|| format!("reading shader {}", path.display()))?;
                Self::from_spirv(&name, stage, &bytes)?
            }
            other => return Err(Error::shader(name, format!("unsupported shader extension `{other}`"))),
        };
        debug!(
            "Reflected {} ({:?}, entry `{}`, {} inputs)",
            program.name,
            program.stage,
            program.entry_point,
            program.inputs.len()
        );
        Ok(program)
    }
}

/// Find the entry point for `stage` and reflect its location-bound inputs.
pub fn reflect(module: &Module, stage: ShaderStage, name: &str) -> Result<(String, Vec<ReflectedInput>)> {
    let wanted = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Pixel => naga::ShaderStage::Fragment,
    };
    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.stage == wanted)
        .ok_or_else(|| Error::shader(name, format!("no {stage:?} entry point")))?;

    let mut inputs = Vec::new();
    if stage == ShaderStage::Vertex {
        for arg in &entry.function.arguments {
            let arg_name = arg.name.as_deref().unwrap_or("");
            match &module.types[arg.ty].inner {
                TypeInner::Struct { members, .. } => {
                    for member in members {
                        let member_name = member.name.as_deref().unwrap_or("");
                        collect_input(module, name, member_name, member.binding.as_ref(), member.ty, &mut inputs)?;
                    }
                }
                _ => collect_input(module, name, arg_name, arg.binding.as_ref(), arg.ty, &mut inputs)?,
            }
        }
        inputs.sort_by_key(|i| i.location);
    }
    Ok((entry.name.clone(), inputs))
}

fn collect_input(
    module: &Module,
    shader: &str,
    raw_name: &str,
    binding: Option<&Binding>,
    ty: naga::Handle<naga::Type>,
    out: &mut Vec<ReflectedInput>,
) -> Result<()> {
    let location = match binding {
        Some(Binding::Location { location, .. }) => *location,
        // builtins (vertex_index, instance_index) carry no buffer data
        _ => return Ok(()),
    };
    let (components, kind) = match &module.types[ty].inner {
        TypeInner::Scalar(scalar) => (1u8, scalar.kind),
        TypeInner::Vector { size, scalar } => (vector_len(*size), scalar.kind),
        other => {
            return Err(Error::shader(
                shader,
                format!("input `{raw_name}` has unsupported type {other:?}"),
            ))
        }
    };
    if kind != ScalarKind::Float {
        return Err(Error::shader(shader, format!("input `{raw_name}` must be 32-bit float")));
    }
    let raw_name = if raw_name.is_empty() {
        format!("ATTR{location}")
    } else {
        raw_name.to_string()
    };
    let mask = (1u8 << components) - 1;
    out.push(ReflectedInput::from_raw_name(&raw_name, location, mask));
    Ok(())
}

fn vector_len(size: VectorSize) -> u8 {
    match size {
        VectorSize::Bi => 2,
        VectorSize::Tri => 3,
        VectorSize::Quad => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex_layout::VertexBufferDescription;

    const INSTANCED: &str = r#"
struct VsIn {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) texcoord0: vec2<f32>,
    @location(3) instance_world0: vec4<f32>,
    @location(4) instance_world1: vec4<f32>,
    @location(5) instance_world2: vec4<f32>,
    @location(6) instance_world3: vec4<f32>,
};

@vertex
fn vs_main(vin: VsIn, @builtin(instance_index) idx: u32) -> @builtin(position) vec4<f32> {
    let world = mat4x4<f32>(vin.instance_world0, vin.instance_world1, vin.instance_world2, vin.instance_world3);
    return world * vec4<f32>(vin.position, 1.0);
}
"#;

    #[test]
    fn test_reflect_struct_inputs() {
        let program = ShaderProgram::from_wgsl("InstancedVS.wgsl", ShaderStage::Vertex, INSTANCED).unwrap();
        assert_eq!(program.entry_point, "vs_main");
        assert_eq!(program.inputs.len(), 7);
        assert_eq!(program.inputs[0].semantic_name, "POSITION");
        assert_eq!(program.inputs[0].component_mask, 0b0111);
        assert_eq!(program.inputs[2].semantic_name, "TEXCOORD");
        assert_eq!(program.inputs[2].component_mask, 0b0011);
        assert_eq!(program.inputs[6].semantic_name, "INSTANCE_WORLD");
        assert_eq!(program.inputs[6].semantic_index, 3);

        let layout = VertexBufferDescription::from_reflection(&program.inputs).unwrap();
        assert_eq!(layout.byte_size(), 32);
        assert_eq!(layout.instance_stride(), 64);
    }

    #[test]
    fn test_reflect_loose_arguments() {
        let src = r#"
@vertex
fn main(@location(1) uv: vec2<f32>, @location(0) pos: vec3<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(pos, uv.x);
}
"#;
        let program = ShaderProgram::from_wgsl("SkyVS.wgsl", ShaderStage::Vertex, src).unwrap();
        let names: Vec<&str> = program.inputs.iter().map(|i| i.semantic_name.as_str()).collect();
        assert_eq!(names, vec!["POS", "UV"]);
    }

    #[test]
    fn test_missing_stage_is_an_error() {
        let err = ShaderProgram::from_wgsl("InstancedVS.wgsl", ShaderStage::Pixel, INSTANCED).unwrap_err();
        assert!(err.to_string().contains("no Pixel entry point"));
    }

    #[test]
    fn test_parse_error_names_the_shader() {
        let err = ShaderProgram::from_wgsl("BrokenPS.wgsl", ShaderStage::Pixel, "fn (").unwrap_err();
        assert!(err.to_string().starts_with("shader `BrokenPS.wgsl`"));
    }

    #[test]
    fn test_stage_from_file_name() {
        assert_eq!(stage_for_file_name("InstancedVS"), Some(ShaderStage::Vertex));
        assert_eq!(stage_for_file_name("LunarPS"), Some(ShaderStage::Pixel));
        assert_eq!(stage_for_file_name("common"), None);
    }
}
