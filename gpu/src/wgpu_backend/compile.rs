//! GLSL shader compilation: assembled GLSL source → wgpu::ComputePipeline

use std::borrow::Cow;
use std::sync::Arc;

use wgpu;

use super::device_init::WgpuContext;
use crate::driver::BufferId;

/// A compiled compute program and the bindings its layout was built for.
pub struct WgpuProgram {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
    /// `(binding, buffer handle)` pairs, ascending by binding.
    pub bindings: Vec<(BufferId, u64)>,
    pub source: String,
    pub ctx: Arc<WgpuContext>,
}

/// Lowest `#version` naga's GLSL frontend parses.
const NAGA_MIN_VERSION: u32 = 440;
const NAGA_VERSION_LINE: &str = "#version 450";

/// Raise a leading `#version` below [`NAGA_MIN_VERSION`] to 450. The storage
/// blocks and built-ins the preamble uses read the same under both.
pub(crate) fn for_naga(source: &str) -> Cow<'_, str> {
    let (first, rest) = match source.find('\n') {
        Some(end) => source.split_at(end),
        None => (source, ""),
    };
    let version = first
        .trim()
        .strip_prefix("#version")
        .and_then(|v| v.split_whitespace().next())
        .and_then(|v| v.parse::<u32>().ok());
    match version {
        Some(v) if v < NAGA_MIN_VERSION => Cow::Owned(format!("{}{}", NAGA_VERSION_LINE, rest)),
        _ => Cow::Borrowed(source),
    }
}

/// Compile GLSL compute source with an explicit layout covering `bindings`.
///
/// The layout is explicit (not reflected) so buffers the shader declares but
/// never touches still line up with the bind group built at dispatch time.
pub fn compile_glsl(
    ctx: &Arc<WgpuContext>,
    source: &str,
    bindings: Vec<(BufferId, u64)>,
) -> Result<WgpuProgram, String> {
    let device = &ctx.device;
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
        .iter()
        .map(|(binding, _)| wgpu::BindGroupLayoutEntry {
            binding: *binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("cinder_bind_group_layout"),
        entries: &entries,
    });
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("cinder_pipeline_layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("cinder_compute_shader"),
        source: wgpu::ShaderSource::Glsl {
            shader: for_naga(source),
            stage: wgpu::naga::ShaderStage::Compute,
            defines: Default::default(),
        },
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("cinder_compute_pipeline"),
        layout: Some(&layout),
        module: &shader_module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });

    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(err.to_string());
    }

    Ok(WgpuProgram {
        pipeline,
        bind_group_layout,
        bindings,
        source: source.to_string(),
        ctx: Arc::clone(ctx),
    })
}
