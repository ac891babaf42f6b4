//! WebGPU compute dispatch: encodes and submits one program run.

use std::sync::Arc;

use wgpu;

use super::buffer_ops::WgpuBuffer;
use super::compile::WgpuProgram;

/// Dispatch `program` over `workgroups` with `buffers` bound in binding order.
///
/// Blocks until the device is idle. Validation errors are returned as text.
pub fn dispatch_workgroups(
    program: &WgpuProgram,
    buffers: &[Arc<WgpuBuffer>],
    workgroups: [u32; 3],
) -> Result<(), String> {
    let ctx = &program.ctx;
    ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);

    let entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .map(|buf| wgpu::BindGroupEntry {
            binding: buf.id,
            resource: buf.buffer.as_entire_binding(),
        })
        .collect();

    let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("cinder_dispatch_bg"),
        layout: &program.bind_group_layout,
        entries: &entries,
    });

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("cinder_dispatch"),
        });

    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("cinder_compute_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&program.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
    }

    ctx.queue.submit(std::iter::once(encoder.finish()));
    ctx.device.poll(wgpu::Maintain::Wait);

    match pollster::block_on(ctx.device.pop_error_scope()) {
        Some(err) => Err(err.to_string()),
        None => Ok(()),
    }
}
