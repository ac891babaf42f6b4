//! WebGPU adapter discovery and device initialization via wgpu

use std::sync::Arc;

use wgpu;

use crate::driver::{DeviceDescriptor, DeviceHandle, DeviceLimits};
use crate::events::ErrorRouter;

/// A created wgpu device + queue for one adapter.
pub struct WgpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub handle: DeviceHandle,
}

impl WgpuContext {
    /// Open a device on `adapter`. Uncaptured device errors publish as internal errors.
    pub fn new(
        adapter: &wgpu::Adapter,
        handle: DeviceHandle,
        errors: Option<Arc<ErrorRouter>>,
    ) -> Option<Self> {
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("cinder_gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| log::warn!("wgpu: device request failed: {}", e))
        .ok()?;

        if let Some(errors) = errors {
            device.on_uncaptured_error(Box::new(move |e: wgpu::Error| {
                errors.publish_internal("wgpu", "uncaptured", &e.to_string());
            }));
        }

        Some(WgpuContext {
            device,
            queue,
            handle,
        })
    }
}

pub fn create_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

/// All adapters the instance can see.
pub fn enumerate_adapters(instance: &wgpu::Instance) -> Vec<wgpu::Adapter> {
    instance.enumerate_adapters(wgpu::Backends::all())
}

pub fn describe(adapter: &wgpu::Adapter, handle: DeviceHandle) -> DeviceDescriptor {
    let info = adapter.get_info();
    let limits = adapter.limits();
    DeviceDescriptor {
        name: info.name,
        monitor_name: format!("{:?}", info.backend),
        limits: DeviceLimits::uniform(limits.max_compute_workgroups_per_dimension),
        handle,
    }
}
