//! Cinder GPU compute: a managed façade over native compute drivers
//!
//! The façade tracks devices, per-thread buffers and compiled programs on
//! top of a [`NativeDriver`], which does the actual enumeration, allocation,
//! compilation and dispatch. Three drivers ship with the crate:
//!
//! - [`driver::dylib::DylibDriver`] loads a native compute library at runtime.
//! - `wgpu_backend::WgpuDriver` runs on wgpu adapters (feature `webgpu-backend`).
//! - [`driver::host::HostDriver`] keeps everything in host memory.
//!
//! User shaders are GLSL compute sources; before compiling, the buffers
//! registered on the calling thread are declared as storage blocks bound at
//! their buffer IDs (see [`codegen::glsl`]).
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cinder_gpu::{BufferDesc, BufferType, Gpu, HostDriver};
//!
//! let gpu = Gpu::new(Arc::new(HostDriver::default()));
//! let device = gpu.devices(false)?.remove(0);
//! gpu.initialize(&device)?;
//!
//! let mut ctx = gpu.thread_context()?;
//! ctx.set_active(&device)?;
//! ctx.create_buffer(&BufferDesc::new("A", BufferType::Float, 4), &[1.0f32, 2.0, 3.0, 4.0])?;
//! let program = ctx.compile("void main() { A[JobIndex] *= 2.0; }", None)?;
//! ctx.run(&program, 4)?;
//! ```

pub mod buffer;
pub mod codegen;
pub mod config;
pub mod context;
pub mod device;
pub mod driver;
pub mod error;
pub mod events;
pub mod facade;
pub mod logging;
pub mod program;

#[cfg(feature = "webgpu-backend")]
pub mod wgpu_backend;

pub use buffer::{BufferDesc, BufferInfo, BufferOptimization, BufferType, ElementType};
pub use config::{Backend, BufferManifest, BufferSpec, Config, ConfigError};
pub use context::ThreadContext;
pub use device::{Device, DeviceId, DeviceState};
pub use driver::host::HostDriver;
pub use driver::{DeviceLimits, NativeDriver};
pub use error::{GpuError, GpuResult, NativeOp};
pub use events::{ErrorKind, ErrorRouter, NativeError, SubscriptionId};
pub use facade::{FacadeState, Gpu};
pub use program::Program;
