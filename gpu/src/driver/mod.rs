//! Native boundary: the primitive operations the facade needs from a GPU driver.
//!
//! The facade never touches device memory, compiles shaders or dispatches
//! work itself. It calls through [`NativeDriver`], passing opaque handles that
//! only the driver can interpret. Three drivers ship with the crate:
//!
//! * [`dylib::DylibDriver`]: a native compute library loaded at runtime
//! * [`host::HostDriver`]: host memory, for tests and dry runs
//! * `wgpu_backend::WgpuDriver`: wgpu with the GLSL frontend (`webgpu-backend` feature)

pub mod dylib;
pub mod host;

use std::sync::Arc;

use crate::events::ErrorRouter;

/// Binding index of a buffer. Monotonic per thread context.
pub type BufferId = u32;

/// Opaque device reference, as understood by the driver that enumerated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub usize);

/// Opaque native buffer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

/// Storage optimisation hint passed to native buffer allocation.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageHint {
    NoReadWrite = 0,
    Read = 1,
    FastRead = 2,
    ReadWrite = 3,
}

/// Per-dimension dispatch maxima reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceLimits(pub [u32; 3]);

impl DeviceLimits {
    pub fn uniform(max: u32) -> Self {
        DeviceLimits([max; 3])
    }

    /// Split `process_count` invocations into workgroup counts `[x, y, z]`.
    ///
    /// `z` is filled first, then `y`, then `x`, matching the flattened job
    /// index `x * (ny * nz) + y * nz + z`. The grid covers at least
    /// `process_count` invocations and over-dispatches by less than one
    /// `y * z` slab. Returns `None` when the count does not fit the limits.
    pub fn split(&self, process_count: u64) -> Option<[u32; 3]> {
        let [lx, ly, lz] = self.0.map(u64::from);
        if process_count == 0 || lx == 0 || ly == 0 || lz == 0 {
            return None;
        }
        let capacity = lx.saturating_mul(ly).saturating_mul(lz);
        if process_count > capacity {
            return None;
        }

        let z = process_count.min(lz);
        let y = process_count.div_ceil(z).min(ly);
        let x = process_count.div_ceil(y * z);
        if x > lx {
            return None;
        }
        Some([x as u32, y as u32, z as u32])
    }
}

/// One entry of the driver's device table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    /// Output the device drives, or a backend label for headless devices.
    pub monitor_name: String,
    pub limits: DeviceLimits,
    pub handle: DeviceHandle,
}

/// Primitive operations provided by a native GPU driver.
///
/// Context activation is per calling thread on the native side: after
/// `set_active_context`, allocation, compilation and dispatch issued from the
/// same thread target that device. Implementations must tolerate being called
/// from many threads at once.
pub trait NativeDriver: Send + Sync {
    /// Short driver name for logs.
    fn name(&self) -> &str;

    /// One-time setup. Registers the native error callbacks so they publish to `errors`.
    fn initialize(&self, errors: Arc<ErrorRouter>);

    /// Release everything the driver holds. Called once, by facade disposal.
    fn release_resources(&self);

    /// Ask the driver to re-scan the system for devices.
    fn refresh_devices(&self);

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor>;

    fn create_context(&self, device: DeviceHandle) -> bool;

    fn dispose_context(&self, device: DeviceHandle);

    fn set_active_context(&self, device: DeviceHandle);

    /// Allocate `byte_len` bytes on the calling thread's active device,
    /// optionally initialised from `initial` (exactly `byte_len` bytes).
    fn allocate_buffer(
        &self,
        hint: StorageHint,
        id: BufferId,
        initial: Option<&[u8]>,
        byte_len: usize,
    ) -> Option<BufferHandle>;

    fn free_buffer(&self, buffer: BufferHandle);

    /// Blocking copy of `dst.len()` bytes starting at `byte_offset`.
    fn read_buffer(&self, buffer: BufferHandle, byte_offset: u64, dst: &mut [u8]) -> bool;

    /// Blocking copy of `src` into the buffer starting at `byte_offset`.
    fn write_buffer(&self, buffer: BufferHandle, byte_offset: u64, src: &[u8]) -> bool;

    /// Compile complete shader source. Diagnostics go to the error router.
    fn compile_program(&self, source: &str) -> Option<ProgramHandle>;

    fn load_program(&self, bytes: &[u8]) -> Option<ProgramHandle>;

    fn save_program(&self, program: ProgramHandle) -> Option<Vec<u8>>;

    /// Dispatch `process_count` invocations. Diagnostics go to the error router.
    fn run_program(&self, program: ProgramHandle, limits: DeviceLimits, process_count: u64)
        -> bool;
}
