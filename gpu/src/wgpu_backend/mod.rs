//! WebGPU backend for GPU compute (cross-platform via wgpu)
//!
//! Adapters are devices. Assembled GLSL goes through wgpu's GLSL frontend;
//! compile and dispatch validation errors are captured with error scopes and
//! published on the error router. wgpu has no program binary format, so a
//! saved program is its shader source and loading one recompiles it.
//!
//! Buffer and program tables hold `Arc`s; entries are cloned out under the
//! table lock and the lock is released before any transfer or dispatch
//! blocks on the device.

pub mod buffer_ops;
pub mod compile;
pub mod device_init;
pub mod dispatch;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};

use crate::driver::{
    BufferHandle, BufferId, DeviceDescriptor, DeviceHandle, DeviceLimits, NativeDriver,
    ProgramHandle, StorageHint,
};
use crate::events::ErrorRouter;
use buffer_ops::WgpuBuffer;
use compile::WgpuProgram;
use device_init::WgpuContext;

/// [`NativeDriver`] over wgpu.
pub struct WgpuDriver {
    instance: wgpu::Instance,
    adapters: RwLock<Vec<wgpu::Adapter>>,
    contexts: RwLock<HashMap<usize, Arc<WgpuContext>>>,
    active: Mutex<HashMap<ThreadId, usize>>,
    buffers: Mutex<HashMap<u64, Arc<WgpuBuffer>>>,
    programs: Mutex<HashMap<u64, Arc<WgpuProgram>>>,
    next_handle: AtomicU64,
    errors: RwLock<Option<Arc<ErrorRouter>>>,
}

impl Default for WgpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl WgpuDriver {
    pub fn new() -> Self {
        let instance = device_init::create_instance();
        let adapters = device_init::enumerate_adapters(&instance);
        WgpuDriver {
            instance,
            adapters: RwLock::new(adapters),
            contexts: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            errors: RwLock::new(None),
        }
    }

    fn active_context(&self) -> Option<Arc<WgpuContext>> {
        let index = *self.active.lock().get(&thread::current().id())?;
        self.contexts.read().get(&index).cloned()
    }

    fn report_compile(&self, description: &str) {
        if let Some(errors) = self.errors.read().as_ref() {
            errors.publish_compile(description);
        }
    }

    fn report_run(&self, description: &str) {
        if let Some(errors) = self.errors.read().as_ref() {
            errors.publish_run(description);
        }
    }

    fn buffer(&self, handle: BufferHandle) -> Option<Arc<WgpuBuffer>> {
        self.buffers.lock().get(&handle.0).cloned()
    }

    fn dispatch(
        &self,
        program: ProgramHandle,
        limits: DeviceLimits,
        process_count: u64,
    ) -> Result<(), String> {
        let program = self
            .programs
            .lock()
            .get(&program.0)
            .cloned()
            .ok_or_else(|| "wgpu: unknown program".to_string())?;
        let workgroups = limits.split(process_count).ok_or_else(|| {
            format!(
                "wgpu: {} invocations exceed device limits {:?}",
                process_count, limits.0
            )
        })?;

        let bound = {
            let buffers = self.buffers.lock();
            let mut bound = Vec::with_capacity(program.bindings.len());
            for (binding, handle) in &program.bindings {
                let buf = buffers.get(handle).cloned().ok_or_else(|| {
                    format!("wgpu: buffer at binding {} was freed after compile", binding)
                })?;
                bound.push(buf);
            }
            bound
        };
        dispatch::dispatch_workgroups(&program, &bound, workgroups)
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl NativeDriver for WgpuDriver {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn initialize(&self, errors: Arc<ErrorRouter>) {
        *self.errors.write() = Some(errors);
    }

    fn release_resources(&self) {
        self.programs.lock().clear();
        self.buffers.lock().clear();
        self.active.lock().clear();
        self.contexts.write().clear();
    }

    fn refresh_devices(&self) {
        *self.adapters.write() = device_init::enumerate_adapters(&self.instance);
    }

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        self.adapters
            .read()
            .iter()
            .enumerate()
            .map(|(i, adapter)| device_init::describe(adapter, DeviceHandle(i)))
            .collect()
    }

    fn create_context(&self, device: DeviceHandle) -> bool {
        let adapters = self.adapters.read();
        let Some(adapter) = adapters.get(device.0) else {
            return false;
        };
        let errors = self.errors.read().clone();
        match WgpuContext::new(adapter, device, errors) {
            Some(ctx) => {
                self.contexts.write().insert(device.0, Arc::new(ctx));
                true
            }
            None => false,
        }
    }

    fn dispose_context(&self, device: DeviceHandle) {
        self.buffers.lock().retain(|_, b| b.ctx.handle != device);
        self.programs.lock().retain(|_, p| p.ctx.handle != device);
        self.active.lock().retain(|_, idx| *idx != device.0);
        self.contexts.write().remove(&device.0);
    }

    fn set_active_context(&self, device: DeviceHandle) {
        self.active.lock().insert(thread::current().id(), device.0);
    }

    fn allocate_buffer(
        &self,
        hint: StorageHint,
        id: BufferId,
        initial: Option<&[u8]>,
        byte_len: usize,
    ) -> Option<BufferHandle> {
        let ctx = self.active_context()?;
        let buffer = WgpuBuffer::allocate(&ctx, hint, id, initial, byte_len)?;
        let handle = self.next();
        self.buffers.lock().insert(handle, Arc::new(buffer));
        Some(BufferHandle(handle))
    }

    fn free_buffer(&self, buffer: BufferHandle) {
        self.buffers.lock().remove(&buffer.0);
    }

    fn read_buffer(&self, buffer: BufferHandle, byte_offset: u64, dst: &mut [u8]) -> bool {
        self.buffer(buffer).is_some_and(|b| b.read(byte_offset, dst))
    }

    fn write_buffer(&self, buffer: BufferHandle, byte_offset: u64, src: &[u8]) -> bool {
        self.buffer(buffer).is_some_and(|b| b.write(byte_offset, src))
    }

    fn compile_program(&self, source: &str) -> Option<ProgramHandle> {
        let Some(ctx) = self.active_context() else {
            self.report_compile("wgpu: no active context on the calling thread");
            return None;
        };

        let mut bindings: Vec<(BufferId, u64)> = self
            .buffers
            .lock()
            .iter()
            .filter(|(_, b)| b.ctx.handle == ctx.handle)
            .map(|(handle, b)| (b.id, *handle))
            .collect();
        bindings.sort_unstable();

        match compile::compile_glsl(&ctx, source, bindings) {
            Ok(program) => {
                let handle = self.next();
                self.programs.lock().insert(handle, Arc::new(program));
                Some(ProgramHandle(handle))
            }
            Err(msg) => {
                self.report_compile(&msg);
                None
            }
        }
    }

    fn load_program(&self, bytes: &[u8]) -> Option<ProgramHandle> {
        match std::str::from_utf8(bytes) {
            Ok(source) => self.compile_program(source),
            Err(e) => {
                self.report_compile(&format!("wgpu: saved program is not UTF-8: {}", e));
                None
            }
        }
    }

    fn save_program(&self, program: ProgramHandle) -> Option<Vec<u8>> {
        self.programs
            .lock()
            .get(&program.0)
            .map(|p| p.source.clone().into_bytes())
    }

    fn run_program(
        &self,
        program: ProgramHandle,
        limits: DeviceLimits,
        process_count: u64,
    ) -> bool {
        match self.dispatch(program, limits, process_count) {
            Ok(()) => true,
            Err(msg) => {
                self.report_run(&msg);
                false
            }
        }
    }
}
