//! Per-thread compute state.
//!
//! A [`ThreadContext`] holds what belongs to one thread: the active device
//! and the named buffer table. It is `!Send`, and a facade hands out at most
//! one live context per thread, so the thread confinement of buffers is
//! enforced by the type system rather than by convention.
//!
//! The buffer ID counter outlives the context. It is kept per thread and per
//! facade, so a context reopened on the same thread continues where the
//! previous one stopped and programs compiled earlier never see their
//! bindings reassigned.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use bytemuck::Pod;

use crate::buffer::{Buffer, BufferDesc, BufferInfo, BufferRegistry};
use crate::codegen::glsl::{self, BufferDecl};
use crate::device::{Device, DeviceState};
use crate::driver::BufferId;
use crate::error::{GpuError, GpuResult, NativeOp};
use crate::facade::Gpu;
use crate::program::Program;

thread_local! {
    // Facade ids with a live context on this thread.
    static LIVE_CONTEXTS: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
    // Next buffer ID per facade id, carried across contexts on this thread.
    static NEXT_BUFFER_IDS: RefCell<HashMap<u64, BufferId>> = RefCell::new(HashMap::new());
}

/// Compute state confined to the thread that opened it.
pub struct ThreadContext {
    gpu: Gpu,
    active: Option<Device>,
    buffers: BufferRegistry,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("active", &self.active.as_ref().map(Device::id))
            .field("buffers", &self.buffers.names())
            .finish()
    }
}

impl ThreadContext {
    pub(crate) fn open(gpu: Gpu) -> GpuResult<Self> {
        let claimed = LIVE_CONTEXTS.with(|live| live.borrow_mut().insert(gpu.id()));
        if !claimed {
            return Err(GpuError::ContextInUse);
        }
        let next_id = NEXT_BUFFER_IDS
            .with(|ids| ids.borrow().get(&gpu.id()).copied())
            .unwrap_or(0);
        log::trace!(
            "thread context opened on {:?}, next buffer id {}",
            std::thread::current().id(),
            next_id
        );
        Ok(ThreadContext {
            gpu,
            active: None,
            buffers: BufferRegistry::starting_at(next_id),
            _not_send: PhantomData,
        })
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    // ------------------------------------------------------------------
    // Device affinity
    // ------------------------------------------------------------------

    /// Bind `device` to this thread, replacing any previous binding.
    pub fn set_active(&mut self, device: &Device) -> GpuResult<()> {
        self.gpu.check_active()?;
        match self.gpu.registry().state(device)? {
            DeviceState::Initialized => {}
            DeviceState::Uninitialized => {
                return Err(GpuError::NotInitialized(device.name().to_string()))
            }
            DeviceState::Disposed => {
                return Err(GpuError::DeviceDisposed(device.name().to_string()))
            }
        }
        self.gpu.driver().set_active_context(device.handle());
        log::debug!("device {} active on {:?}", device, std::thread::current().id());
        self.active = Some(device.clone());
        Ok(())
    }

    pub fn is_active(&self, device: &Device) -> GpuResult<bool> {
        self.gpu.check_active()?;
        Ok(self.active.as_ref().is_some_and(|d| d.id() == device.id()))
    }

    pub fn active_device(&self) -> GpuResult<Option<&Device>> {
        self.gpu.check_active()?;
        Ok(self.active.as_ref())
    }

    fn require_device(&self) -> GpuResult<&Device> {
        self.active.as_ref().ok_or(GpuError::NoActiveDevice)
    }

    /// The active device, if it still has a live native context.
    fn require_initialized_device(&self) -> GpuResult<&Device> {
        let device = self.require_device()?;
        if !self.gpu.registry().is_initialized(device) {
            return Err(GpuError::NotInitialized(device.name().to_string()));
        }
        Ok(device)
    }

    fn is_stale(&self, buffer: &Buffer) -> bool {
        !self.gpu.registry().is_initialized(&buffer.device)
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    pub fn exists(&self, name: &str) -> GpuResult<bool> {
        self.gpu.check_active()?;
        Ok(self.buffers.exists(name))
    }

    /// Create a buffer from `data[desc.offset..desc.offset + desc.count]`.
    pub fn create_buffer<T: Pod>(&mut self, desc: &BufferDesc, data: &[T]) -> GpuResult<BufferInfo> {
        let end = desc.offset.checked_add(desc.count);
        if end.map_or(true, |end| end > data.len()) {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{}' needs {} elements from offset {}, source holds {}",
                desc.name,
                desc.count,
                desc.offset,
                data.len()
            )));
        }
        let size = std::mem::size_of::<T>();
        self.create_buffer_raw(
            &BufferDesc {
                offset: 0,
                ..desc.clone()
            },
            size,
            Some(bytemuck::cast_slice(&data[desc.offset..desc.offset + desc.count])),
        )
    }

    /// Create a buffer of `desc.count` elements of `T` without initial data.
    pub fn create_buffer_zeroed<T: Pod>(&mut self, desc: &BufferDesc) -> GpuResult<BufferInfo> {
        self.create_buffer_raw(desc, std::mem::size_of::<T>(), None)
    }

    /// Create a buffer with an explicit element stride. `initial`, when
    /// present, holds whole elements and is read from `desc.offset`.
    pub fn create_buffer_raw(
        &mut self,
        desc: &BufferDesc,
        element_size: usize,
        initial: Option<&[u8]>,
    ) -> GpuResult<BufferInfo> {
        self.gpu.check_active()?;
        let element = desc.element_type()?;
        if element_size == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{}' has a zero-sized element type",
                desc.name
            )));
        }
        if self.buffers.exists(&desc.name) {
            return Err(GpuError::AlreadyExists(desc.name.clone()));
        }
        let device = self.require_initialized_device()?.clone();

        let byte_len = element_size.checked_mul(desc.count).ok_or_else(|| {
            GpuError::InvalidArgument(format!("buffer '{}' is too large", desc.name))
        })?;
        let initial = match initial {
            Some(bytes) => {
                let start = desc.offset.checked_mul(element_size);
                let range = start.and_then(|s| Some(s..s.checked_add(byte_len)?));
                match range.and_then(|r| bytes.get(r)) {
                    Some(slice) => Some(slice),
                    None => {
                        return Err(GpuError::InvalidArgument(format!(
                            "initial data for buffer '{}' is shorter than {} bytes",
                            desc.name, byte_len
                        )))
                    }
                }
            }
            None => None,
        };

        let id = self.buffers.next_id();
        let handle = self
            .gpu
            .driver()
            .allocate_buffer(desc.optimization.storage_hint(), id, initial, byte_len)
            .ok_or(GpuError::NativeFailure(NativeOp::AllocateBuffer))?;

        let buffer = Buffer {
            id,
            element,
            byte_len,
            handle,
            device,
        };
        let info = buffer.info(&desc.name);
        log::debug!(
            "buffer '{}' created: binding {} {} ({} bytes)",
            desc.name,
            id,
            info.element,
            byte_len
        );
        self.buffers.insert(desc.name.clone(), buffer);
        Ok(info)
    }

    /// Remove a buffer and free its native memory. IDs are not reused.
    pub fn remove_buffer(&mut self, name: &str) -> GpuResult<()> {
        self.gpu.check_active()?;
        let buffer = self
            .buffers
            .remove(name)
            .ok_or_else(|| GpuError::NotFound(name.to_string()))?;
        if self.is_stale(&buffer) {
            log::debug!("buffer '{}' removed (device gone, nothing to free)", name);
        } else {
            self.gpu.driver().free_buffer(buffer.handle);
            log::debug!("buffer '{}' removed", name);
        }
        Ok(())
    }

    pub fn info(&self, name: &str) -> GpuResult<BufferInfo> {
        self.gpu.check_active()?;
        self.buffers
            .get(name)
            .map(|b| b.info(name))
            .ok_or_else(|| GpuError::NotFound(name.to_string()))
    }

    /// Buffer names in binding order.
    pub fn names(&self) -> GpuResult<Vec<String>> {
        self.gpu.check_active()?;
        Ok(self.buffers.names())
    }

    fn transfer_target(&self, name: &str, byte_offset: u64, len: usize) -> GpuResult<&Buffer> {
        self.gpu.check_active()?;
        let buffer = self
            .buffers
            .get(name)
            .ok_or_else(|| GpuError::NotFound(name.to_string()))?;
        self.require_device()?;
        if self.is_stale(buffer) {
            return Err(GpuError::StaleBuffer(name.to_string()));
        }
        if !buffer.contains(byte_offset, len) {
            return Err(GpuError::InvalidArgument(format!(
                "{} bytes at offset {} exceed buffer '{}' ({} bytes)",
                len, byte_offset, name, buffer.byte_len
            )));
        }
        Ok(buffer)
    }

    /// Copy from the buffer at `byte_offset` into `dst`. Blocks until the
    /// transfer completes.
    pub fn read<T: Pod>(&self, name: &str, byte_offset: u64, dst: &mut [T]) -> GpuResult<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        let buffer = self.transfer_target(name, byte_offset, bytes.len())?;
        log::trace!("read {} bytes from '{}' @ {}", bytes.len(), name, byte_offset);
        if self.gpu.driver().read_buffer(buffer.handle, byte_offset, bytes) {
            Ok(())
        } else {
            Err(GpuError::NativeFailure(NativeOp::ReadBuffer))
        }
    }

    /// Copy `src` into the buffer at `byte_offset`. Blocks until the
    /// transfer completes.
    pub fn write<T: Pod>(&self, name: &str, byte_offset: u64, src: &[T]) -> GpuResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(src);
        let buffer = self.transfer_target(name, byte_offset, bytes.len())?;
        log::trace!("write {} bytes to '{}' @ {}", bytes.len(), name, byte_offset);
        if self.gpu.driver().write_buffer(buffer.handle, byte_offset, bytes) {
            Ok(())
        } else {
            Err(GpuError::NativeFailure(NativeOp::WriteBuffer))
        }
    }

    // ------------------------------------------------------------------
    // Programs
    // ------------------------------------------------------------------

    /// Prepend the preamble for this thread's buffers to `source`.
    pub fn assemble(&self, source: &str, custom_types: Option<&str>) -> GpuResult<String> {
        self.gpu.check_active()?;
        if let Some((name, _)) = self.buffers.iter().find(|(_, b)| self.is_stale(b)) {
            return Err(GpuError::StaleBuffer(name.to_string()));
        }
        let decls: Vec<BufferDecl<'_>> = self
            .buffers
            .iter()
            .map(|(name, b)| BufferDecl {
                id: b.id,
                name,
                element: &b.element,
            })
            .collect();
        Ok(glsl::assemble(&decls, source, custom_types))
    }

    /// Assemble and compile. Compiler diagnostics go to the error router.
    pub fn compile(&self, source: &str, custom_types: Option<&str>) -> GpuResult<Program> {
        let assembled = self.assemble(source, custom_types)?;
        self.compile_raw(&assembled)
    }

    /// Compile `source` as-is, without a preamble. Needs an active device.
    pub fn compile_raw(&self, source: &str) -> GpuResult<Program> {
        self.gpu.check_active()?;
        self.require_initialized_device()?;
        match self.gpu.driver().compile_program(source) {
            Some(handle) => {
                log::debug!("program {:?} compiled ({} bytes of source)", handle, source.len());
                Ok(Program::new(handle))
            }
            None => Err(GpuError::NativeFailure(NativeOp::CompileProgram)),
        }
    }

    /// Load a program from bytes produced by [`Self::save`].
    pub fn load(&self, bytes: &[u8]) -> GpuResult<Program> {
        self.gpu.check_active()?;
        self.require_device()?;
        self.gpu
            .driver()
            .load_program(bytes)
            .map(Program::new)
            .ok_or(GpuError::NativeFailure(NativeOp::LoadProgram))
    }

    pub fn save(&self, program: &Program) -> GpuResult<Vec<u8>> {
        self.gpu.check_active()?;
        self.require_device()?;
        self.gpu
            .driver()
            .save_program(program.handle())
            .ok_or(GpuError::NativeFailure(NativeOp::SaveProgram))
    }

    /// Dispatch `process_count` invocations on the active device. `Ok(false)`
    /// means the driver reported failure; details go to the error router.
    pub fn run(&self, program: &Program, process_count: i64) -> GpuResult<bool> {
        self.gpu.check_active()?;
        if process_count <= 0 {
            return Err(GpuError::InvalidArgument(format!(
                "process count must be positive, got {}",
                process_count
            )));
        }
        let device = self.require_initialized_device()?;
        let ok = self
            .gpu
            .driver()
            .run_program(program.handle(), device.limits(), process_count as u64);
        log::debug!(
            "run {:?} x{} on {}: {}",
            program.handle(),
            process_count,
            device,
            if ok { "ok" } else { "failed" }
        );
        Ok(ok)
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        let id = self.gpu.id();
        // Ignore the error raised when thread-locals are already torn down.
        let _ = LIVE_CONTEXTS.try_with(|live| live.borrow_mut().remove(&id));
        let next_id = self.buffers.next_id();
        let _ = NEXT_BUFFER_IDS.try_with(|ids| ids.borrow_mut().insert(id, next_id));

        if self.gpu.is_disposed() {
            return;
        }
        let registry = self.gpu.registry();
        let driver = self.gpu.driver();
        for (name, buffer) in self.buffers.drain() {
            if registry.is_initialized(&buffer.device) {
                driver.free_buffer(buffer.handle);
                log::trace!("freed buffer '{}' on context drop", name);
            }
        }
    }
}
