//! Dynamic-library driver: binds a native compute library at runtime.
//!
//! The library exports a flat C ABI (device table, context lifecycle, buffer
//! and program primitives, three error-callback registration hooks). Entry
//! points are resolved once with `libloading` and kept as plain function
//! pointers; the [`Library`] is held for as long as the driver lives.
//!
//! Native records are mirrored with `#[repr(C)]` structs. Device handles are
//! indices into the table returned by `GetRawGPUDevices`; buffer handles pack
//! the native buffer name and binding id into one `u64`.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Once};

use libloading::Library;
use parking_lot::Mutex;

use super::{
    BufferHandle, BufferId, DeviceDescriptor, DeviceHandle, DeviceLimits, NativeDriver,
    ProgramHandle, StorageHint,
};
use crate::error::{GpuError, GpuResult};
use crate::events::{self, ErrorRouter};

/// Default scratch size for `SaveComputeProgram`, which does not report the
/// size it needs up front.
pub const DEFAULT_MAX_PROGRAM_BYTES: usize = 16 * 1024 * 1024;

// ============================================================================
// Native records
// ============================================================================

/// Native device record, as laid out by the library.
#[repr(C)]
pub struct RawDevice {
    pub context: *mut c_void,
    pub monitor: *mut c_void,
    pub display_name: *const c_char,
    pub monitor_name: *const c_char,
    pub limits: [c_int; 3],
}

/// Native buffer record, returned by value from `AllocateGPUBuffer`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    pub buffer: c_uint,
    pub buffer_id: c_int,
}

impl RawBuffer {
    fn to_handle(self) -> BufferHandle {
        BufferHandle((u64::from(self.buffer_id as u32) << 32) | u64::from(self.buffer))
    }

    fn from_handle(handle: BufferHandle) -> Self {
        RawBuffer {
            buffer: handle.0 as u32,
            buffer_id: (handle.0 >> 32) as u32 as c_int,
        }
    }
}

type ContextErrorCallback = unsafe extern "C" fn(*const c_char, *const c_char, *const c_char);
type MessageCallback = unsafe extern "C" fn(*const c_char);

/// Resolved entry points.
#[derive(Clone, Copy)]
struct Entrypoints {
    initialize: unsafe extern "C" fn(),
    release_resources: unsafe extern "C" fn(),
    refresh_devices: unsafe extern "C" fn(),
    get_devices: unsafe extern "C" fn(*mut *mut RawDevice) -> c_int,
    create_context: unsafe extern "C" fn(*mut RawDevice) -> c_int,
    dispose_context: unsafe extern "C" fn(*mut RawDevice),
    set_active_context: unsafe extern "C" fn(*mut RawDevice),
    allocate_buffer: unsafe extern "C" fn(StorageHint, c_int, *const c_void, i64) -> RawBuffer,
    free_buffer: unsafe extern "C" fn(*mut RawBuffer),
    read_buffer: unsafe extern "C" fn(*mut RawBuffer, *mut c_void, i64, i64),
    write_buffer: unsafe extern "C" fn(*mut RawBuffer, *mut c_void, i64, i64),
    compile_program: unsafe extern "C" fn(*const c_char, *mut c_uint) -> c_int,
    load_program: unsafe extern "C" fn(*const u8, c_int, *mut c_uint) -> c_int,
    save_program: unsafe extern "C" fn(c_uint, *mut u8) -> c_int,
    run_program: unsafe extern "C" fn(c_uint, *mut c_int, i64, c_int) -> c_int,
    on_context_error: unsafe extern "C" fn(ContextErrorCallback),
    on_compile_error: unsafe extern "C" fn(MessageCallback),
    on_run_error: unsafe extern "C" fn(MessageCallback),
}

/// Look up `name` and copy the function pointer out of the symbol.
///
/// # Safety
/// `T` must match the exported function's real signature.
unsafe fn resolve<T: Copy>(library: &Library, name: &str) -> GpuResult<T> {
    let symbol: libloading::Symbol<T> = library
        .get(name.as_bytes())
        .map_err(|e| GpuError::Driver(format!("symbol '{}' not found: {}", name, e)))?;
    Ok(*symbol)
}

impl Entrypoints {
    unsafe fn resolve_all(lib: &Library) -> GpuResult<Self> {
        Ok(Entrypoints {
            initialize: resolve(lib, "Initialize")?,
            release_resources: resolve(lib, "ReleaseResources")?,
            refresh_devices: resolve(lib, "RefreshGPUList")?,
            get_devices: resolve(lib, "GetRawGPUDevices")?,
            create_context: resolve(lib, "CreateGPUContext")?,
            dispose_context: resolve(lib, "DisposeGPUContext")?,
            set_active_context: resolve(lib, "SetActiveGPUContext")?,
            allocate_buffer: resolve(lib, "AllocateGPUBuffer")?,
            free_buffer: resolve(lib, "DeallocateGPUBuffer")?,
            read_buffer: resolve(lib, "ReadFromGPUBuffer")?,
            write_buffer: resolve(lib, "WriteToGPUBuffer")?,
            compile_program: resolve(lib, "CompileProgram")?,
            load_program: resolve(lib, "LoadComputeProgram")?,
            save_program: resolve(lib, "SaveComputeProgram")?,
            run_program: resolve(lib, "RunComputeProgram")?,
            on_context_error: resolve(lib, "RegisterOnGLFWErrorMethod")?,
            on_compile_error: resolve(lib, "RegisterOnShaderCompileErrorMethod")?,
            on_run_error: resolve(lib, "RegisterOnProgramRunErrorMethod")?,
        })
    }
}

// ============================================================================
// Error callbacks
// ============================================================================

/// Decode a native C string. Null becomes the empty string.
unsafe fn decode(text: *const c_char) -> String {
    if text.is_null() {
        return String::new();
    }
    CStr::from_ptr(text).to_string_lossy().into_owned()
}

// Callbacks must not unwind into native frames; subscriber panics are contained here.
fn forward(publish: impl FnOnce(&ErrorRouter)) {
    let Some(router) = events::process_sink() else {
        return;
    };
    if panic::catch_unwind(AssertUnwindSafe(|| publish(&router))).is_err() {
        log::error!("error subscriber panicked while handling a native callback");
    }
}

unsafe extern "C" fn on_context_error(
    code: *const c_char,
    function: *const c_char,
    description: *const c_char,
) {
    let (code, function, description) = (decode(code), decode(function), decode(description));
    forward(|r| r.publish_internal(&code, &function, &description));
}

unsafe extern "C" fn on_compile_error(description: *const c_char) {
    let description = decode(description);
    forward(|r| r.publish_compile(&description));
}

unsafe extern "C" fn on_run_error(description: *const c_char) {
    let description = decode(description);
    forward(|r| r.publish_run(&description));
}

// ============================================================================
// Driver
// ============================================================================

struct DeviceTable {
    base: *mut RawDevice,
    len: usize,
}

// SAFETY: the table is owned by the native library for the life of the
// process (until the next refresh); the pointer is only dereferenced while
// the surrounding mutex is held.
unsafe impl Send for DeviceTable {}

/// [`NativeDriver`] backed by a dynamically loaded native library.
pub struct DylibDriver {
    api: Entrypoints,
    devices: Mutex<DeviceTable>,
    max_program_bytes: usize,
    init: Once,
    // Dropped last: function pointers in `api` point into it.
    _library: Library,
}

// SAFETY: the library is loaded once and kept alive; entry points are plain
// function pointers and the native API is documented as thread-aware.
unsafe impl Send for DylibDriver {}
unsafe impl Sync for DylibDriver {}

impl DylibDriver {
    /// Load the library at `path` and resolve every entry point.
    pub fn load(path: &Path, max_program_bytes: usize) -> GpuResult<Self> {
        let library = unsafe {
            Library::new(path).map_err(|e| {
                GpuError::Driver(format!("failed to load {}: {}", path.display(), e))
            })?
        };
        let api = unsafe { Entrypoints::resolve_all(&library)? };

        log::info!("loaded native compute library {}", path.display());

        Ok(DylibDriver {
            api,
            devices: Mutex::new(DeviceTable {
                base: ptr::null_mut(),
                len: 0,
            }),
            max_program_bytes: max_program_bytes.max(1),
            init: Once::new(),
            _library: library,
        })
    }

    fn with_device<R>(&self, device: DeviceHandle, f: impl FnOnce(*mut RawDevice) -> R) -> Option<R> {
        let table = self.devices.lock();
        if table.base.is_null() || device.0 >= table.len {
            log::warn!("dylib: device handle {} is not in the native table", device.0);
            return None;
        }
        // SAFETY: index checked against the length the library reported.
        let raw = unsafe { table.base.add(device.0) };
        Some(f(raw))
    }
}

impl NativeDriver for DylibDriver {
    fn name(&self) -> &str {
        "dylib"
    }

    fn initialize(&self, errors: Arc<ErrorRouter>) {
        events::install_process_sink(errors);
        self.init.call_once(|| unsafe {
            (self.api.initialize)();
            (self.api.on_context_error)(on_context_error);
            (self.api.on_compile_error)(on_compile_error);
            (self.api.on_run_error)(on_run_error);
        });
    }

    fn release_resources(&self) {
        unsafe { (self.api.release_resources)() };
        let mut table = self.devices.lock();
        table.base = ptr::null_mut();
        table.len = 0;
    }

    fn refresh_devices(&self) {
        unsafe { (self.api.refresh_devices)() };
    }

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        let mut base: *mut RawDevice = ptr::null_mut();
        let count = unsafe { (self.api.get_devices)(&mut base) };
        let len = if base.is_null() { 0 } else { count.max(0) as usize };

        let mut table = self.devices.lock();
        table.base = base;
        table.len = len;

        (0..len)
            .map(|i| {
                // SAFETY: the library reported `len` contiguous records at `base`.
                let raw = unsafe { &*base.add(i) };
                DeviceDescriptor {
                    name: unsafe { decode(raw.display_name) },
                    monitor_name: unsafe { decode(raw.monitor_name) },
                    limits: DeviceLimits(raw.limits.map(|l| l.max(0) as u32)),
                    handle: DeviceHandle(i),
                }
            })
            .collect()
    }

    fn create_context(&self, device: DeviceHandle) -> bool {
        self.with_device(device, |raw| unsafe { (self.api.create_context)(raw) != 0 })
            .unwrap_or(false)
    }

    fn dispose_context(&self, device: DeviceHandle) {
        self.with_device(device, |raw| unsafe { (self.api.dispose_context)(raw) });
    }

    fn set_active_context(&self, device: DeviceHandle) {
        self.with_device(device, |raw| unsafe { (self.api.set_active_context)(raw) });
    }

    fn allocate_buffer(
        &self,
        hint: StorageHint,
        id: BufferId,
        initial: Option<&[u8]>,
        byte_len: usize,
    ) -> Option<BufferHandle> {
        let data = match initial {
            Some(bytes) if bytes.len() != byte_len => return None,
            Some(bytes) => bytes.as_ptr() as *const c_void,
            None => ptr::null(),
        };
        let raw = unsafe {
            (self.api.allocate_buffer)(hint, id as c_int, data, byte_len as i64)
        };
        // Buffer name 0 is never a valid native buffer.
        if raw.buffer == 0 {
            return None;
        }
        Some(raw.to_handle())
    }

    fn free_buffer(&self, buffer: BufferHandle) {
        let mut raw = RawBuffer::from_handle(buffer);
        unsafe { (self.api.free_buffer)(&mut raw) };
    }

    fn read_buffer(&self, buffer: BufferHandle, byte_offset: u64, dst: &mut [u8]) -> bool {
        let mut raw = RawBuffer::from_handle(buffer);
        unsafe {
            (self.api.read_buffer)(
                &mut raw,
                dst.as_mut_ptr() as *mut c_void,
                byte_offset as i64,
                dst.len() as i64,
            )
        };
        true
    }

    fn write_buffer(&self, buffer: BufferHandle, byte_offset: u64, src: &[u8]) -> bool {
        let mut raw = RawBuffer::from_handle(buffer);
        // The native signature takes a mutable pointer but only reads from it.
        unsafe {
            (self.api.write_buffer)(
                &mut raw,
                src.as_ptr() as *mut c_void,
                byte_offset as i64,
                src.len() as i64,
            )
        };
        true
    }

    fn compile_program(&self, source: &str) -> Option<ProgramHandle> {
        let source = match CString::new(source) {
            Ok(s) => s,
            Err(e) => {
                forward(|r| {
                    r.publish_compile(&format!(
                        "shader source contains a NUL byte at offset {}",
                        e.nul_position()
                    ))
                });
                return None;
            }
        };
        let mut program: c_uint = 0;
        let ok = unsafe { (self.api.compile_program)(source.as_ptr(), &mut program) };
        (ok != 0).then_some(ProgramHandle(u64::from(program)))
    }

    fn load_program(&self, bytes: &[u8]) -> Option<ProgramHandle> {
        let count = c_int::try_from(bytes.len()).ok()?;
        let mut program: c_uint = 0;
        let ok = unsafe { (self.api.load_program)(bytes.as_ptr(), count, &mut program) };
        (ok != 0).then_some(ProgramHandle(u64::from(program)))
    }

    fn save_program(&self, program: ProgramHandle) -> Option<Vec<u8>> {
        let mut scratch = vec![0u8; self.max_program_bytes];
        let written = unsafe { (self.api.save_program)(program.0 as c_uint, scratch.as_mut_ptr()) };
        if written <= 0 {
            return None;
        }
        let written = written as usize;
        if written > scratch.len() {
            log::error!(
                "dylib: program binary of {} bytes overran the {} byte scratch buffer",
                written,
                scratch.len()
            );
            return None;
        }
        scratch.truncate(written);
        Some(scratch)
    }

    fn run_program(
        &self,
        program: ProgramHandle,
        limits: DeviceLimits,
        process_count: u64,
    ) -> bool {
        let mut native_limits = limits.0.map(|l| l.min(c_int::MAX as u32) as c_int);
        let count = i64::try_from(process_count).unwrap_or(i64::MAX);
        let ok = unsafe {
            (self.api.run_program)(program.0 as c_uint, native_limits.as_mut_ptr(), count, 0)
        };
        ok != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_handle_packing() {
        let raw = RawBuffer {
            buffer: 0xdead_beef,
            buffer_id: 7,
        };
        let handle = raw.to_handle();
        assert_eq!(handle.0, (7u64 << 32) | 0xdead_beef);
        assert_eq!(RawBuffer::from_handle(handle), raw);
    }

    #[test]
    fn test_decode_handles_null_and_invalid_utf8() {
        assert_eq!(unsafe { decode(ptr::null()) }, "");
        let bytes = b"bad \xff byte\0";
        let text = unsafe { decode(bytes.as_ptr() as *const c_char) };
        assert_eq!(text, "bad \u{fffd} byte");
    }

    #[test]
    fn test_load_missing_library_reports_driver_error() {
        let err = DylibDriver::load(Path::new("/nonexistent/libnative_compute.so"), 1024)
            .err()
            .expect("load must fail");
        assert!(matches!(err, GpuError::Driver(_)));
    }
}
