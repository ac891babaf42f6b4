//! Host-memory driver.
//!
//! Backs buffers with `Vec<u8>`, remembers compiled sources and records every
//! dispatch instead of executing it. Shader text is only checked for balanced
//! delimiters. Used by the test-suite and by dry runs of the CLI, where the
//! point is to exercise the facade's bookkeeping without a GPU.
//!
//! Failures can be injected with [`HostDriver::fail_next`]; an injected
//! context, compile or run failure is also published on the error router
//! from inside the failing call, like a real driver would.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};

use super::{
    BufferHandle, BufferId, DeviceDescriptor, DeviceHandle, DeviceLimits, NativeDriver,
    ProgramHandle, StorageHint,
};
use crate::events::ErrorRouter;

/// Operations whose next call can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFault {
    CreateContext,
    Allocate,
    Transfer,
    Compile,
    Run,
}

/// A buffer allocation as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAllocation {
    pub id: BufferId,
    pub hint: StorageHint,
    pub byte_len: usize,
    pub device: DeviceHandle,
}

/// A recorded dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRun {
    pub program: ProgramHandle,
    pub device: Option<DeviceHandle>,
    pub process_count: u64,
    pub workgroups: [u32; 3],
}

struct HostBuffer {
    bytes: Vec<u8>,
    device: DeviceHandle,
}

#[derive(Default)]
struct HostState {
    contexts: HashSet<usize>,
    active: HashMap<ThreadId, DeviceHandle>,
    buffers: HashMap<u64, HostBuffer>,
    programs: HashMap<u64, String>,
    next_buffer: u64,
    next_program: u64,
    allocations: Vec<HostAllocation>,
    runs: Vec<HostRun>,
    faults: Vec<HostFault>,
    refreshes: usize,
    released: bool,
}

/// In-memory [`NativeDriver`].
pub struct HostDriver {
    devices: Vec<DeviceDescriptor>,
    state: Mutex<HostState>,
    errors: RwLock<Option<Arc<ErrorRouter>>>,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new(1, DeviceLimits::uniform(65535))
    }
}

impl HostDriver {
    /// `count` identical devices with the given dispatch limits.
    pub fn new(count: usize, limits: DeviceLimits) -> Self {
        let devices = (0..count)
            .map(|i| DeviceDescriptor {
                name: format!("Host Device {}", i),
                monitor_name: "headless".to_string(),
                limits,
                handle: DeviceHandle(i),
            })
            .collect();
        Self::with_devices(devices)
    }

    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        HostDriver {
            devices,
            state: Mutex::new(HostState {
                next_buffer: 1,
                next_program: 1,
                ..Default::default()
            }),
            errors: RwLock::new(None),
        }
    }

    /// Make the next call of `fault`'s operation fail.
    pub fn fail_next(&self, fault: HostFault) {
        self.state.lock().faults.push(fault);
    }

    pub fn allocations(&self) -> Vec<HostAllocation> {
        self.state.lock().allocations.clone()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn context_count(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn runs(&self) -> Vec<HostRun> {
        self.state.lock().runs.clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.state.lock().refreshes
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Source text a program was compiled from.
    pub fn program_source(&self, program: ProgramHandle) -> Option<String> {
        self.state.lock().programs.get(&program.0).cloned()
    }

    fn take_fault(state: &mut HostState, fault: HostFault) -> bool {
        match state.faults.iter().position(|f| *f == fault) {
            Some(pos) => {
                state.faults.remove(pos);
                true
            }
            None => false,
        }
    }

    fn report_internal(&self, function: &str, description: &str) {
        if let Some(errors) = self.errors.read().as_ref() {
            errors.publish_internal("HOST", function, description);
        }
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

    fn compile_text(&self, source: &str) -> Option<ProgramHandle> {
        let mut state = self.state.lock();
        if Self::take_fault(&mut state, HostFault::Compile) {
            drop(state);
            self.report_compile("host: compilation rejected");
            return None;
        }
        if let Err(msg) = check_delimiters(source) {
            drop(state);
            self.report_compile(&msg);
            return None;
        }
        let id = state.next_program;
        state.next_program += 1;
        state.programs.insert(id, source.to_string());
        Some(ProgramHandle(id))
    }
}

fn byte_range(offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    Some(start..start.checked_add(len)?)
}

/// Minimal syntax check: `()`, `[]` and `{}` must nest properly.
fn check_delimiters(source: &str) -> Result<(), String> {
    let mut stack = Vec::new();
    for (line_no, line) in source.lines().enumerate() {
        for c in line.chars() {
            match c {
                '(' | '[' | '{' => stack.push(c),
                ')' | ']' | '}' => {
                    let open = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if stack.pop() != Some(open) {
                        return Err(format!("0:{}: unexpected '{}'", line_no + 1, c));
                    }
                }
                _ => {}
            }
        }
    }
    match stack.last() {
        Some(open) => Err(format!("unclosed '{}' at end of source", open)),
        None => Ok(()),
    }
}

impl NativeDriver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn initialize(&self, errors: Arc<ErrorRouter>) {
        *self.errors.write() = Some(errors);
    }

    fn release_resources(&self) {
        let mut state = self.state.lock();
        state.buffers.clear();
        state.programs.clear();
        state.contexts.clear();
        state.active.clear();
        state.released = true;
    }

    fn refresh_devices(&self) {
        self.state.lock().refreshes += 1;
    }

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }

    fn create_context(&self, device: DeviceHandle) -> bool {
        let mut state = self.state.lock();
        if Self::take_fault(&mut state, HostFault::CreateContext) {
            drop(state);
            self.report_internal("create_context", "host: context creation refused");
            return false;
        }
        if device.0 >= self.devices.len() {
            return false;
        }
        state.contexts.insert(device.0)
    }

    fn dispose_context(&self, device: DeviceHandle) {
        let mut state = self.state.lock();
        state.contexts.remove(&device.0);
        // Native memory goes with the context; facade entries become stale.
        state.buffers.retain(|_, b| b.device != device);
    }

    fn set_active_context(&self, device: DeviceHandle) {
        self.state.lock().active.insert(thread::current().id(), device);
    }

    fn allocate_buffer(
        &self,
        hint: StorageHint,
        id: BufferId,
        initial: Option<&[u8]>,
        byte_len: usize,
    ) -> Option<BufferHandle> {
        let mut state = self.state.lock();
        if Self::take_fault(&mut state, HostFault::Allocate) {
            return None;
        }
        let device = *state.active.get(&thread::current().id())?;
        if !state.contexts.contains(&device.0) {
            return None;
        }

        let bytes = match initial {
            Some(data) if data.len() == byte_len => data.to_vec(),
            Some(_) => return None,
            None => vec![0; byte_len],
        };

        let handle = state.next_buffer;
        state.next_buffer += 1;
        state.buffers.insert(handle, HostBuffer { bytes, device });
        state.allocations.push(HostAllocation {
            id,
            hint,
            byte_len,
            device,
        });
        Some(BufferHandle(handle))
    }

    fn free_buffer(&self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer.0);
    }

    fn read_buffer(&self, buffer: BufferHandle, byte_offset: u64, dst: &mut [u8]) -> bool {
        let mut state = self.state.lock();
        if Self::take_fault(&mut state, HostFault::Transfer) {
            return false;
        }
        let Some(buf) = state.buffers.get(&buffer.0) else {
            return false;
        };
        match byte_range(byte_offset, dst.len()).and_then(|r| buf.bytes.get(r)) {
            Some(src) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn write_buffer(&self, buffer: BufferHandle, byte_offset: u64, src: &[u8]) -> bool {
        let mut state = self.state.lock();
        if Self::take_fault(&mut state, HostFault::Transfer) {
            return false;
        }
        let Some(buf) = state.buffers.get_mut(&buffer.0) else {
            return false;
        };
        match byte_range(byte_offset, src.len()).and_then(|r| buf.bytes.get_mut(r)) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn compile_program(&self, source: &str) -> Option<ProgramHandle> {
        self.compile_text(source)
    }

    fn load_program(&self, bytes: &[u8]) -> Option<ProgramHandle> {
        let source = std::str::from_utf8(bytes).ok()?;
        self.compile_text(source)
    }

    fn save_program(&self, program: ProgramHandle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .programs
            .get(&program.0)
            .map(|src| src.clone().into_bytes())
    }

    fn run_program(
        &self,
        program: ProgramHandle,
        limits: DeviceLimits,
        process_count: u64,
    ) -> bool {
        let mut state = self.state.lock();
        if Self::take_fault(&mut state, HostFault::Run) {
            drop(state);
            self.report_run("host: dispatch rejected");
            return false;
        }
        if !state.programs.contains_key(&program.0) {
            drop(state);
            self.report_run("host: unknown program");
            return false;
        }
        let Some(workgroups) = limits.split(process_count) else {
            drop(state);
            self.report_run(&format!(
                "host: {} invocations exceed device limits {:?}",
                process_count, limits.0
            ));
            return false;
        };

        let device = state.active.get(&thread::current().id()).copied();
        state.runs.push(HostRun {
            program,
            device,
            process_count,
            workgroups,
        });
        true
    }
}
