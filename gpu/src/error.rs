//! Error types for the compute facade.
//!
//! Every facade operation returns [`GpuResult`]. Precondition violations are
//! reported synchronously through [`GpuError`]; descriptive native failures
//! (shader compile errors, program run errors, context errors) travel
//! out-of-band through [`crate::events::ErrorRouter`].

use std::fmt;

/// Native primitive whose call reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    AllocateBuffer,
    ReadBuffer,
    WriteBuffer,
    CompileProgram,
    LoadProgram,
    SaveProgram,
}

impl NativeOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::AllocateBuffer => "allocate_buffer",
            Self::ReadBuffer => "read_buffer",
            Self::WriteBuffer => "write_buffer",
            Self::CompileProgram => "compile_program",
            Self::LoadProgram => "load_program",
            Self::SaveProgram => "save_program",
        }
    }
}

/// Errors returned by facade operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// The facade has been disposed; every operation is rejected.
    Disposed,

    /// `dispose()` was called on an already disposed facade.
    AlreadyDisposed,

    /// A required input was empty, malformed or out of range.
    InvalidArgument(String),

    /// The device already has a native context.
    AlreadyInitialized(String),

    /// The device has no native context.
    NotInitialized(String),

    /// The device was disposed and must be re-enumerated before reuse.
    DeviceDisposed(String),

    /// The device handle belongs to an enumeration that has been refreshed.
    StaleDevice(String),

    /// No buffer with that name exists on the calling thread.
    NotFound(String),

    /// A buffer with that name already exists on the calling thread.
    AlreadyExists(String),

    /// The calling thread has no active device.
    NoActiveDevice,

    /// The buffer's owning device was disposed after the buffer was created.
    StaleBuffer(String),

    /// A thread context for this facade is already live on the calling thread.
    ContextInUse,

    /// The native collaborator reported failure for a primitive.
    NativeFailure(NativeOp),

    /// The native collaborator could not be loaded or configured.
    Driver(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::Disposed => write!(f, "compute facade has been disposed"),
            GpuError::AlreadyDisposed => write!(f, "compute facade is already disposed"),
            GpuError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            GpuError::AlreadyInitialized(dev) => {
                write!(f, "device '{}' is already initialized", dev)
            }
            GpuError::NotInitialized(dev) => write!(f, "device '{}' is not initialized", dev),
            GpuError::DeviceDisposed(dev) => {
                write!(f, "device '{}' was disposed; re-enumerate to use it again", dev)
            }
            GpuError::StaleDevice(dev) => {
                write!(f, "device '{}' belongs to a previous enumeration", dev)
            }
            GpuError::NotFound(name) => write!(f, "buffer '{}' does not exist", name),
            GpuError::AlreadyExists(name) => write!(f, "buffer '{}' already exists", name),
            GpuError::NoActiveDevice => {
                write!(f, "the calling thread has no active device")
            }
            GpuError::StaleBuffer(name) => {
                write!(f, "buffer '{}' outlived the device it was created on", name)
            }
            GpuError::ContextInUse => {
                write!(f, "a thread context is already live on this thread")
            }
            GpuError::NativeFailure(op) => write!(f, "native {} failed", op.name()),
            GpuError::Driver(msg) => write!(f, "driver error: {}", msg),
        }
    }
}

impl std::error::Error for GpuError {}

/// Result type for facade operations.
pub type GpuResult<T> = Result<T, GpuError>;
