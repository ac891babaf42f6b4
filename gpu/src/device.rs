//! Device registry: enumeration and context lifecycle
//!
//! Devices come from the native device table. The registry owns their
//! lifecycle state; [`Device`] values handed to callers are plain handles
//! that can be cloned and sent across threads. Every refresh of the native
//! table starts a new generation, and handles from older generations are
//! rejected with [`GpuError::StaleDevice`].

use std::fmt;

use parking_lot::{ReentrantMutex, RwLock};

use crate::driver::{DeviceDescriptor, DeviceHandle, DeviceLimits, NativeDriver};
use crate::error::{GpuError, GpuResult};

/// Identity of a device within one enumeration generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub generation: u64,
    pub index: usize,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Initialized,
    Disposed,
}

/// A GPU device as reported by the native driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    id: DeviceId,
    name: String,
    monitor_name: String,
    limits: DeviceLimits,
    handle: DeviceHandle,
}

impl Device {
    fn from_descriptor(desc: DeviceDescriptor, generation: u64, index: usize) -> Self {
        Device {
            id: DeviceId { generation, index },
            name: desc.name,
            monitor_name: desc.monitor_name,
            limits: desc.limits,
            handle: desc.handle,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn monitor_name(&self) -> &str {
        &self.monitor_name
    }

    /// Maximum workgroup count per dispatch dimension.
    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    pub(crate) fn handle(&self) -> DeviceHandle {
        self.handle
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.monitor_name)
    }
}

#[derive(Default)]
struct RegistryState {
    generation: u64,
    enumerated: bool,
    devices: Vec<Device>,
    states: Vec<DeviceState>,
}

impl RegistryState {
    fn slot(&self, device: &Device) -> GpuResult<usize> {
        let id = device.id;
        if !self.enumerated || id.generation != self.generation || id.index >= self.states.len() {
            return Err(GpuError::StaleDevice(device.name.clone()));
        }
        Ok(id.index)
    }
}

/// Process-wide device table and per-device lifecycle state.
///
/// The state lock is never held across a driver call: native error callbacks
/// fire synchronously inside those calls and their subscribers may query the
/// registry. Transitions are serialized by a separate reentrant lock, and each
/// one re-validates its slot when it commits.
pub(crate) struct DeviceRegistry {
    state: RwLock<RegistryState>,
    transition: ReentrantMutex<()>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            state: RwLock::new(RegistryState::default()),
            transition: ReentrantMutex::new(()),
        }
    }

    /// Return the device table, re-scanning first when `refresh` is set and a
    /// previous enumeration exists.
    pub fn enumerate(&self, driver: &dyn NativeDriver, refresh: bool) -> Vec<Device> {
        {
            let state = self.state.read();
            if state.enumerated && !refresh {
                return state.devices.clone();
            }
        }

        let _transition = self.transition.lock();
        let rescan = {
            let state = self.state.read();
            if state.enumerated && !refresh {
                return state.devices.clone();
            }
            if state.enumerated {
                let live = state
                    .states
                    .iter()
                    .filter(|s| **s == DeviceState::Initialized)
                    .count();
                if live > 0 {
                    log::warn!(
                        "refreshing device list with {} device(s) still initialized; their handles become stale",
                        live
                    );
                }
            }
            state.enumerated
        };

        if rescan {
            driver.refresh_devices();
        }
        let descriptors = driver.enumerate_devices();

        let mut state = self.state.write();
        if state.enumerated {
            state.generation += 1;
        }
        let generation = state.generation;
        let devices: Vec<Device> = descriptors
            .into_iter()
            .enumerate()
            .map(|(index, desc)| Device::from_descriptor(desc, generation, index))
            .collect();

        log::info!(
            "enumerated {} device(s) via {} driver (generation {})",
            devices.len(),
            driver.name(),
            generation
        );
        for device in &devices {
            log::debug!("  [{}] {} limits={:?}", device.id.index, device, device.limits.0);
        }

        state.states = vec![DeviceState::Uninitialized; devices.len()];
        state.devices = devices;
        state.enumerated = true;
        state.devices.clone()
    }

    pub fn state(&self, device: &Device) -> GpuResult<DeviceState> {
        let state = self.state.read();
        let slot = state.slot(device)?;
        Ok(state.states[slot])
    }

    pub fn is_initialized(&self, device: &Device) -> bool {
        matches!(self.state(device), Ok(DeviceState::Initialized))
    }

    /// Create the native context for `device`. `Ok(false)` means the driver
    /// refused.
    pub fn initialize(&self, driver: &dyn NativeDriver, device: &Device) -> GpuResult<bool> {
        let _transition = self.transition.lock();
        match self.state(device)? {
            DeviceState::Initialized => {
                return Err(GpuError::AlreadyInitialized(device.name.clone()))
            }
            DeviceState::Disposed => return Err(GpuError::DeviceDisposed(device.name.clone())),
            DeviceState::Uninitialized => {}
        }

        let created = driver.create_context(device.handle);
        if !created {
            log::warn!("driver refused to create a context for {}", device);
            return Ok(false);
        }

        let mut state = self.state.write();
        let slot = match state.slot(device) {
            Ok(slot) => slot,
            Err(err) => {
                // A subscriber refreshed the table from inside the call.
                drop(state);
                driver.dispose_context(device.handle);
                return Err(err);
            }
        };
        if state.states[slot] != DeviceState::Uninitialized {
            return Err(GpuError::AlreadyInitialized(device.name.clone()));
        }
        state.states[slot] = DeviceState::Initialized;
        log::debug!("device {} initialized", device);
        Ok(true)
    }

    /// Release the native context of `device`. Buffers created on it are not
    /// touched; they go stale.
    pub fn dispose(&self, driver: &dyn NativeDriver, device: &Device) -> GpuResult<()> {
        let _transition = self.transition.lock();
        if self.state(device)? != DeviceState::Initialized {
            return Err(GpuError::NotInitialized(device.name.clone()));
        }

        driver.dispose_context(device.handle);

        let mut state = self.state.write();
        let slot = state.slot(device)?;
        if state.states[slot] != DeviceState::Initialized {
            return Err(GpuError::NotInitialized(device.name.clone()));
        }
        state.states[slot] = DeviceState::Disposed;
        log::debug!("device {} disposed", device);
        Ok(())
    }
}
