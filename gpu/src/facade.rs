//! Process-wide compute facade.
//!
//! [`Gpu`] owns the native driver, the error router and the device table.
//! Per-thread state lives in [`ThreadContext`], obtained with
//! [`Gpu::thread_context`]. Once [`Gpu::dispose`] has run, every operation
//! on the facade and on its contexts fails with [`GpuError::Disposed`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::config::{Backend, Config};
use crate::context::ThreadContext;
use crate::device::{Device, DeviceRegistry, DeviceState};
use crate::driver::dylib::DylibDriver;
use crate::driver::host::HostDriver;
use crate::driver::{DeviceLimits, NativeDriver};
use crate::error::{GpuError, GpuResult};
use crate::events::ErrorRouter;

static NEXT_FACADE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    Active,
    Disposed,
}

struct GpuInner {
    id: u64,
    driver: Arc<dyn NativeDriver>,
    errors: Arc<ErrorRouter>,
    devices: DeviceRegistry,
    disposed: AtomicBool,
    controlling_thread: ThreadId,
}

/// Handle to the compute facade. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Gpu {
    inner: Arc<GpuInner>,
}

impl std::fmt::Debug for Gpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu")
            .field("id", &self.inner.id)
            .field("driver", &self.inner.driver.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Gpu {
    /// Build a facade over `driver`. The calling thread becomes the
    /// controlling thread for device enumeration and lifecycle calls.
    pub fn new(driver: Arc<dyn NativeDriver>) -> Self {
        let errors = Arc::new(ErrorRouter::new());
        driver.initialize(Arc::clone(&errors));
        let id = NEXT_FACADE_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("compute facade #{} created over {} driver", id, driver.name());
        Gpu {
            inner: Arc::new(GpuInner {
                id,
                driver,
                errors,
                devices: DeviceRegistry::new(),
                disposed: AtomicBool::new(false),
                controlling_thread: thread::current().id(),
            }),
        }
    }

    /// Build the driver selected by `config`.
    pub fn from_config(config: &Config) -> GpuResult<Self> {
        let driver: Arc<dyn NativeDriver> = match config.driver.backend {
            Backend::Host => Arc::new(HostDriver::new(
                config.host.devices,
                DeviceLimits(config.host.max_dispatch),
            )),
            Backend::Dylib => {
                let library = config.driver.library.as_deref().ok_or_else(|| {
                    GpuError::Driver("dylib backend selected but no library configured".into())
                })?;
                Arc::new(DylibDriver::load(library, config.driver.max_program_bytes)?)
            }
            #[cfg(feature = "webgpu-backend")]
            Backend::Wgpu => Arc::new(crate::wgpu_backend::WgpuDriver::new()),
            #[cfg(not(feature = "webgpu-backend"))]
            Backend::Wgpu => {
                return Err(GpuError::Driver(
                    "wgpu backend selected but cinder-gpu was built without `webgpu-backend`"
                        .into(),
                ))
            }
        };
        Ok(Self::new(driver))
    }

    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    /// Subscription point for asynchronous native errors.
    pub fn errors(&self) -> &Arc<ErrorRouter> {
        &self.inner.errors
    }

    pub fn state(&self) -> FacadeState {
        if self.inner.disposed.load(Ordering::Acquire) {
            FacadeState::Disposed
        } else {
            FacadeState::Active
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == FacadeState::Disposed
    }

    /// List devices. With `refresh`, re-scan the native device table first
    /// (only once a previous enumeration exists); earlier handles go stale.
    pub fn devices(&self, refresh: bool) -> GpuResult<Vec<Device>> {
        self.check_active()?;
        self.warn_off_controlling_thread("devices");
        Ok(self.inner.devices.enumerate(self.driver(), refresh))
    }

    /// Create the native context for `device`. `Ok(false)` if the driver
    /// refused.
    pub fn initialize(&self, device: &Device) -> GpuResult<bool> {
        self.check_active()?;
        self.warn_off_controlling_thread("initialize");
        self.inner.devices.initialize(self.driver(), device)
    }

    /// Release the native context of `device`. Buffers created on it stay
    /// registered but every operation on them fails with
    /// [`GpuError::StaleBuffer`].
    pub fn dispose_device(&self, device: &Device) -> GpuResult<()> {
        self.check_active()?;
        self.warn_off_controlling_thread("dispose_device");
        self.inner.devices.dispose(self.driver(), device)
    }

    pub fn device_state(&self, device: &Device) -> GpuResult<DeviceState> {
        self.check_active()?;
        self.inner.devices.state(device)
    }

    pub fn is_initialized(&self, device: &Device) -> GpuResult<bool> {
        self.check_active()?;
        Ok(self.inner.devices.is_initialized(device))
    }

    /// Open this thread's context. Fails with [`GpuError::ContextInUse`] if
    /// one is already live on the calling thread.
    pub fn thread_context(&self) -> GpuResult<ThreadContext> {
        self.check_active()?;
        ThreadContext::open(self.clone())
    }

    /// Tear down the facade and release every native resource. One-shot.
    pub fn dispose(&self) -> GpuResult<()> {
        if self
            .inner
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GpuError::AlreadyDisposed);
        }
        self.inner.driver.release_resources();
        log::debug!("compute facade #{} disposed", self.inner.id);
        Ok(())
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn driver(&self) -> &dyn NativeDriver {
        self.inner.driver.as_ref()
    }

    pub(crate) fn registry(&self) -> &DeviceRegistry {
        &self.inner.devices
    }

    pub(crate) fn check_active(&self) -> GpuResult<()> {
        match self.state() {
            FacadeState::Active => Ok(()),
            FacadeState::Disposed => Err(GpuError::Disposed),
        }
    }

    fn warn_off_controlling_thread(&self, op: &str) {
        if thread::current().id() != self.inner.controlling_thread {
            log::warn!(
                "{} called off the controlling thread {:?}",
                op,
                self.inner.controlling_thread
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_gpu() -> (Gpu, Arc<HostDriver>) {
        let driver = Arc::new(HostDriver::default());
        (Gpu::new(driver.clone()), driver)
    }

    #[test]
    fn test_dispose_is_one_shot() {
        let (gpu, driver) = host_gpu();
        assert_eq!(gpu.state(), FacadeState::Active);
        gpu.dispose().unwrap();
        assert!(driver.is_released());
        assert_eq!(gpu.dispose(), Err(GpuError::AlreadyDisposed));
        assert_eq!(gpu.state(), FacadeState::Disposed);
    }

    #[test]
    fn test_disposed_gates_entry_points() {
        let (gpu, _) = host_gpu();
        let dev = gpu.devices(false).unwrap().remove(0);
        gpu.clone().dispose().unwrap();

        assert_eq!(gpu.devices(false), Err(GpuError::Disposed));
        assert_eq!(gpu.initialize(&dev), Err(GpuError::Disposed));
        assert_eq!(gpu.dispose_device(&dev), Err(GpuError::Disposed));
        assert_eq!(gpu.device_state(&dev), Err(GpuError::Disposed));
        assert!(matches!(gpu.thread_context(), Err(GpuError::Disposed)));
    }

    #[test]
    fn test_from_config_host() {
        let mut config = Config::default();
        config.host.devices = 3;
        let gpu = Gpu::from_config(&config).unwrap();
        assert_eq!(gpu.driver_name(), "host");
        assert_eq!(gpu.devices(false).unwrap().len(), 3);
    }

    #[test]
    fn test_from_config_dylib_needs_library() {
        let mut config = Config::default();
        config.driver.backend = Backend::Dylib;
        assert!(matches!(Gpu::from_config(&config), Err(GpuError::Driver(_))));
    }

    #[test]
    fn test_driver_receives_router() {
        let (gpu, driver) = host_gpu();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        gpu.errors().subscribe(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert!(driver.compile_program("void main() {").is_none());
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
