use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use cinder_gpu::driver::host::HostFault;
use cinder_gpu::{
    BufferDesc, BufferType, DeviceLimits, DeviceState, ErrorKind, FacadeState, Gpu, GpuError,
    HostDriver, NativeOp,
};

fn host(devices: usize) -> (Gpu, Arc<HostDriver>) {
    cinder_gpu::logging::init_test();
    let driver = Arc::new(HostDriver::new(devices, DeviceLimits::uniform(65535)));
    (Gpu::new(driver.clone()), driver)
}

#[test]
fn test_dispose_gates_every_operation() {
    let (gpu, _driver) = host(1);
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();
    let mut ctx = gpu.thread_context().unwrap();
    ctx.set_active(&dev).unwrap();
    ctx.create_buffer(&BufferDesc::new("A", BufferType::Float, 1), &[1f32])
        .unwrap();
    let program = ctx.compile("void main() {}", None).unwrap();

    gpu.dispose().unwrap();
    assert_eq!(gpu.state(), FacadeState::Disposed);

    let mut out = [0f32];
    assert_eq!(gpu.devices(true), Err(GpuError::Disposed));
    assert_eq!(gpu.initialize(&dev), Err(GpuError::Disposed));
    assert_eq!(gpu.dispose_device(&dev), Err(GpuError::Disposed));
    assert_eq!(ctx.set_active(&dev), Err(GpuError::Disposed));
    assert_eq!(ctx.is_active(&dev), Err(GpuError::Disposed));
    assert_eq!(ctx.active_device(), Err(GpuError::Disposed));
    assert_eq!(ctx.exists("A"), Err(GpuError::Disposed));
    assert_eq!(ctx.info("A"), Err(GpuError::Disposed));
    assert_eq!(ctx.names(), Err(GpuError::Disposed));
    assert_eq!(ctx.read("A", 0, &mut out), Err(GpuError::Disposed));
    assert_eq!(ctx.write("A", 0, &out), Err(GpuError::Disposed));
    assert_eq!(ctx.remove_buffer("A"), Err(GpuError::Disposed));
    assert_eq!(ctx.assemble("", None), Err(GpuError::Disposed));
    assert_eq!(ctx.compile("void main() {}", None), Err(GpuError::Disposed));
    assert_eq!(ctx.compile_raw("void main() {}"), Err(GpuError::Disposed));
    assert_eq!(ctx.save(&program), Err(GpuError::Disposed));
    assert_eq!(ctx.load(b"void main() {}"), Err(GpuError::Disposed));
    assert_eq!(ctx.run(&program, 1), Err(GpuError::Disposed));
    assert_eq!(gpu.dispose(), Err(GpuError::AlreadyDisposed));
}

#[test]
fn test_run_rejects_non_positive_counts() {
    let (gpu, driver) = host(1);
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();
    let mut ctx = gpu.thread_context().unwrap();
    ctx.set_active(&dev).unwrap();
    let program = ctx.compile("void main() {}", None).unwrap();

    assert!(matches!(ctx.run(&program, 0), Err(GpuError::InvalidArgument(_))));
    assert!(matches!(ctx.run(&program, -5), Err(GpuError::InvalidArgument(_))));
    assert!(driver.runs().is_empty());

    assert_eq!(ctx.run(&program, 16), Ok(true));
    let runs = driver.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].process_count, 16);
    assert_eq!(runs[0].workgroups, [1, 1, 16]);
}

#[test]
fn test_run_without_active_device() {
    let (gpu, _driver) = host(1);
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();

    // Compile on a thread that has the device bound.
    let remote = gpu.clone();
    let program = thread::spawn(move || {
        let mut ctx = remote.thread_context().unwrap();
        ctx.set_active(&dev).unwrap();
        ctx.compile_raw("void main() {}").unwrap()
    })
    .join()
    .unwrap();

    let ctx = gpu.thread_context().unwrap();

    for count in [1, 0, -5, 1_000_000] {
        let result = ctx.run(&program, count);
        if count <= 0 {
            assert!(matches!(result, Err(GpuError::InvalidArgument(_))));
        } else {
            assert_eq!(result, Err(GpuError::NoActiveDevice));
        }
    }
    assert_eq!(ctx.save(&program), Err(GpuError::NoActiveDevice));
    assert_eq!(ctx.load(b"void main() {}"), Err(GpuError::NoActiveDevice));
}

#[test]
fn test_compile_requires_active_device() {
    let (gpu, driver) = host(1);
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();
    let mut ctx = gpu.thread_context().unwrap();

    assert_eq!(ctx.compile_raw("void main() {}"), Err(GpuError::NoActiveDevice));
    assert_eq!(ctx.compile("void main() {}", None), Err(GpuError::NoActiveDevice));

    ctx.set_active(&dev).unwrap();
    let program = ctx.compile("void main() {}", None).unwrap();
    assert!(driver.program_source(program.handle()).is_some());

    gpu.dispose_device(&dev).unwrap();
    assert!(matches!(
        ctx.compile_raw("void main() {}"),
        Err(GpuError::NotInitialized(_))
    ));
}

#[test]
fn test_run_after_device_disposal() {
    let (gpu, _driver) = host(1);
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();
    let mut ctx = gpu.thread_context().unwrap();
    ctx.set_active(&dev).unwrap();
    let program = ctx.compile("void main() {}", None).unwrap();

    gpu.dispose_device(&dev).unwrap();
    assert!(matches!(ctx.run(&program, 4), Err(GpuError::NotInitialized(_))));
    assert_eq!(gpu.device_state(&dev), Ok(DeviceState::Disposed));
    assert!(matches!(gpu.initialize(&dev), Err(GpuError::DeviceDisposed(_))));
}

#[test]
fn test_set_active_requires_initialized_device() {
    let (gpu, _driver) = host(2);
    let devices = gpu.devices(false).unwrap();
    let mut ctx = gpu.thread_context().unwrap();

    assert!(matches!(
        ctx.set_active(&devices[0]),
        Err(GpuError::NotInitialized(_))
    ));

    gpu.initialize(&devices[0]).unwrap();
    gpu.initialize(&devices[1]).unwrap();
    ctx.set_active(&devices[0]).unwrap();
    assert!(ctx.is_active(&devices[0]).unwrap());

    // Rebinding replaces the previous device.
    ctx.set_active(&devices[1]).unwrap();
    assert!(!ctx.is_active(&devices[0]).unwrap());
    assert_eq!(ctx.active_device().unwrap(), Some(&devices[1]));
}

#[test]
fn test_refresh_makes_old_handles_stale() {
    let (gpu, driver) = host(1);
    let old = gpu.devices(false).unwrap().remove(0);
    let fresh = gpu.devices(true).unwrap().remove(0);
    assert_eq!(driver.refresh_count(), 1);
    assert_ne!(old.id(), fresh.id());

    assert!(matches!(gpu.initialize(&old), Err(GpuError::StaleDevice(_))));
    assert!(gpu.initialize(&fresh).unwrap());
}

#[test]
fn test_refused_context_is_reported_not_raised() {
    let (gpu, driver) = host(1);
    let dev = gpu.devices(false).unwrap().remove(0);
    driver.fail_next(HostFault::CreateContext);
    assert_eq!(gpu.initialize(&dev), Ok(false));
    assert_eq!(gpu.device_state(&dev), Ok(DeviceState::Uninitialized));
    assert_eq!(gpu.initialize(&dev), Ok(true));
    assert!(matches!(
        gpu.initialize(&dev),
        Err(GpuError::AlreadyInitialized(_))
    ));
}

#[test]
fn test_native_errors_reach_subscribers() {
    let (gpu, driver) = host(1);
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();
    let mut ctx = gpu.thread_context().unwrap();
    ctx.set_active(&dev).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = gpu.errors().subscribe(move |e| sink.lock().push(e.kind));

    assert_eq!(
        ctx.compile("void main() {", None),
        Err(GpuError::NativeFailure(NativeOp::CompileProgram))
    );

    let program = ctx.compile("void main() {}", None).unwrap();
    driver.fail_next(HostFault::Run);
    assert_eq!(ctx.run(&program, 8), Ok(false));

    assert_eq!(
        *seen.lock(),
        vec![ErrorKind::ShaderCompile, ErrorKind::ProgramRun]
    );

    assert!(gpu.errors().unsubscribe(sub));
    driver.fail_next(HostFault::Run);
    assert_eq!(ctx.run(&program, 8), Ok(false));
    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn test_save_and_load_round_trip_program_bytes() {
    let (gpu, driver) = host(1);
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();
    let mut ctx = gpu.thread_context().unwrap();
    ctx.set_active(&dev).unwrap();

    let program = ctx.compile("void main() {}", None).unwrap();
    let bytes = ctx.save(&program).unwrap();
    assert_eq!(bytes, ctx.assemble("void main() {}", None).unwrap().into_bytes());

    let loaded = ctx.load(&bytes).unwrap();
    assert_ne!(loaded, program);
    assert_eq!(driver.program_source(loaded.handle()), driver.program_source(program.handle()));
    assert_eq!(ctx.run(&loaded, 3), Ok(true));

    assert_eq!(
        ctx.load(&[0xff, 0xfe]),
        Err(GpuError::NativeFailure(NativeOp::LoadProgram))
    );
}

#[test]
fn test_subscriber_can_query_facade_during_native_callback() {
    let (gpu, driver) = host(1);
    let dev = gpu.devices(false).unwrap().remove(0);

    // Host context faults are published from inside `create_context`.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer = gpu.clone();
    let watched = dev.clone();
    gpu.errors().subscribe(move |e| {
        let state = observer.device_state(&watched);
        let listed = observer.devices(false).map(|d| d.len());
        let initialized = observer.is_initialized(&watched);
        sink.lock().push((e.kind, state, listed, initialized));
    });

    driver.fail_next(HostFault::CreateContext);
    let (tx, rx) = mpsc::channel();
    let worker = gpu.clone();
    let target = dev.clone();
    thread::spawn(move || {
        let _ = tx.send(worker.initialize(&target));
    });
    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("initialize returned while a subscriber queried the facade");
    assert_eq!(result, Ok(false));

    assert_eq!(
        *seen.lock(),
        vec![(
            ErrorKind::Internal,
            Ok(DeviceState::Uninitialized),
            Ok(1),
            Ok(false)
        )]
    );
    assert!(gpu.initialize(&dev).unwrap());
}
