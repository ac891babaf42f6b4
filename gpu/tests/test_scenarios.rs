use std::sync::Arc;
use std::thread;

use bytemuck::{Pod, Zeroable};

use cinder_gpu::codegen::glsl::{JOB_INDEX_DECL, LAYOUT_DIRECTIVE, VERSION_DIRECTIVE};
use cinder_gpu::{BufferDesc, BufferType, DeviceLimits, Gpu, GpuError, HostDriver};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Particle {
    pos: [f32; 4],
    vel: [f32; 4],
}

const PARTICLE_DEF: &str = "struct Particle { vec4 pos; vec4 vel; };";

#[test]
fn test_single_float_buffer_scenario() {
    cinder_gpu::logging::init_test();
    let gpu = Gpu::new(Arc::new(HostDriver::default()));

    let devices = gpu.devices(false).unwrap();
    let d0 = &devices[0];
    assert!(gpu.initialize(d0).unwrap());

    let mut ctx = gpu.thread_context().unwrap();
    ctx.set_active(d0).unwrap();
    assert!(ctx.is_active(d0).unwrap());

    ctx.create_buffer(&BufferDesc::new("A", BufferType::Float, 4), &[0f32; 4])
        .unwrap();

    let src = ctx.assemble("result = A[0];", None).unwrap();
    let block = src
        .find("layout(std430, binding = 0) buffer CinderBuffer0 { float A[]; };")
        .expect("storage block for A");
    let job = src.find(JOB_INDEX_DECL).expect("job index declaration");
    let user = src.find("result = A[0];").expect("user source");
    assert!(block < job && job < user);
    assert!(src.starts_with(VERSION_DIRECTIVE));
    assert!(src.ends_with("result = A[0];"));
}

#[test]
fn test_assemble_is_deterministic() {
    let gpu = Gpu::new(Arc::new(HostDriver::default()));
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();
    let mut ctx = gpu.thread_context().unwrap();
    ctx.set_active(&dev).unwrap();

    for (i, name) in ["zeta", "alpha", "mid"].iter().enumerate() {
        ctx.create_buffer_zeroed::<u32>(&BufferDesc::new(*name, BufferType::Uint, i + 1))
            .unwrap();
    }

    let a = ctx.assemble("void main() {}", Some(PARTICLE_DEF)).unwrap();
    let b = ctx.assemble("void main() {}", Some(PARTICLE_DEF)).unwrap();
    assert_eq!(a, b);

    // Blocks follow binding order, not name order.
    let zeta = a.find("binding = 0) buffer CinderBuffer0 { uint zeta; }").unwrap();
    let alpha = a.find("binding = 1) buffer CinderBuffer1 { uint alpha[]; }").unwrap();
    let mid = a.find("binding = 2) buffer CinderBuffer2 { uint mid[]; }").unwrap();
    assert!(zeta < alpha && alpha < mid);

    let expected_head = format!("{}{}{}\n", VERSION_DIRECTIVE, LAYOUT_DIRECTIVE, PARTICLE_DEF);
    assert!(a.starts_with(&expected_head));
}

#[test]
fn test_custom_type_suffix_rules() {
    let gpu = Gpu::new(Arc::new(HostDriver::default()));
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();
    let mut ctx = gpu.thread_context().unwrap();
    ctx.set_active(&dev).unwrap();

    let particles = [Particle::zeroed(); 3];
    ctx.create_buffer(&BufferDesc::custom("one", "Particle", 1), &particles)
        .unwrap();
    ctx.create_buffer(&BufferDesc::custom("many", "Particle", 2), &particles)
        .unwrap();
    ctx.create_buffer(
        &BufferDesc::custom("set", "Particle", 1).collection(true),
        &particles,
    )
    .unwrap();

    let src = ctx.assemble("void main() {}", Some(PARTICLE_DEF)).unwrap();
    assert!(src.contains("{ Particle one; }"));
    assert!(src.contains("{ Particle many[]; }"));
    assert!(src.contains("{ Particle set[]; }"));

    assert_eq!(ctx.info("many").unwrap().byte_len, 2 * std::mem::size_of::<Particle>());
    assert_eq!(ctx.info("set").unwrap().element.to_string(), "Particle[]");
}

#[test]
fn test_struct_buffer_round_trip() {
    let gpu = Gpu::new(Arc::new(HostDriver::default()));
    let dev = gpu.devices(false).unwrap().remove(0);
    gpu.initialize(&dev).unwrap();
    let mut ctx = gpu.thread_context().unwrap();
    ctx.set_active(&dev).unwrap();

    let p = Particle {
        pos: [1.0, 2.0, 3.0, 1.0],
        vel: [0.5, 0.0, -0.5, 0.0],
    };
    ctx.create_buffer_zeroed::<Particle>(&BufferDesc::custom("ps", "Particle", 4))
        .unwrap();
    let stride = std::mem::size_of::<Particle>() as u64;
    ctx.write("ps", 2 * stride, &[p]).unwrap();

    let mut out = [Particle::zeroed(); 4];
    ctx.read("ps", 0, &mut out).unwrap();
    assert_eq!(out[2], p);
    assert_eq!(out[0], Particle::zeroed());
}

#[test]
fn test_threads_have_independent_state() {
    let driver = Arc::new(HostDriver::new(2, DeviceLimits::uniform(1024)));
    let gpu = Gpu::new(driver.clone());
    let devices = gpu.devices(false).unwrap();
    for dev in &devices {
        assert!(gpu.initialize(dev).unwrap());
    }

    let handles: Vec<_> = devices
        .into_iter()
        .map(|dev| {
            let gpu = gpu.clone();
            thread::spawn(move || {
                let mut ctx = gpu.thread_context().unwrap();
                ctx.set_active(&dev).unwrap();
                let info = ctx
                    .create_buffer(&BufferDesc::new("A", BufferType::Int, 2), &[1i32, 2])
                    .unwrap();
                let program = ctx.compile("void main() { A[JobIndex] += 1; }", None).unwrap();
                assert!(ctx.run(&program, 2).unwrap());
                (info.id, dev.id(), ctx.names().unwrap())
            })
        })
        .collect();

    for handle in handles {
        let (id, _device, names) = handle.join().unwrap();
        // Each thread starts its own ID counter and sees only its own buffers.
        assert_eq!(id, 0);
        assert_eq!(names, vec!["A".to_string()]);
    }

    let allocations = driver.allocations();
    assert_eq!(allocations.len(), 2);
    assert_ne!(allocations[0].device, allocations[1].device);
    let mut run_devices: Vec<_> = driver.runs().iter().map(|r| r.device).collect();
    run_devices.sort_by_key(|d| d.map(|h| h.0));
    run_devices.dedup();
    assert_eq!(run_devices.len(), 2);

    // Contexts were dropped with their threads.
    assert_eq!(driver.live_buffer_count(), 0);
}

#[test]
fn test_one_context_per_thread() {
    let gpu = Gpu::new(Arc::new(HostDriver::default()));
    let first = gpu.thread_context().unwrap();
    assert!(matches!(gpu.thread_context(), Err(GpuError::ContextInUse)));

    // Another facade is independent.
    let other = Gpu::new(Arc::new(HostDriver::default()));
    let _other_ctx = other.thread_context().unwrap();

    // Another thread is independent.
    let remote = gpu.clone();
    thread::spawn(move || assert!(remote.thread_context().is_ok()))
        .join()
        .unwrap();

    drop(first);
    assert!(gpu.thread_context().is_ok());
}
