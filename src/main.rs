//! Cinder - command-line tool for the cinder GPU compute façade
//!
//! # Usage
//!
//! ```bash
//! # List the devices the configured driver reports
//! cinder devices
//!
//! # Print a shader with the preamble for a set of buffers
//! cinder assemble saxpy.comp --buffers buffers.toml
//!
//! # Compile against the first device and save the program bytes
//! cinder --config cinder.toml compile saxpy.comp --buffers buffers.toml --out saxpy.bin
//!
//! # Same pipeline on the in-memory driver
//! cinder --dry-run compile saxpy.comp --buffers buffers.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use cinder_gpu::{logging, BufferManifest, Config, Gpu, HostDriver, ThreadContext};

const DEFAULT_CONFIG: &str = "cinder.toml";

#[derive(Parser)]
#[command(name = "cinder")]
#[command(version = "0.1.0")]
#[command(about = "Cinder - managed GPU compute tool", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./cinder.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use the in-memory host driver regardless of configuration
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices with their dispatch limits
    Devices {
        /// Re-scan the native device table
        #[arg(long)]
        refresh: bool,
    },

    /// Print the assembled shader source
    Assemble {
        /// GLSL compute shader body
        shader: PathBuf,

        /// TOML manifest of [[buffer]] tables
        #[arg(long)]
        buffers: Option<PathBuf>,

        /// File with custom struct definitions
        #[arg(long)]
        types: Option<PathBuf>,
    },

    /// Assemble and compile a shader on a device
    Compile {
        /// GLSL compute shader body
        shader: PathBuf,

        /// TOML manifest of [[buffer]] tables
        #[arg(long)]
        buffers: Option<PathBuf>,

        /// File with custom struct definitions
        #[arg(long)]
        types: Option<PathBuf>,

        /// Write the compiled program bytes here
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Device index from `cinder devices`
        #[arg(long, default_value = "0")]
        device: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => logging::init_from_env(),
        1 => logging::init_with_level(log::LevelFilter::Info),
        2 => logging::init_with_level(log::LevelFilter::Debug),
        _ => logging::init_with_level(log::LevelFilter::Trace),
    }

    let result = match cli.command {
        Commands::Devices { refresh } => {
            open_gpu(cli.config.as_deref(), cli.dry_run).and_then(|gpu| list_devices(&gpu, refresh))
        }
        Commands::Assemble { shader, buffers, types } => {
            assemble_shader(&shader, buffers.as_deref(), types.as_deref())
        }
        Commands::Compile { shader, buffers, types, out, device } => {
            open_gpu(cli.config.as_deref(), cli.dry_run).and_then(|gpu| {
                compile_shader(&gpu, &shader, buffers.as_deref(), types.as_deref(), out.as_deref(), device)
            })
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path).map_err(|e| e.to_string()),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Config::load(Path::new(DEFAULT_CONFIG)).map_err(|e| e.to_string())
        }
        None => Ok(Config::default()),
    }
}

fn open_gpu(config: Option<&Path>, dry_run: bool) -> Result<Gpu, String> {
    let gpu = if dry_run {
        Gpu::new(Arc::new(HostDriver::default()))
    } else {
        let config = load_config(config)?;
        Gpu::from_config(&config).map_err(|e| e.to_string())?
    };
    // Native diagnostics only arrive through the router.
    gpu.errors().subscribe(|e| eprintln!("{}", e));
    Ok(gpu)
}

fn read_text(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))
}

fn list_devices(gpu: &Gpu, refresh: bool) -> Result<(), String> {
    let mut devices = gpu.devices(false).map_err(|e| e.to_string())?;
    if refresh {
        devices = gpu.devices(true).map_err(|e| e.to_string())?;
    }

    println!("Driver: {}", gpu.driver_name());
    if devices.is_empty() {
        println!("  (no devices)");
    }
    for (i, device) in devices.iter().enumerate() {
        let [x, y, z] = device.limits().0;
        println!(
            "  [{}] {} on {}  max dispatch {} x {} x {}",
            i,
            device.name(),
            device.monitor_name(),
            x,
            y,
            z
        );
    }
    Ok(())
}

/// Declare every manifest buffer on `ctx`, zero-filled.
fn declare_buffers(ctx: &mut ThreadContext, manifest: Option<&Path>) -> Result<(), String> {
    let Some(path) = manifest else {
        return Ok(());
    };
    let manifest = BufferManifest::load(path).map_err(|e| e.to_string())?;
    for spec in &manifest.buffers {
        let size = spec.element_size().map_err(|e| e.to_string())?;
        ctx.create_buffer_raw(&spec.to_desc(), size, None)
            .map_err(|e| format!("buffer '{}': {}", spec.name, e))?;
    }
    Ok(())
}

/// Initialize device `index` and bind it to a fresh thread context.
fn bind_device(gpu: &Gpu, index: usize) -> Result<ThreadContext, String> {
    let devices = gpu.devices(false).map_err(|e| e.to_string())?;
    let device = devices
        .get(index)
        .ok_or_else(|| format!("no device {} ({} available)", index, devices.len()))?;
    if !gpu.initialize(device).map_err(|e| e.to_string())? {
        return Err(format!("driver could not create a context on {}", device));
    }
    let mut ctx = gpu.thread_context().map_err(|e| e.to_string())?;
    ctx.set_active(device).map_err(|e| e.to_string())?;
    Ok(ctx)
}

fn assemble_shader(shader: &Path, buffers: Option<&Path>, types: Option<&Path>) -> Result<(), String> {
    let source = read_text(shader)?;
    let custom_types = types.map(read_text).transpose()?;

    let gpu = Gpu::new(Arc::new(HostDriver::default()));
    let mut ctx = bind_device(&gpu, 0)?;
    declare_buffers(&mut ctx, buffers)?;

    let assembled = ctx
        .assemble(&source, custom_types.as_deref())
        .map_err(|e| e.to_string())?;
    print!("{}", assembled);
    Ok(())
}

fn compile_shader(
    gpu: &Gpu,
    shader: &Path,
    buffers: Option<&Path>,
    types: Option<&Path>,
    out: Option<&Path>,
    device: usize,
) -> Result<(), String> {
    let source = read_text(shader)?;
    let custom_types = types.map(read_text).transpose()?;

    let mut ctx = bind_device(gpu, device)?;
    declare_buffers(&mut ctx, buffers)?;

    let program = ctx
        .compile(&source, custom_types.as_deref())
        .map_err(|e| format!("{} did not compile: {}", shader.display(), e))?;
    println!("Compiled {} on {}", shader.display(), gpu.driver_name());

    if let Some(out) = out {
        let bytes = ctx.save(&program).map_err(|e| e.to_string())?;
        std::fs::write(out, &bytes)
            .map_err(|e| format!("cannot write {}: {}", out.display(), e))?;
        println!("Wrote {} bytes to {}", bytes.len(), out.display());
    }
    Ok(())
}
