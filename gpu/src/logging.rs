//! Logging setup for cinder binaries and tests
//!
//! The library only logs through the `log` facade; binaries pick a backend
//! with one of the `init*` functions below.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cinder_gpu::logging;
//!
//! // Warn level
//! logging::init();
//!
//! // Or from RUST_LOG
//! logging::init_from_env();
//!
//! // Or a fixed level
//! logging::init_with_level(log::LevelFilter::Debug);
//! ```
//!
//! # Log Levels
//!
//! - `error!` - native misbehaviour the facade cannot recover from (a
//!   subscriber panicking inside a C callback, an overrun scratch buffer)
//! - `warn!` - native errors published on the error router, convention
//!   violations (lifecycle calls off the controlling thread)
//! - `info!` - device enumeration
//! - `debug!` - device, buffer and program lifecycle transitions
//! - `trace!` - buffer transfers
//!
//! # Environment Variable
//!
//! ```bash
//! RUST_LOG=cinder_gpu=debug cinder devices
//! RUST_LOG=cinder_gpu::context=trace cinder compile shader.comp
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize at Warn level. Only the first `init*` call takes effect.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize from `RUST_LOG`, falling back to Warn.
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Test-friendly logger; safe to call from every test.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

pub fn is_initialized() -> bool {
    INIT.is_completed()
}
