#![cfg(not(target_arch = "wasm32"))]

use std::backtrace::Backtrace;
use std::fs::File;
use std::io::Write;
use std::panic;
use std::path::Path;

use log::{error, info, LevelFilter};

use codex_engine::config::DEFAULT_CONFIG_FILE;
use codex_engine::{EngineConfig, SceneDescription};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    setup_diagnostics();

    let config = EngineConfig::load_or_default(Path::new(DEFAULT_CONFIG_FILE));
    info!("Starting Codex engine...");

    if let Err(e) = codex_engine::run(config, SceneDescription::lunar_demo()) {
        error!("Engine stopped: {e:#}");
        std::process::exit(1);
    }
    info!("Clean shutdown");
}

/// Logger plus a panic hook that writes `engine_crash.log`.
fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) { LevelFilter::Debug } else { LevelFilter::Warn })
        // wgpu is chatty at debug level
        .filter_module("wgpu_core", LevelFilter::Warn)
        .filter_module("wgpu_hal", LevelFilter::Warn)
        .filter_module("naga", LevelFilter::Warn)
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();

        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let location = panic_info
            .location()
            .map_or("unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));

        let crash_msg = format!("=== ENGINE CRASH ===\nReason: {msg}\nLocation: {location}\n\nStack Trace:\n{backtrace}");
        eprintln!("\x1b[31;1m{crash_msg}\x1b[0m");

        if let Ok(mut file) = File::create("engine_crash.log") {
            let _ = file.write_all(crash_msg.as_bytes());
            eprintln!("Crash report saved to engine_crash.log");
        }
    }));
}
