use log::LevelFilter;

// Noisy HTTP internals; only warnings and errors are kept
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Install the process-wide logger. `RUST_LOG` overrides the defaults.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level());
    for target in QUIET_TARGETS {
        builder.filter_module(target, LevelFilter::Warn);
    }
    builder.parse_default_env().format_timestamp_millis();

    if builder.try_init().is_ok() {
        log::info!("Logging initialized (voxkey {})", env!("CARGO_PKG_VERSION"));
    }
}
