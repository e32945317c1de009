// src/logging.rs — structured logging setup
//
// `tracing`/`tracing-subscriber` are in the dependency table but unused
// in the module this crate started from; this is the first thing that
// actually wires them up, driven by `RUST_LOG`/the config file's
// `log_filter`.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber once. Safe to call more than once —
/// subsequent calls are no-ops (tests that exercise several modules in one
/// binary would otherwise panic on the second `set_global_default`).
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
