use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber for a binary.
///
/// `RUST_LOG` wins when set, otherwise `default_directive` (e.g. `"info"`
/// or `"vigil=debug"`) is used. Calling this twice is harmless, the second
/// install is ignored.
///
/// * `default_directive`: filter used when `RUST_LOG` is absent.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
