//! Subscriber setup shared by both binaries.

use tracing_subscriber::EnvFilter;

/// Installs a stderr subscriber filtered by `CELLAR_LOG`, then `RUST_LOG`,
/// defaulting to `info`.
///
/// Stage1 answers on stdout, so logs never go there.
pub fn init() {
    let filter = EnvFilter::try_from_env("CELLAR_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
