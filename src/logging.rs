//! # Logging
//!
//! This crate instruments itself with `tracing` throughout (transports,
//! search, monitors) but, being a library, never installs a global
//! subscriber itself — the embedding application owns that decision. This
//! module only provides a test-time helper so the crate's own unit tests get
//! readable output, the same role `tracing-subscriber` plays for the
//! teacher's benchmark CLI, scoped down to test scaffolding since CLI
//! concerns are out of this crate's scope. `tracing-subscriber` is only a
//! dev-dependency, so this helper is `#[cfg(test)]`-gated and can only be
//! called from this crate's own `#[cfg(test)]` modules, not from the
//! separate integration test binaries under `tests/`.
#[cfg(test)]
pub fn test_subscriber() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
