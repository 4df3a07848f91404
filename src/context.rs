//! # Context
//!
//! Top-level composition root (spec.md §4.7/§6): owns the UDP search
//! engine, the channel/transport registry, the I/O mux, and the
//! notification factory, all built from one `Config`. This is the
//! scoped resource applications acquire and release; mirrors the
//! teacher's top-level `BenchmarkRunner`/`TransportFactory` composition
//! in spirit (one object wiring the moving parts together from a single
//! config), generalized to a long-lived client runtime instead of a
//! one-shot benchmark run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::codec::ValueKind;
use crate::config::Config;
use crate::error::CaResult;
use crate::iomux::IoMux;
use crate::monitor::NotifierFactory;
use crate::registry::{Channel, ChannelRegistry};
use crate::search::SearchEngine;

/// Grace period `Context::close` waits for transports/notification
/// services to wind down before forcing termination (spec.md §5).
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The process-wide (or application-scoped) CA client runtime. Acquiring
/// one binds a UDP search socket immediately; release with `close()`
/// (spec.md §6: "Context is a scoped resource; acquiring it requires
/// explicit release").
pub struct Context {
    config: Config,
    registry: Arc<ChannelRegistry>,
    notifier: Arc<NotifierFactory>,
    closed: std::sync::atomic::AtomicBool,
}

impl Context {
    /// Build a `Context` from an already-parsed `Config`. Fails fast
    /// (nothing is started) if the search socket cannot be bound
    /// (spec.md §7: "Configuration error ... Context construction fails").
    pub fn new(config: Config) -> CaResult<Self> {
        let io_mux = Arc::new(IoMux::new());
        let notifier = Arc::new(NotifierFactory::new(config.notifier));
        let (search_tx, search_rx) = mpsc::unbounded_channel();
        let search = SearchEngine::start(&config, search_tx)?;
        let registry = ChannelRegistry::new(config.clone(), io_mux, search, notifier.clone());
        registry.spawn_search_consumer(search_rx);
        Ok(Self {
            config,
            registry,
            notifier,
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Build a `Context` from the `EPICS_CA_*` process environment
    /// (spec.md §6).
    pub fn from_env() -> CaResult<Self> {
        Self::new(Config::from_env()?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a channel named `name` whose value is typed `kind`, at the
    /// default (lowest) priority.
    pub fn create_channel(&self, name: impl Into<String>, kind: ValueKind) -> Arc<Channel> {
        self.registry.create_channel(name, kind)
    }

    /// Create a channel at an explicit priority (0-99; spec.md's
    /// `[SUPPLEMENT]` priority field), used to key its Transport
    /// separately from lower/higher priority channels to the same server.
    pub fn create_channel_priority(
        &self,
        name: impl Into<String>,
        kind: ValueKind,
        priority: u8,
    ) -> Arc<Channel> {
        self.registry.create_channel_priority(name, kind, priority)
    }

    /// The Context-wide count of notification services created so far
    /// (spec.md §4.6, §8: "count after adding K monitors on M channels ==
    /// K").
    pub fn monitor_service_count(&self) -> usize {
        self.notifier.service_count()
    }

    /// Closes every channel, tears down every transport, disposes every
    /// notification service, and resets the service count to zero
    /// (spec.md §4.6, §4.4). Idempotent.
    pub async fn close(&self) {
        if self
            .closed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let registry = self.registry.clone();
        let shutdown = tokio::task::spawn_blocking(move || registry.close());
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await;
    }
}

impl Drop for Context {
    /// Release is guaranteed on every exit path, not just an awaited
    /// `close()` (spec.md §6). A dropped `Context` that was never closed
    /// still tears down every transport and notification service; it just
    /// can't wait out `SHUTDOWN_GRACE` from a non-async `drop`.
    fn drop(&mut self) {
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let registry = self.registry.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || registry.close());
            }
            Err(_) => registry.close(),
        }
    }
}
