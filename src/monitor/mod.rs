//! # Monitor Notification Subsystem
//!
//! Four interchangeable notification strategies for delivering value
//! updates from network threads to user consumers (spec.md §4.6). Each
//! `Context` owns one `NotifierFactory`, selected by the
//! `CA_MONITOR_NOTIFIER_IMPL` configuration string, which mints one
//! `NotificationService` per (channel, consumer) pair when a monitor is
//! added.
//!
//! This mirrors the teacher's `TransportFactory` (`ipc/mod.rs`): there, a
//! single factory method switched on a mechanism enum to build one of four
//! pluggable `IpcTransport` implementations. Here the switch is on a
//! `NotifierStrategy` to build one of four pluggable
//! `NotificationService` implementations — same shape, different axis of
//! variation.

mod bounded_latest;
mod multi_worker;
mod striped;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::Bundle;
use crate::error::Status;

pub use bounded_latest::BoundedRingService;
pub use multi_worker::MultiWorkerService;
pub use striped::{LanePool, StripedService};

/// Bitmask selecting which server-side event classes a monitor subscribes
/// to. All-zero is rejected by `Monitor`'s constructor (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(pub u8);

impl EventMask {
    pub const VALUE: EventMask = EventMask(1 << 0);
    pub const LOG: EventMask = EventMask(1 << 1);
    pub const ALARM: EventMask = EventMask(1 << 2);
    pub const PROPERTY: EventMask = EventMask(1 << 3);

    pub fn combine(masks: &[EventMask]) -> EventMask {
        EventMask(masks.iter().fold(0, |acc, m| acc | m.0))
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Receives values (or the connection-loss sentinel, `None`) from a
/// `NotificationService`. Implementing this is the application's job; the
/// core only guarantees delivery semantics, not what the consumer does
/// with them (spec.md §1).
pub trait Consumer: Send + Sync {
    fn accept(&self, value: Option<Bundle>);
}

/// Quality-of-service characteristics of a `NotificationService` instance,
/// reportable per spec.md §4.6 ("threads per consumer, null-publishable,
/// buffered/unbuffered, buffer size").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosReport {
    pub threads_per_consumer: usize,
    pub null_publishable: bool,
    pub buffered: bool,
    pub buffer_size: Option<usize>,
}

/// A pluggable monitor notification strategy. One instance is created per
/// (channel, consumer) pair.
pub trait NotificationService: Send + Sync {
    /// Deliver a value (`Some`) or the connection-loss sentinel (`None`).
    /// Must not block the calling (transport receive) thread. Returns
    /// `true` if accepted, `false` if dropped (strategy-dependent).
    fn publish(&self, value: Option<Bundle>) -> bool;

    fn start(&self);

    fn dispose(&self);

    fn qos(&self) -> QosReport;
}

/// The four selectable strategies, named after spec.md §4.6's own
/// vocabulary (the two parenthetical "disruptor-*" names are kept as the
/// configuration-string tokens since they're how operators already know
/// them).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierStrategy {
    /// Ring buffer of 2 slots, overrun consolidation ("disruptor-old").
    BoundedLatest,
    /// Ring buffer of 1 slot, always-latest ("disruptor-new").
    LatestOnly,
    /// Shared worker pool, bounded-or-unbounded FIFO queue per consumer,
    /// drop-oldest backpressure.
    MultiWorker,
    /// Shared pool, consumer-keyed stripes, sequential per consumer,
    /// parallel across consumers.
    Striped,
}

/// A parsed `CA_MONITOR_NOTIFIER_IMPL` configuration string:
/// `STRATEGY[,threads[,bufferSize]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierSpec {
    pub strategy: NotifierStrategy,
    pub threads: usize,
    pub buffer_size: Option<usize>,
}

impl Default for NotifierSpec {
    fn default() -> Self {
        Self {
            strategy: NotifierStrategy::MultiWorker,
            threads: 16,
            buffer_size: None,
        }
    }
}

impl NotifierSpec {
    pub fn parse(raw: &str) -> Result<Self, Status> {
        let mut parts = raw.split(',').map(str::trim);
        let strategy = match parts.next().unwrap_or("") {
            "disruptor-old" | "bounded-latest" => NotifierStrategy::BoundedLatest,
            "disruptor-new" | "latest-only" => NotifierStrategy::LatestOnly,
            "multi-worker" => NotifierStrategy::MultiWorker,
            "striped" => NotifierStrategy::Striped,
            other => {
                return Err(Status::ConfigError(format!(
                    "unknown CA_MONITOR_NOTIFIER_IMPL strategy: {other}"
                )))
            }
        };
        let threads = match parts.next() {
            Some(s) if !s.is_empty() => s.parse().map_err(|_| {
                Status::ConfigError(format!("CA_MONITOR_NOTIFIER_IMPL: bad thread count: {s}"))
            })?,
            _ => 10,
        };
        let buffer_size = match parts.next() {
            Some(s) if !s.is_empty() => Some(s.parse().map_err(|_| {
                Status::ConfigError(format!("CA_MONITOR_NOTIFIER_IMPL: bad buffer size: {s}"))
            })?),
            _ => None,
        };
        Ok(Self {
            strategy,
            threads,
            buffer_size,
        })
    }
}

/// Factory producing `NotificationService` instances per (channel,
/// consumer) pair, and the Context-scoped service counter from spec.md
/// §4.6's lifecycle invariants ("creating a monitor increments the
/// Context-wide service count by 1 ... closing a Monitor does NOT
/// decrement ... closing the Context disposes all services and resets the
/// count to 0").
pub struct NotifierFactory {
    spec: NotifierSpec,
    shared_pool: Arc<rayon::ThreadPool>,
    lane_pool: Arc<LanePool>,
    service_count: AtomicUsize,
    services: Mutex<Vec<Arc<dyn NotificationService>>>,
}

impl NotifierFactory {
    pub fn new(spec: NotifierSpec) -> Self {
        let shared_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(spec.threads.max(1))
                .thread_name(|i| format!("ca-notify-{i}"))
                .build()
                .expect("failed to build notification worker pool"),
        );
        let lane_pool = Arc::new(LanePool::new(spec.threads.max(1)));
        Self {
            spec,
            shared_pool,
            lane_pool,
            service_count: AtomicUsize::new(0),
            services: Mutex::new(Vec::new()),
        }
    }

    /// Create a new notification service for a (channel, consumer) pair,
    /// incrementing the Context-wide service count.
    pub fn create(&self, consumer: Arc<dyn Consumer>) -> Arc<dyn NotificationService> {
        let service: Arc<dyn NotificationService> = match self.spec.strategy {
            NotifierStrategy::BoundedLatest => {
                Arc::new(BoundedRingService::new(consumer, 2))
            }
            NotifierStrategy::LatestOnly => Arc::new(BoundedRingService::new(consumer, 1)),
            NotifierStrategy::MultiWorker => Arc::new(MultiWorkerService::new(
                consumer,
                self.shared_pool.clone(),
                self.spec.buffer_size,
            )),
            NotifierStrategy::Striped => {
                Arc::new(StripedService::with_pool(consumer, &self.lane_pool))
            }
        };
        service.start();
        self.service_count.fetch_add(1, Ordering::SeqCst);
        self.services.lock().push(service.clone());
        service
    }

    pub fn service_count(&self) -> usize {
        self.service_count.load(Ordering::SeqCst)
    }

    /// Dispose every service created by this factory and reset the count
    /// to zero, per `Context::close`'s contract.
    pub fn close(&self) {
        let mut services = self.services.lock();
        for s in services.drain(..) {
            s.dispose();
        }
        self.service_count.store(0, Ordering::SeqCst);
    }
}

/// A `Monitor` subscription: the application-visible handle returned by
/// `Channel::add_value_monitor`. Closing is idempotent (spec.md §3).
pub struct Monitor {
    pub id: u32,
    pub channel_id: u32,
    pub event_mask: EventMask,
    pub meta_kind: crate::codec::MetaKind,
    service: Arc<dyn NotificationService>,
    closed: AtomicBool,
}

impl Monitor {
    pub fn new(
        id: u32,
        channel_id: u32,
        event_mask: EventMask,
        meta_kind: crate::codec::MetaKind,
        service: Arc<dyn NotificationService>,
    ) -> Result<Self, Status> {
        if event_mask.is_empty() {
            return Err(Status::UsageError(
                "event mask must not be all-zero".to_string(),
            ));
        }
        Ok(Self {
            id,
            channel_id,
            event_mask,
            meta_kind,
            service,
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver a value through this monitor's notification service.
    pub fn deliver(&self, bundle: Option<Bundle>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.service.publish(bundle)
    }

    /// Idempotent close: subsequent calls are no-ops, per spec.md §3's
    /// "closing a Monitor is idempotent" invariant. Per spec.md §4.6's
    /// lifecycle note, this does NOT dispose the underlying service or
    /// decrement the Context-wide service count — that's a deliberate,
    /// preserved behavior (see DESIGN.md Open Questions).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_mask_is_rejected() {
        struct NullConsumer;
        impl Consumer for NullConsumer {
            fn accept(&self, _value: Option<Bundle>) {}
        }
        let factory = NotifierFactory::new(NotifierSpec::default());
        let service = factory.create(Arc::new(NullConsumer));
        let err = Monitor::new(1, 1, EventMask(0), crate::codec::MetaKind::Plain, service);
        assert!(matches!(err, Err(Status::UsageError(_))));
    }

    #[test]
    fn spec_parses_strategy_threads_buffer() {
        let spec = NotifierSpec::parse("multi-worker,4,100").unwrap();
        assert_eq!(spec.strategy, NotifierStrategy::MultiWorker);
        assert_eq!(spec.threads, 4);
        assert_eq!(spec.buffer_size, Some(100));
    }

    #[test]
    fn unknown_strategy_is_config_error() {
        assert!(matches!(
            NotifierSpec::parse("nonexistent"),
            Err(Status::ConfigError(_))
        ));
    }

    #[test]
    fn missing_optional_fields_use_defaults() {
        let spec = NotifierSpec::parse("striped").unwrap();
        assert_eq!(spec.threads, 10);
        assert_eq!(spec.buffer_size, None);
    }

    #[test]
    fn closing_monitor_does_not_decrement_service_count() {
        struct NullConsumer;
        impl Consumer for NullConsumer {
            fn accept(&self, _value: Option<Bundle>) {}
        }
        let factory = NotifierFactory::new(NotifierSpec::default());
        let service = factory.create(Arc::new(NullConsumer));
        let monitor = Monitor::new(1, 1, EventMask::VALUE, crate::codec::MetaKind::Plain, service)
            .unwrap();
        assert_eq!(factory.service_count(), 1);
        monitor.close();
        monitor.close(); // idempotent
        assert_eq!(factory.service_count(), 1);
    }

    #[test]
    fn factory_close_resets_count_to_zero() {
        struct NullConsumer;
        impl Consumer for NullConsumer {
            fn accept(&self, _value: Option<Bundle>) {}
        }
        let factory = NotifierFactory::new(NotifierSpec::default());
        for _ in 0..3 {
            factory.create(Arc::new(NullConsumer));
        }
        assert_eq!(factory.service_count(), 3);
        factory.close();
        assert_eq!(factory.service_count(), 0);
    }
}
