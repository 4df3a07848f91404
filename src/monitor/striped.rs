//! # Striped Executor Strategy
//!
//! Spec.md §4.6 #4: one shared pool of N threads; tasks for a given
//! consumer are always routed to the same lane, so that consumer's
//! deliveries execute sequentially on a single thread while other
//! consumers' lanes run in parallel. Unlike `MultiWorkerService` (which
//! work-steals across a rayon pool), this uses N fixed dedicated threads,
//! each with its own crossbeam channel — a consumer is "striped" onto a
//! lane once, by a stable hash of its identity, rather than floating
//! across whichever worker happens to be idle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Sender};

use crate::codec::Bundle;

use super::{Consumer, NotificationService, QosReport};

/// A fixed pool of single-threaded lanes, shared by every `StripedService`
/// minted from the same `NotifierFactory` (mirroring how
/// `MultiWorkerService` instances share one `rayon::ThreadPool`).
pub struct LanePool {
    lanes: Vec<Sender<Box<dyn FnOnce() + Send>>>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl LanePool {
    pub fn new(n: usize) -> Self {
        let mut lanes = Vec::with_capacity(n);
        let mut workers = Vec::with_capacity(n);
        for i in 0..n.max(1) {
            let (tx, rx) = bounded::<Box<dyn FnOnce() + Send>>(4096);
            let handle = std::thread::Builder::new()
                .name(format!("ca-notify-stripe-{i}"))
                .spawn(move || {
                    for task in rx {
                        task();
                    }
                })
                .expect("failed to spawn striped notification lane");
            lanes.push(tx);
            workers.push(handle);
        }
        Self {
            lanes,
            _workers: workers,
        }
    }

    fn lane_for(&self, consumer_id: usize) -> Sender<Box<dyn FnOnce() + Send>> {
        self.lanes[consumer_id % self.lanes.len()].clone()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

static NEXT_CONSUMER_ID: AtomicUsize = AtomicUsize::new(1);

/// A striped-executor notification service: one consumer, bound for its
/// whole lifetime to a single lane of a shared `LanePool`.
pub struct StripedService {
    lane: Sender<Box<dyn FnOnce() + Send>>,
    consumer: Arc<dyn Consumer>,
    lane_count: usize,
    disposed: AtomicBool,
}

impl StripedService {
    /// Build a service against its own private single-lane pool. Used
    /// directly in tests; `NotifierFactory` instead calls
    /// `with_pool` so sibling monitors actually share the N threads.
    pub fn new(consumer: Arc<dyn Consumer>, lane_count: usize) -> Self {
        Self::with_pool(consumer, &Arc::new(LanePool::new(lane_count)))
    }

    pub fn with_pool(consumer: Arc<dyn Consumer>, pool: &Arc<LanePool>) -> Self {
        let consumer_id = NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            lane: pool.lane_for(consumer_id),
            consumer,
            lane_count: pool.lane_count(),
            disposed: AtomicBool::new(false),
        }
    }
}

impl NotificationService for StripedService {
    fn publish(&self, value: Option<Bundle>) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        let consumer = self.consumer.clone();
        self.lane
            .send(Box::new(move || consumer.accept(value)))
            .is_ok()
    }

    fn start(&self) {}

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn qos(&self) -> QosReport {
        QosReport {
            threads_per_consumer: self.lane_count,
            null_publishable: true,
            buffered: true,
            buffer_size: Some(4096),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder(Arc<StdMutex<Vec<Option<Bundle>>>>);
    impl Consumer for Recorder {
        fn accept(&self, value: Option<Bundle>) {
            self.0.lock().unwrap().push(value);
        }
    }

    #[test]
    fn single_consumer_sees_strict_fifo() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let service = StripedService::new(Arc::new(Recorder(received.clone())), 4);
        for i in 0..100 {
            service.publish(Some(bundle(i as f64)));
        }
        std::thread::sleep(std::time::Duration::from_millis(150));
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 100);
        for (i, v) in got.iter().enumerate() {
            assert_eq!(*v, Some(bundle(i as f64)));
        }
    }

    #[test]
    fn two_consumers_on_shared_pool_progress_independently() {
        let r1 = Arc::new(StdMutex::new(Vec::new()));
        let r2 = Arc::new(StdMutex::new(Vec::new()));
        let pool = Arc::new(LanePool::new(4));
        let s1 = StripedService::with_pool(Arc::new(Recorder(r1.clone())), &pool);
        let s2 = StripedService::with_pool(Arc::new(Recorder(r2.clone())), &pool);
        for i in 0..20 {
            s1.publish(Some(bundle(i as f64)));
            s2.publish(Some(bundle((i * 2) as f64)));
        }
        std::thread::sleep(std::time::Duration::from_millis(150));
        assert_eq!(r1.lock().unwrap().len(), 20);
        assert_eq!(r2.lock().unwrap().len(), 20);
    }

    fn bundle(v: f64) -> Bundle {
        Bundle {
            meta: crate::codec::Metadata::Plain,
            value: crate::codec::Value::Double(vec![v]),
        }
    }
}
