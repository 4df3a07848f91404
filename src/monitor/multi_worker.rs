//! # Multi-Worker Blocking Queue Strategy
//!
//! Spec.md §4.6 #3: a shared pool of N workers services many consumers
//! through a per-consumer FIFO queue (bounded or unbounded); when a bounded
//! queue is full, the oldest entry is dropped. At most one task drains a
//! given consumer's queue at a time, so delivery stays strictly FIFO per
//! consumer even though the draining task may run on any idle worker from
//! the shared pool (work-stealing, unlike the fixed per-consumer lane the
//! striped strategy uses).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::Bundle;

use super::{Consumer, NotificationService, QosReport};

struct Queue {
    items: Mutex<VecDeque<Option<Bundle>>>,
    bound: Option<usize>,
    scheduled: AtomicBool,
}

/// A shared-pool, per-consumer-FIFO-queue notification service.
pub struct MultiWorkerService {
    queue: Arc<Queue>,
    consumer: Arc<dyn Consumer>,
    pool: Arc<rayon::ThreadPool>,
    pool_size: usize,
    disposed: AtomicBool,
}

impl MultiWorkerService {
    pub fn new(
        consumer: Arc<dyn Consumer>,
        pool: Arc<rayon::ThreadPool>,
        bound: Option<usize>,
    ) -> Self {
        let pool_size = pool.current_num_threads();
        Self {
            queue: Arc::new(Queue {
                items: Mutex::new(VecDeque::new()),
                bound,
                scheduled: AtomicBool::new(false),
            }),
            consumer,
            pool,
            pool_size,
            disposed: AtomicBool::new(false),
        }
    }

    /// Schedule a drain task on the shared pool if one isn't already
    /// running for this consumer. `compare_exchange` on `scheduled` is the
    /// single-flight gate that keeps delivery FIFO: only one task ever
    /// owns the right to pop from `items` at a time.
    fn schedule_drain(&self) {
        if self
            .queue
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let queue = self.queue.clone();
        let consumer = self.consumer.clone();
        self.pool.spawn(move || {
            loop {
                let item = {
                    let mut items = queue.items.lock();
                    items.pop_front()
                };
                match item {
                    Some(item) => consumer.accept(item),
                    None => break,
                }
            }
            queue.scheduled.store(false, Ordering::Release);
            // A publish may have raced the final empty check between the
            // pop and the flag reset; re-check and reschedule if so.
            if !queue.items.lock().is_empty() {
                // Re-arm: a concurrent publish saw `scheduled == true` and
                // skipped scheduling, so we must not drop its work.
                if queue
                    .scheduled
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let queue2 = queue.clone();
                    let consumer2 = consumer.clone();
                    drain_inline(queue2, consumer2);
                }
            }
        });
    }
}

fn drain_inline(queue: Arc<Queue>, consumer: Arc<dyn Consumer>) {
    loop {
        let item = {
            let mut items = queue.items.lock();
            items.pop_front()
        };
        match item {
            Some(item) => consumer.accept(item),
            None => break,
        }
    }
    queue.scheduled.store(false, Ordering::Release);
}

impl NotificationService for MultiWorkerService {
    fn publish(&self, value: Option<Bundle>) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        let accepted = {
            let mut items = self.queue.items.lock();
            if let Some(bound) = self.queue.bound {
                if items.len() >= bound {
                    items.pop_front(); // drop-oldest backpressure policy
                }
            }
            items.push_back(value);
            true
        };
        self.schedule_drain();
        accepted
    }

    fn start(&self) {}

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.queue.items.lock().clear();
    }

    fn qos(&self) -> QosReport {
        QosReport {
            threads_per_consumer: self.pool_size,
            null_publishable: true,
            buffered: true,
            buffer_size: self.queue.bound,
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

    fn pool() -> Arc<rayon::ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap())
    }

    #[test]
    fn preserves_fifo_order_per_consumer() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let service = MultiWorkerService::new(Arc::new(Recorder(received.clone())), pool(), None);
        for i in 0..50 {
            service.publish(Some(bundle(i as f64)));
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 50);
        for (i, v) in got.iter().enumerate() {
            assert_eq!(*v, Some(bundle(i as f64)));
        }
    }

    #[test]
    fn bounded_queue_drops_oldest() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let service =
            MultiWorkerService::new(Arc::new(Recorder(received.clone())), pool(), Some(1));
        // Fill faster than the single drain task can keep up by publishing
        // from this thread while holding a lock indirectly isn't possible,
        // so instead assert the bound is respected at the data-structure
        // level directly.
        {
            let mut items = service.queue.items.lock();
            items.push_back(Some(bundle(1.0)));
        }
        service.publish(Some(bundle(2.0)));
        let items = service.queue.items.lock();
        assert!(items.len() <= 1);
    }

    fn bundle(v: f64) -> Bundle {
        Bundle {
            meta: crate::codec::Metadata::Plain,
            value: crate::codec::Value::Double(vec![v]),
        }
    }
}
