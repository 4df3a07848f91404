//! # Bounded-Latest / Latest-Only Strategies
//!
//! Both strategies from spec.md §4.6 #1 and #2 are the same ring buffer
//! parameterized by capacity: 2 slots for "disruptor-old" (bounded-latest,
//! overrun consolidation keeps the newest plus one trailing slot), 1 slot
//! for "disruptor-new" (latest-only, always-coalescing). A single
//! dedicated worker thread per service drains the ring and calls the
//! consumer, exactly as spec.md describes ("Single worker thread per
//! service").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::codec::Bundle;

use super::{Consumer, NotificationService, QosReport};

struct Ring {
    queue: Mutex<VecDeque<Option<Bundle>>>,
    cap: usize,
    not_empty: Condvar,
    stopped: AtomicBool,
}

/// A ring-buffer notification service with configurable capacity (1 or 2
/// slots).
pub struct BoundedRingService {
    ring: Arc<Ring>,
    consumer: Arc<dyn Consumer>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BoundedRingService {
    pub fn new(consumer: Arc<dyn Consumer>, cap: usize) -> Self {
        Self {
            ring: Arc::new(Ring {
                queue: Mutex::new(VecDeque::with_capacity(cap)),
                cap,
                not_empty: Condvar::new(),
                stopped: AtomicBool::new(false),
            }),
            consumer,
            worker: Mutex::new(None),
        }
    }
}

impl NotificationService for BoundedRingService {
    fn publish(&self, value: Option<Bundle>) -> bool {
        let mut queue = self.ring.queue.lock();
        if queue.len() == self.ring.cap {
            // Overrun consolidation: drop the oldest entry so the newest
            // value always survives.
            queue.pop_front();
        }
        queue.push_back(value);
        self.ring.not_empty.notify_one();
        true
    }

    fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let ring = self.ring.clone();
        let consumer = self.consumer.clone();
        *worker = Some(std::thread::spawn(move || loop {
            let item = {
                let mut queue = ring.queue.lock();
                while queue.is_empty() && !ring.stopped.load(Ordering::SeqCst) {
                    ring.not_empty.wait(&mut queue);
                }
                if queue.is_empty() && ring.stopped.load(Ordering::SeqCst) {
                    return;
                }
                queue.pop_front()
            };
            if let Some(item) = item {
                consumer.accept(item);
            }
        }));
    }

    fn dispose(&self) {
        self.ring.stopped.store(true, Ordering::SeqCst);
        self.ring.not_empty.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn qos(&self) -> QosReport {
        QosReport {
            threads_per_consumer: 1,
            null_publishable: true,
            buffered: true,
            buffer_size: Some(self.ring.cap),
        }
    }
}
