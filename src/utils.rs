//! # Utility Functions
//!
//! Small helpers shared across the iomux and registry modules: a wall-clock
//! stamp for the `Request` "creation timestamp" attribute (spec.md §3) and a
//! monotonic counter used for client-ids and I/O-IDs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Epoch-millis since the Unix epoch, used to stamp each outstanding
/// `Request`'s creation time so its age can be logged when it completes or
/// is cancelled.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A monotonic, wrapping 32-bit id generator.
///
/// Used for both client-ids (per Context, per spec.md §3) and I/O-IDs (per
/// Context, per spec.md §4.5). Wraps on overflow; the mux/registry maintain
/// uniqueness by occupancy as spec.md §4.5 specifies, not by the counter
/// alone.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Allocate the next id, wrapping past `u32::MAX` back to 1 (0 is
    /// reserved so it can serve as a sentinel "no id" value).
    pub fn next(&self) -> u32 {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let next = if current == u32::MAX { 1 } else { current + 1 };
            if self
                .next
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_is_monotonic_and_nonzero() {
        let gen = IdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn id_generator_wraps_past_max() {
        let gen = IdGenerator {
            next: AtomicU32::new(u32::MAX),
        };
        assert_eq!(gen.next(), u32::MAX);
        assert_eq!(gen.next(), 1);
    }

    #[test]
    fn now_unix_millis_is_nonzero() {
        assert!(now_unix_millis() > 0);
    }
}
