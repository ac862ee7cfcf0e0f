//! Single-slot frame rendezvous between a capture thread and the render thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Auto-reset event: one `signal` releases one `wait`.
#[derive(Debug, Default)]
struct WaitEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitEvent {
    fn signal(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_one();
    }

    fn reset(&self) {
        *self.signaled.lock() = false;
    }

    fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        *signaled = false;
    }
}

/// Outcome of [`FrameHandoff::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The render thread consumed the frame.
    Consumed {
        /// How long the frame waited for the render thread.
        waited: Duration,
    },

    /// Shutdown was requested while waiting.
    Terminated,
}

/// At most one frame in flight per monitor.
///
/// The producer publishes a frame with [`FrameHandoff::deliver`], which blocks
/// until the consumer calls [`FrameHandoff::acknowledge`] or the worker is
/// terminated. The consumer never blocks: it polls [`FrameHandoff::is_ready`]
/// once per HMD frame.
#[derive(Debug, Default)]
pub struct FrameHandoff {
    ready: AtomicBool,
    event: WaitEvent,
    delivered: AtomicU64,
}

impl FrameHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a frame and parks until it is consumed or `terminated` is set.
    pub fn deliver(&self, terminated: &AtomicBool) -> Delivery {
        let start = Instant::now();
        self.event.reset();
        self.ready.store(true, Ordering::Release);

        loop {
            if terminated.load(Ordering::Acquire) {
                return Delivery::Terminated;
            }
            if !self.ready.load(Ordering::Acquire) {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                return Delivery::Consumed {
                    waited: start.elapsed(),
                };
            }
            self.event.wait();
        }
    }

    /// Non-blocking check for a pending frame.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Marks the pending frame consumed and wakes the producer.
    pub fn acknowledge(&self) {
        self.ready.store(false, Ordering::Release);
        self.event.signal();
    }

    /// Wakes a parked producer without consuming, so it can observe shutdown.
    pub fn wake(&self) {
        self.event.signal();
    }

    /// Frames consumed so far.
    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_deliver_blocks_until_acknowledged() {
        let handoff = Arc::new(FrameHandoff::new());
        let terminated = Arc::new(AtomicBool::new(false));

        let producer = {
            let handoff = Arc::clone(&handoff);
            let terminated = Arc::clone(&terminated);
            thread::spawn(move || handoff.deliver(&terminated))
        };

        while !handoff.is_ready() {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());

        handoff.acknowledge();
        let outcome = producer.join().unwrap();
        assert!(matches!(outcome, Delivery::Consumed { .. }));
        assert_eq!(handoff.frames_delivered(), 1);
        assert!(!handoff.is_ready());
    }

    #[test]
    fn test_termination_wakes_producer() {
        let handoff = Arc::new(FrameHandoff::new());
        let terminated = Arc::new(AtomicBool::new(false));

        let producer = {
            let handoff = Arc::clone(&handoff);
            let terminated = Arc::clone(&terminated);
            thread::spawn(move || handoff.deliver(&terminated))
        };

        while !handoff.is_ready() {
            thread::yield_now();
        }
        terminated.store(true, Ordering::Release);
        handoff.wake();

        assert_eq!(producer.join().unwrap(), Delivery::Terminated);
        assert_eq!(handoff.frames_delivered(), 0);
    }

    #[test]
    fn test_at_most_one_frame_in_flight() {
        let handoff = Arc::new(FrameHandoff::new());
        let terminated = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicU64::new(0));
        let max_seen = Arc::new(AtomicU64::new(0));

        let producer = {
            let handoff = Arc::clone(&handoff);
            let terminated = Arc::clone(&terminated);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            thread::spawn(move || {
                for _ in 0..200 {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    if handoff.deliver(&terminated) == Delivery::Terminated {
                        break;
                    }
                }
            })
        };

        let mut consumed = 0;
        while consumed < 200 {
            if handoff.is_ready() {
                in_flight.fetch_sub(1, Ordering::SeqCst);
                handoff.acknowledge();
                consumed += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(handoff.frames_delivered(), 200);
    }
}
