#![allow(dead_code)]

// A manually-advanced virtual clock. Waiting jumps virtual time
// straight to the deadline, so bounded dispatch drives simulated time
// deterministically, and queued signals wake the waiter exactly like a
// real semaphore token would.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use eventq::itick;
use eventq::utick;
use eventq::Clock;
use eventq::Sema;
use eventq::Signal;

#[derive(Debug)]
pub struct SimClock {
    now: AtomicU32,
    tokens: AtomicU32,
}

impl SimClock {
    pub fn new() -> SimClock {
        Self::at(0)
    }

    pub fn at(t: utick) -> SimClock {
        SimClock {
            now: AtomicU32::new(t),
            tokens: AtomicU32::new(0),
        }
    }

    pub fn advance(&self, ms: utick) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> utick {
        self.now.load(Ordering::SeqCst)
    }
}

impl Signal for SimClock {
    fn signal(&self) {
        self.tokens.fetch_add(1, Ordering::SeqCst);
    }
}

impl Sema for SimClock {
    fn wait(&self, ticks: itick) {
        // pending signals wake us immediately
        let woken = self.tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| t.checked_sub(1))
            .is_ok();
        if woken {
            return;
        }

        assert!(ticks >= 0, "unbounded simulated wait would never wake");
        self.advance(ticks as utick);
    }
}
