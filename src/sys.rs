
// sys.rs provides the tick types and the default clock/semaphore
// implementation on top of std

use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::traits::*;


// Time primitives, the handle format partitions exactly 32 bits so the
// tick width is fixed
#[allow(non_camel_case_types)]
pub type utick = u32;

#[allow(non_camel_case_types)]
pub type itick = i32;


/// Default time/semaphore primitive
///
/// Milliseconds since construction, wrapping at 2^32, paired with a
/// condvar-backed counting semaphore for dispatcher wakeups.
#[derive(Debug)]
pub struct SysClock {
    instant: Instant,

    tokens: Mutex<u32>,
    cond: Condvar,
}

impl SysClock {
    pub fn new() -> Self {
        Self {
            instant: Instant::now(),

            tokens: Mutex::new(0),
            cond: Condvar::new(),
        }
    }
}

impl Default for SysClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SysClock {
    fn now(&self) -> utick {
        self.instant
            .elapsed()
            .as_millis()
            as utick
    }
}

impl Signal for SysClock {
    fn signal(&self) {
        let mut tokens = self.tokens.lock();
        *tokens = tokens.saturating_add(1);
        drop(tokens);

        self.cond.notify_one();
    }
}

impl Sema for SysClock {
    fn wait(&self, ticks: itick) {
        let mut tokens = self.tokens.lock();

        // already signalled?
        if *tokens > 0 {
            *tokens -= 1;
            return;
        }

        if ticks < 0 {
            self.cond.wait(&mut tokens);
        } else {
            let _ = self.cond.wait_for(
                &mut tokens,
                Duration::from_millis(ticks as u64)
            );
        }

        // consume a token if one arrived, the caller tolerates
        // spurious wakes either way
        if *tokens > 0 {
            *tokens -= 1;
        }
    }
}
