use std::sync::atomic::{AtomicI64, Ordering};
use tokio::time::Instant;

use crate::util::clock::LocalClock;


/// A [LocalClock] that starts at an arbitrary time and advances with tokio's (possibly paused)
///  clock. Tests can simulate unaligned system clocks by starting clocks at different times, and
///  clock jumps by calling [ManualClock::jump].
pub struct ManualClock {
    start_millis: AtomicI64,
    anchor: Instant,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> ManualClock {
        ManualClock {
            start_millis: AtomicI64::new(start_millis),
            anchor: Instant::now(),
        }
    }

    pub fn jump(&self, delta_millis: i64) {
        self.start_millis.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl LocalClock for ManualClock {
    fn now_millis(&self) -> i64 {
        let elapsed: i64 = self.anchor.elapsed().as_millis()
            .try_into()
            .unwrap_or(i64::MAX);
        self.start_millis.load(Ordering::SeqCst).saturating_add(elapsed)
    }
}
