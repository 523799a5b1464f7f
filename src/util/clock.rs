use std::time::SystemTime;
use tokio::time::Instant;


/// Source of 'local time', i.e. milliseconds since the UNIX epoch as seen by this process.
///
/// This is an abstraction to allow tests to simulate processes with unaligned system clocks.
pub trait LocalClock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

/// The system clock is read once when this clock is created, and local time is then advanced
///  based on tokio's monotonic clock. This means that jumps of the system clock while the
///  process is running are not reflected in local time, which keeps liveness calculations
///  stable (and makes paused-time tests work).
pub struct SystemClock {
    anchor_millis: i64,
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> anyhow::Result<SystemClock> {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();

        Ok(SystemClock {
            anchor_millis: millis.try_into()?,
            anchor: Instant::now(),
        })
    }
}

impl LocalClock for SystemClock {
    fn now_millis(&self) -> i64 {
        let elapsed: i64 = self.anchor.elapsed().as_millis()
            .try_into()
            .unwrap_or(i64::MAX);
        self.anchor_millis.saturating_add(elapsed)
    }
}
