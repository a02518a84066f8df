//! Send-side backpressure.
//!
//! Level-triggered: before enqueueing a chunk, the sender polls the
//! channel's outstanding-unsent byte count against a high-water mark and
//! defers while it is exceeded. Backpressure is the designed response to a
//! slow receiver, not an error; only a buffer that never drains within the
//! timeout fails the transfer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::channel::DataChannel;

/// Default high-water mark for the channel's send buffer (1 MiB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024 * 1024;

/// Default interval between buffer polls while above the mark.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default ceiling on one continuous backpressure wait.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub high_water_mark: usize,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Why a backpressure wait ended without capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAbort {
    /// The transfer's cancellation flag was set during the wait.
    Cancelled,
    /// The buffer never drained below the mark within the timeout.
    DrainTimeout { buffered: usize },
}

impl fmt::Display for FlowAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAbort::Cancelled => write!(f, "transfer cancelled during backpressure wait"),
            FlowAbort::DrainTimeout { buffered } => write!(
                f,
                "send buffer failed to drain ({} bytes still queued)",
                buffered
            ),
        }
    }
}

impl FlowConfig {
    /// Wait until the channel's send buffer is at or below the high-water
    /// mark. The cancellation flag is checked on every poll so a cancelled
    /// transfer never keeps polling.
    pub async fn wait_for_capacity(
        &self,
        channel: &dyn DataChannel,
        cancelled: &AtomicBool,
    ) -> Result<(), FlowAbort> {
        let start = Instant::now();
        loop {
            if cancelled.load(Ordering::Relaxed) {
                return Err(FlowAbort::Cancelled);
            }
            let buffered = channel.buffered_amount().await;
            if buffered <= self.high_water_mark {
                return Ok(());
            }
            if start.elapsed() >= self.drain_timeout {
                return Err(FlowAbort::DrainTimeout { buffered });
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use std::sync::Arc;

    fn fast_config() -> FlowConfig {
        FlowConfig {
            high_water_mark: 1024,
            poll_interval: Duration::from_millis(5),
            drain_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_passes_immediately_under_mark() {
        let (a, _b) = MemoryChannel::pair("file-transfer");
        let cancelled = AtomicBool::new(false);

        let result = fast_config()
            .wait_for_capacity(&*a.channel, &cancelled)
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_waits_until_buffer_drains() {
        let (a, _b) = MemoryChannel::pair("file-transfer");
        a.channel.set_buffered(8 * 1024);
        let cancelled = AtomicBool::new(false);

        let drainer = {
            let ch = a.channel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(30)).await;
                ch.set_buffered(0);
            })
        };

        let result = fast_config()
            .wait_for_capacity(&*a.channel, &cancelled)
            .await;
        assert_eq!(result, Ok(()));
        drainer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let (a, _b) = MemoryChannel::pair("file-transfer");
        a.channel.set_buffered(8 * 1024);
        let cancelled = Arc::new(AtomicBool::new(false));

        let flipper = {
            let cancelled = cancelled.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                cancelled.store(true, Ordering::Relaxed);
            })
        };

        let result = fast_config()
            .wait_for_capacity(&*a.channel, &cancelled)
            .await;
        assert_eq!(result, Err(FlowAbort::Cancelled));
        flipper.await.unwrap();
    }

    #[tokio::test]
    async fn test_stuck_buffer_times_out() {
        let (a, _b) = MemoryChannel::pair("file-transfer");
        a.channel.set_buffered(8 * 1024);
        let cancelled = AtomicBool::new(false);

        let result = fast_config()
            .wait_for_capacity(&*a.channel, &cancelled)
            .await;
        assert_eq!(
            result,
            Err(FlowAbort::DrainTimeout { buffered: 8 * 1024 })
        );
    }
}
