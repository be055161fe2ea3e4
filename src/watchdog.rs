//! Link-health watchdog.
//!
//! A background thread wakes every `interval`, compares the link's dropped
//! packet count with a threshold and forces a reconnect when it is exceeded.
//! It exits once the stream is stopped, or when its handle is dropped.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::errors::Result;
use crate::link::Link;

/// Consecutive degraded ticks after which the watchdog escalates to `error!`
const ESCALATE_AFTER: u32 = 3;

/// Per-tick health check, separated from the thread for testing.
struct HealthCheck {
    link: Link,
    max_dropped: u32,
    degraded_streak: u32,
}

impl HealthCheck {
    /// Returns false once the watchdog should stop rescheduling.
    fn tick(&mut self) -> bool {
        if !self.link.is_streaming() && !self.link.is_reconnecting() {
            debug!("stream stopped, watchdog exiting");
            return false;
        }

        let dropped = self.link.packets_dropped();
        if dropped <= self.max_dropped {
            self.degraded_streak = 0;
            return true;
        }

        warn!(
            "detected {} dropped packets (max {}), attempting to reconnect",
            dropped, self.max_dropped
        );
        match self.link.reconnect() {
            Ok(true) => self.degraded_streak += 1,
            Ok(false) => debug!("reconnect already running, skipping tick"),
            Err(e) => {
                self.degraded_streak += 1;
                error!("reconnect failed: {}", e);
            }
        }
        if self.degraded_streak >= ESCALATE_AFTER {
            error!(
                "link still degraded after {} consecutive reconnect attempts",
                self.degraded_streak
            );
        }
        true
    }
}

/// Handle to a running watchdog thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct Watchdog {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(link: Link, interval: Duration, max_dropped: u32) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let mut check = HealthCheck {
            link,
            max_dropped,
            degraded_streak: 0,
        };

        let handle = thread::Builder::new()
            .name("openbci-watchdog".into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !check.tick() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        debug!(
            "watchdog started: interval={:?}, max_dropped={}",
            interval, max_dropped
        );
        Ok(Self {
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it. A tick in progress runs to completion.
    pub fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::{fast_config, MockTransport, BANNER};
    use std::time::Instant;

    fn streaming_link() -> Link {
        let (mock, _) = MockTransport::new(BANNER.to_vec());
        let link = Link::with_transport(Box::new(mock), fast_config()).unwrap();
        link.start().unwrap();
        link
    }

    fn check(link: &Link, max_dropped: u32) -> HealthCheck {
        HealthCheck {
            link: link.clone(),
            max_dropped,
            degraded_streak: 0,
        }
    }

    #[test]
    fn test_healthy_tick_does_nothing() {
        let link = streaming_link();
        link.record_dropped();
        let mut hc = check(&link, 1);
        assert!(hc.tick());
        assert_eq!(link.status().reconnects, 0);
        assert_eq!(link.packets_dropped(), 1);
    }

    #[test]
    fn test_degraded_tick_reconnects() {
        let link = streaming_link();
        for _ in 0..3 {
            link.record_dropped();
        }
        let mut hc = check(&link, 2);
        assert!(hc.tick());
        assert_eq!(link.packets_dropped(), 0);
        assert_eq!(link.status().reconnects, 1);
        assert!(link.is_streaming());
        assert_eq!(hc.degraded_streak, 1);

        assert!(hc.tick());
        assert_eq!(hc.degraded_streak, 0);
    }

    #[test]
    fn test_tick_stops_when_not_streaming() {
        let link = streaming_link();
        link.stop().unwrap();
        assert!(!check(&link, 0).tick());
    }

    #[test]
    fn test_failed_reconnects_escalate_without_stopping() {
        let link = streaming_link();
        link.record_dropped();
        let mut hc = check(&link, 0);
        link.disconnect().unwrap();
        for expected in 1..=ESCALATE_AFTER {
            // a failed reconnect leaves streaming off; pretend the reader is still up
            link.force_streaming(true);
            assert!(hc.tick());
            assert_eq!(hc.degraded_streak, expected);
        }
    }

    #[test]
    fn test_thread_reconnects_and_stops() {
        let link = streaming_link();
        for _ in 0..20 {
            link.record_dropped();
        }
        let mut watchdog = Watchdog::spawn(link.clone(), Duration::from_millis(10), 10).unwrap();
        assert!(watchdog.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while link.status().reconnects == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(link.status().reconnects >= 1);
        assert_eq!(link.packets_dropped(), 0);

        watchdog.stop();
        assert!(!watchdog.is_running());
    }

    #[test]
    fn test_thread_exits_after_stream_stops() {
        let link = streaming_link();
        let watchdog = Watchdog::spawn(link.clone(), Duration::from_millis(5), 10).unwrap();
        link.stop().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while watchdog.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!watchdog.is_running());
    }
}
