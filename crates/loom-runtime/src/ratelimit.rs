//! Rolling-window limiter on job starts.
//!
//! At most `max` starts are admitted in any window of length `window`. Callers
//! that arrive when the window is full wait until the oldest start ages out.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct WindowLimiter {
    max: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl WindowLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a start if the window has room, otherwise report how long
    /// until it will.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut starts = self.starts.lock();
        while let Some(&oldest) = starts.front() {
            if now.duration_since(oldest) >= self.window {
                starts.pop_front();
            } else {
                break;
            }
        }
        if starts.len() < self.max {
            starts.push_back(now);
            return Ok(());
        }
        let oldest = starts.front().copied().unwrap_or(now);
        Err(self.window.saturating_sub(now.duration_since(oldest)))
    }

    /// Wait until a start is admitted.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "job start rate limited");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Starts currently counted against the window.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        self.starts
            .lock()
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }
}
