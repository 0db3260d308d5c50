//! Per-tunnel reconnect timers with exponential backoff.
//!
//! Attempt N fires after `min(2^N, 30)` seconds, N starting at 0. A timer is
//! armed by the manager when a worker fails with auto-reconnect on, and is
//! dropped on success, user disconnect or server deletion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

struct Timer {
    /// Exponent for the next delay; also how many attempts have fired.
    attempt_n: u32,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct ReconnectScheduler {
    timers: Mutex<HashMap<String, Timer>>,
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backoff_for(attempt_n: u32) -> Duration {
        let secs = 2u64.checked_pow(attempt_n).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(MAX_BACKOFF)
    }

    /// Arm the timer for `server_id`, firing `on_fire` after the backoff
    /// delay. Returns the 1-based attempt number and the delay, or `None`
    /// when a timer for this id is already pending.
    pub fn arm<F>(&self, server_id: &str, on_fire: F) -> Option<(u32, Duration)>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers.lock().unwrap();

        let attempt_n = match timers.get(server_id) {
            Some(timer) if !timer.task.is_finished() => return None,
            Some(timer) => timer.attempt_n,
            None => 0,
        };

        let delay = Self::backoff_for(attempt_n);
        debug!("arming reconnect for {server_id}: attempt {} in {delay:?}", attempt_n + 1);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire.await;
        });

        timers.insert(
            server_id.to_string(),
            Timer {
                attempt_n: attempt_n + 1,
                task,
            },
        );
        Some((attempt_n + 1, delay))
    }

    /// Drop the timer and reset the backoff streak. Used on successful
    /// reconnection, user disconnect and server deletion.
    pub fn cancel(&self, server_id: &str) {
        if let Some(timer) = self.timers.lock().unwrap().remove(server_id) {
            timer.task.abort();
        }
    }

    pub fn cancel_all(&self) {
        for (_, timer) in self.timers.lock().unwrap().drain() {
            timer.task.abort();
        }
    }

    /// Whether a timer is currently armed for this id.
    pub fn is_pending(&self, server_id: &str) -> bool {
        self.timers
            .lock()
            .unwrap()
            .get(server_id)
            .map(|t| !t.task.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_and_saturates() {
        assert_eq!(ReconnectScheduler::backoff_for(0), Duration::from_secs(1));
        assert_eq!(ReconnectScheduler::backoff_for(1), Duration::from_secs(2));
        assert_eq!(ReconnectScheduler::backoff_for(4), Duration::from_secs(16));
        assert_eq!(ReconnectScheduler::backoff_for(5), Duration::from_secs(30));
        assert_eq!(ReconnectScheduler::backoff_for(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn single_timer_per_server() {
        let sched = ReconnectScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f1 = fired.clone();
        let armed = sched.arm("s", async move {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(armed.map(|(n, _)| n), Some(1));

        // Second arm while the first is pending is refused.
        let f2 = fired.clone();
        assert!(sched
            .arm("s", async move {
                f2.fetch_add(1, Ordering::SeqCst);
            })
            .is_none());
        assert!(sched.is_pending("s"));
        sched.cancel("s");
        assert!(!sched.is_pending("s"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_escalate_until_cancel() {
        let sched = ReconnectScheduler::new();

        let (n, delay) = sched.arm("s", async {}).unwrap();
        assert_eq!((n, delay), (1, Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_secs(2)).await;

        let (n, delay) = sched.arm("s", async {}).unwrap();
        assert_eq!((n, delay), (2, Duration::from_secs(2)));

        sched.cancel("s");
        let (n, delay) = sched.arm("s", async {}).unwrap();
        assert_eq!((n, delay), (1, Duration::from_secs(1)));
        sched.cancel("s");
    }
}
