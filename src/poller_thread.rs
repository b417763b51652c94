//! A background thread that runs a task periodically until it is stopped. Used to poll flag
//! configuration and to flush buffered events.
use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, SyncSender},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// Configuration for [`PollerThread`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between two runs of the task.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between runs. This helps to avoid multiple
    /// server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to zero.
    pub jitter: Duration,
    /// Maximum time [`PollerThread::shutdown`] waits for the thread to exit.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_JOIN_TIMEOUT`].
    pub join_timeout: Duration,
}

impl PollerThreadConfig {
    /// Default value for [`PollerThreadConfig::interval`].
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
    /// Default value for [`PollerThreadConfig::join_timeout`].
    pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a new `PollerThreadConfig` using default configuration.
    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    /// Update interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    /// Update interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }

    /// Update shutdown join timeout with `join_timeout`.
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> PollerThreadConfig {
        self.join_timeout = join_timeout;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_INTERVAL,
            jitter: Duration::ZERO,
            join_timeout: PollerThreadConfig::DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// A periodic background thread.
///
/// The thread sleeps for the configured interval, runs its task, and loops. The sleep is
/// interrupted as soon as [`PollerThread::stop`] is called, so shutdown does not wait out the
/// interval.
pub struct PollerThread {
    name: String,

    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the thread.
    stop_sender: SyncSender<()>,

    /// Disconnects when the thread exits (the sender is owned by the thread).
    exited: Receiver<()>,

    join_timeout: Duration,
}

impl PollerThread {
    /// Starts a thread named `name` that runs `task` every `config.interval`.
    ///
    /// The first run happens after one interval. A panicking task is logged and the loop carries
    /// on.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start<F>(
        name: impl Into<String>,
        config: PollerThreadConfig,
        mut task: F,
    ) -> std::io::Result<PollerThread>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();

        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 is enough: we `try_send()` and ignore a full buffer (another
        // thread has sent a stop command already).
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let (exited_sender, exited) = std::sync::mpsc::channel::<()>();

        let join_handle = {
            let name = name.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let _exited_sender = exited_sender;
                    loop {
                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                let result = std::panic::catch_unwind(
                                    std::panic::AssertUnwindSafe(&mut task),
                                );
                                if result.is_err() {
                                    log::warn!(target: "gofeatureflag", thread = name.as_str(); "background task panicked");
                                }
                            }
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "gofeatureflag", thread = name.as_str(); "background thread received stop command");
                                return;
                            }
                        }
                    }
                })?
        };

        Ok(PollerThread {
            name,
            join_handle,
            stop_sender,
            exited,
            join_timeout: config.join_timeout,
        })
    }

    /// Stop the thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the channel buffer is
        // full. Both mean the thread is stopping anyway.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the thread and wait for it to exit, at most for the configured join timeout.
    ///
    /// If the thread does not exit in time it is detached and `Ok(())` is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        match self.exited.recv_timeout(self.join_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(target: "gofeatureflag",
                    thread = self.name.as_str(),
                    timeout_ms = self.join_timeout.as_millis() as u64;
                    "background thread did not exit in time, detaching it");
                Ok(())
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self
                .join_handle
                .join()
                .map_err(|_| Error::PollerThreadPanicked),
        }
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use super::{PollerThread, PollerThreadConfig};

    #[test]
    fn runs_task_periodically() {
        let runs = Arc::new(AtomicUsize::new(0));
        let poller = {
            let runs = runs.clone();
            PollerThread::start(
                "test-poller",
                PollerThreadConfig::new().with_interval(Duration::from_millis(10)),
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        poller.shutdown().unwrap();

        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn shutdown_interrupts_long_interval() {
        let poller = PollerThread::start(
            "test-poller",
            PollerThreadConfig::new().with_interval(Duration::from_secs(3600)),
            || {},
        )
        .unwrap();

        let started = Instant::now();
        poller.shutdown().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn shutdown_gives_up_after_join_timeout() {
        let poller = PollerThread::start(
            "test-poller",
            PollerThreadConfig::new()
                .with_interval(Duration::from_millis(1))
                .with_join_timeout(Duration::from_millis(50)),
            || std::thread::sleep(Duration::from_millis(500)),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(poller.shutdown().is_ok());
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn survives_panicking_task() {
        let runs = Arc::new(AtomicUsize::new(0));
        let poller = {
            let runs = runs.clone();
            PollerThread::start(
                "test-poller",
                PollerThreadConfig::new().with_interval(Duration::from_millis(5)),
                move || {
                    if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first run fails");
                    }
                },
            )
            .unwrap()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(poller.shutdown().is_ok());
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let interval = Duration::from_secs(30);

        let result = super::jitter(interval, Duration::ZERO);

        assert_eq!(result, Duration::from_secs(30));
    }
}
