//! Buffers events in memory and sends them to the data collector in batches.
use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    api::CollectorApi,
    events::{Event, ExporterMetadata},
    poller_thread::{PollerThread, PollerThreadConfig},
    Error, Result,
};

/// Configuration for [`EventPublisher`].
#[derive(Debug, Clone)]
pub struct EventPublisherConfig {
    /// Interval between two periodic flushes.
    pub flush_interval: Duration,
    /// Buffer length that triggers an immediate flush. The buffer is capped at twice this value.
    pub max_pending_events: usize,
    /// Maximum time [`EventPublisher::stop`] waits for the flush thread to exit.
    pub join_timeout: Duration,
}

impl EventPublisherConfig {
    /// Default value for [`EventPublisherConfig::flush_interval`].
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(60_000);
    /// Default value for [`EventPublisherConfig::max_pending_events`].
    pub const DEFAULT_MAX_PENDING_EVENTS: usize = 10_000;
}

impl Default for EventPublisherConfig {
    fn default() -> Self {
        EventPublisherConfig {
            flush_interval: EventPublisherConfig::DEFAULT_FLUSH_INTERVAL,
            max_pending_events: EventPublisherConfig::DEFAULT_MAX_PENDING_EVENTS,
            join_timeout: PollerThreadConfig::DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Buffers [`Event`]s and publishes them periodically, or immediately once
/// `max_pending_events` are waiting.
///
/// - At most one immediate flush runs at a time, however many events arrive meanwhile.
/// - A failed send puts the batch back in front of the buffer; the next flush retries it.
/// - The buffer never holds more than `max_pending_events * 2` events; the oldest ones are
///   dropped first.
/// - [`EventPublisher::stop`] flushes whatever is left before returning.
pub struct EventPublisher {
    shared: Arc<Shared>,
    flush_thread: Mutex<Option<PollerThread>>,
}

struct Shared {
    api: Arc<dyn CollectorApi>,
    config: EventPublisherConfig,
    metadata: ExporterMetadata,
    queue: Mutex<EventQueue>,
}

#[derive(Default)]
struct EventQueue {
    events: VecDeque<Event>,
    immediate_flush_scheduled: bool,
}

impl EventPublisher {
    /// Create a publisher that sends batches through `api` along with `metadata`.
    pub fn new(
        api: Arc<dyn CollectorApi>,
        config: EventPublisherConfig,
        metadata: ExporterMetadata,
    ) -> EventPublisher {
        EventPublisher {
            shared: Arc::new(Shared {
                api,
                config,
                metadata,
                queue: Mutex::new(EventQueue::default()),
            }),
            flush_thread: Mutex::new(None),
        }
    }

    /// Start the periodic flush thread. No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut flush_thread = lock(&self.flush_thread);
        if flush_thread.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let thread = PollerThread::start(
            "gofeatureflag-flush",
            PollerThreadConfig::new()
                .with_interval(self.shared.config.flush_interval)
                .with_join_timeout(self.shared.config.join_timeout),
            move || shared.publish(),
        )?;
        *flush_thread = Some(thread);
        Ok(())
    }

    /// Stop the periodic flush thread and publish remaining events synchronously. No-op if not
    /// running.
    pub fn stop(&self) -> Result<()> {
        let Some(thread) = lock(&self.flush_thread).take() else {
            return Ok(());
        };
        let result = thread.shutdown();
        self.shared.publish();
        result
    }

    /// Append `event` to the buffer.
    pub fn add_event(&self, event: impl Into<Event>) {
        let should_flush = {
            let mut queue = lock(&self.shared.queue);
            queue.events.push_back(event.into());
            self.shared.evict_overflow(&mut queue);

            let should_flush = queue.events.len() >= self.shared.config.max_pending_events
                && !queue.immediate_flush_scheduled;
            if should_flush {
                queue.immediate_flush_scheduled = true;
            }
            should_flush
        };

        if should_flush {
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name("gofeatureflag-immediate-flush".to_owned())
                .spawn(move || shared.publish_immediate());
            if let Err(err) = spawned {
                log::warn!(target: "gofeatureflag", "failed to start immediate flush: {:?}", err);
                lock(&self.shared.queue).immediate_flush_scheduled = false;
            }
        }
    }

    /// Number of events waiting to be published.
    pub fn pending_events(&self) -> usize {
        lock(&self.shared.queue).events.len()
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<Event> {
        lock(&self.shared.queue).events.iter().cloned().collect()
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        if let Some(thread) = lock(&self.flush_thread).take() {
            thread.stop();
        }
    }
}

impl Shared {
    fn cap(&self) -> usize {
        self.config.max_pending_events.saturating_mul(2)
    }

    /// Drop the oldest events past the cap.
    fn evict_overflow(&self, queue: &mut EventQueue) {
        let cap = self.cap();
        if queue.events.len() > cap {
            let dropped = queue.events.len() - cap;
            queue.events.drain(..dropped);
            log::warn!(target: "gofeatureflag", dropped, cap; "event buffer overflow, dropped oldest events");
        }
    }

    /// Publish from the immediate flush thread, then allow the next immediate flush.
    fn publish_immediate(&self) {
        let _clear_flag = ClearImmediateFlush(self);
        self.publish();
    }

    /// Drain the buffer and send it. On failure, the batch goes back in front of the buffer.
    fn publish(&self) {
        let batch: Vec<Event> = {
            let mut queue = lock(&self.queue);
            if queue.events.is_empty() {
                return;
            }
            queue.events.drain(..).collect()
        };

        log::debug!(target: "gofeatureflag", events = batch.len(); "publishing events");
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.api.send_events(&batch, &self.metadata)
        }))
        .unwrap_or_else(|_| Err(Error::DataCollector("collector panicked".to_owned())));

        if let Err(err) = result {
            log::warn!(target: "gofeatureflag",
                events = batch.len();
                "error publishing events, re-queuing them: {}", err);
            let mut queue = lock(&self.queue);
            for event in batch.into_iter().rev() {
                queue.events.push_front(event);
            }
            self.evict_overflow(&mut queue);
        }
    }
}

/// Clears `immediate_flush_scheduled` when an immediate flush finishes, whichever way it
/// finishes.
struct ClearImmediateFlush<'a>(&'a Shared);

impl Drop for ClearImmediateFlush<'_> {
    fn drop(&mut self) {
        lock(&self.0.queue).immediate_flush_scheduled = false;
    }
}

// A panicking collector must not make the buffer unusable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Condvar, Mutex,
        },
        time::{Duration, Instant},
    };

    use serde_json::Map;

    use crate::{
        api::CollectorApi,
        events::{Event, ExporterMetadata, FeatureEvent},
        test_utils::RecordingCollector,
        Error, Result,
    };

    use super::{EventPublisher, EventPublisherConfig};

    fn event(user_key: &str) -> Event {
        Event::Feature(FeatureEvent {
            context_kind: "user".to_owned(),
            user_key: user_key.to_owned(),
            creation_date: 1_700_000_000,
            key: "my-flag".to_owned(),
            variation: "SdkDefault".to_owned(),
            value: true.into(),
            default: false,
            source: FeatureEvent::SOURCE_PROVIDER_CACHE.to_owned(),
            metadata: Map::new(),
        })
    }

    fn config(max_pending_events: usize) -> EventPublisherConfig {
        EventPublisherConfig {
            flush_interval: Duration::from_secs(3600),
            max_pending_events,
            ..EventPublisherConfig::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Fails while `failing` is set.
    struct FlakyCollector {
        failing: Mutex<bool>,
        attempts: AtomicUsize,
        delivered: RecordingCollector,
    }

    impl CollectorApi for FlakyCollector {
        fn send_events(&self, events: &[Event], metadata: &ExporterMetadata) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if *self.failing.lock().unwrap() {
                return Err(Error::DataCollector("collector down".to_owned()));
            }
            self.delivered.send_events(events, metadata)
        }
    }

    /// Blocks inside `send_events` until released, then succeeds unless `fail` is set.
    #[derive(Default)]
    struct BlockingCollector {
        released: Mutex<bool>,
        release: Condvar,
        fail: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        immediate_calls: AtomicUsize,
        finished: AtomicUsize,
    }

    impl BlockingCollector {
        fn release(&self) {
            *self.released.lock().unwrap() = true;
            self.release.notify_all();
        }
    }

    impl CollectorApi for BlockingCollector {
        fn send_events(&self, _events: &[Event], _metadata: &ExporterMetadata) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if std::thread::current().name() == Some("gofeatureflag-immediate-flush") {
                self.immediate_calls.fetch_add(1, Ordering::SeqCst);
            }
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

            let mut released = self.released.lock().unwrap();
            while !*released {
                released = self.release.wait(released).unwrap();
            }
            drop(released);

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::DataCollector("collector down".to_owned()));
            }
            Ok(())
        }
    }

    struct PanickingCollector;

    impl CollectorApi for PanickingCollector {
        fn send_events(&self, _events: &[Event], _metadata: &ExporterMetadata) -> Result<()> {
            panic!("collector exploded");
        }
    }

    #[test]
    fn buffer_cap_keeps_most_recent_events() {
        // Collector blocks forever so the immediate flush cannot drain the buffer.
        let collector = Arc::new(BlockingCollector::default());
        let publisher = EventPublisher::new(collector.clone(), config(5), Map::new());

        // The first 5 events trigger an immediate flush that drains them and blocks.
        for i in 0..5 {
            publisher.add_event(event(&format!("u{i}")));
        }
        assert!(wait_until(|| collector.calls.load(Ordering::SeqCst) == 1));

        for i in 5..20 {
            publisher.add_event(event(&format!("u{i}")));
        }

        let pending: Vec<String> = publisher
            .snapshot()
            .iter()
            .map(|event| event.user_key().to_owned())
            .collect();
        let expected: Vec<String> = (10..20).map(|i| format!("u{i}")).collect();
        assert_eq!(pending, expected);

        collector.release();
    }

    #[test]
    fn buffer_cap_applies_without_running_flush() {
        let collector = Arc::new(BlockingCollector::default());
        let publisher = EventPublisher::new(collector.clone(), config(5), Map::new());
        // Pretend an immediate flush is already running so none is started.
        super::lock(&publisher.shared.queue).immediate_flush_scheduled = true;

        for i in 0..15 {
            publisher.add_event(event(&format!("u{i}")));
        }

        let pending = publisher.snapshot();
        assert_eq!(pending.len(), 10);
        assert_eq!(pending[0].user_key(), "u5");
        assert_eq!(pending[9].user_key(), "u14");
        assert_eq!(collector.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn only_one_immediate_flush_while_collector_is_slow() {
        let collector = Arc::new(BlockingCollector::default());
        let publisher = EventPublisher::new(collector.clone(), config(3), Map::new());
        publisher.start().unwrap();

        for i in 0..3 {
            publisher.add_event(event(&format!("u{i}")));
        }
        assert!(wait_until(|| collector.calls.load(Ordering::SeqCst) == 1));

        for i in 0..10 {
            publisher.add_event(event(&format!("v{i}")));
        }
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(collector.max_in_flight.load(Ordering::SeqCst), 1);

        collector.release();
        publisher.stop().unwrap();
        assert_eq!(publisher.pending_events(), 0);
    }

    #[test]
    fn periodic_flush_does_not_allow_second_immediate_flush() {
        let collector = Arc::new(BlockingCollector::default());
        let publisher = EventPublisher::new(
            collector.clone(),
            EventPublisherConfig {
                flush_interval: Duration::from_millis(30),
                ..config(3)
            },
            Map::new(),
        );
        publisher.start().unwrap();

        for i in 0..3 {
            publisher.add_event(event(&format!("u{i}")));
        }
        assert!(wait_until(|| collector.calls.load(Ordering::SeqCst) == 1));

        // Periodic ticks run against an empty buffer while the immediate flush is blocked.
        std::thread::sleep(Duration::from_millis(80));
        for i in 0..3 {
            publisher.add_event(event(&format!("v{i}")));
        }
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(collector.immediate_calls.load(Ordering::SeqCst), 1);

        collector.release();
        publisher.stop().unwrap();
        assert_eq!(publisher.pending_events(), 0);
    }

    #[test]
    fn requeued_batch_respects_buffer_cap() {
        let collector = Arc::new(BlockingCollector::default());
        collector.fail.store(true, Ordering::SeqCst);
        let publisher = EventPublisher::new(collector.clone(), config(5), Map::new());

        for i in 0..5 {
            publisher.add_event(event(&format!("u{i}")));
        }
        assert!(wait_until(|| collector.calls.load(Ordering::SeqCst) == 1));
        for i in 5..15 {
            publisher.add_event(event(&format!("u{i}")));
        }

        collector.release();
        assert!(wait_until(|| {
            collector.finished.load(Ordering::SeqCst) == 1
                && !super::lock(&publisher.shared.queue).immediate_flush_scheduled
        }));

        let pending: Vec<String> = publisher
            .snapshot()
            .iter()
            .map(|event| event.user_key().to_owned())
            .collect();
        let expected: Vec<String> = (5..15).map(|i| format!("u{i}")).collect();
        assert_eq!(pending, expected);
    }

    #[test]
    fn panicking_collector_requeues_batch() {
        let publisher = EventPublisher::new(Arc::new(PanickingCollector), config(100), Map::new());

        publisher.add_event(event("u0"));
        publisher.add_event(event("u1"));
        publisher.shared.publish();

        let pending: Vec<String> = publisher
            .snapshot()
            .iter()
            .map(|event| event.user_key().to_owned())
            .collect();
        assert_eq!(pending, ["u0", "u1"]);
    }

    #[test]
    fn failed_publish_requeues_batch_in_front() {
        let collector = Arc::new(FlakyCollector {
            failing: Mutex::new(true),
            attempts: AtomicUsize::new(0),
            delivered: RecordingCollector::default(),
        });
        let publisher = EventPublisher::new(collector.clone(), config(100), Map::new());

        publisher.add_event(event("u0"));
        publisher.add_event(event("u1"));
        publisher.shared.publish();
        assert_eq!(collector.attempts.load(Ordering::SeqCst), 1);

        publisher.add_event(event("u2"));
        let pending: Vec<String> = publisher
            .snapshot()
            .iter()
            .map(|event| event.user_key().to_owned())
            .collect();
        assert_eq!(pending, ["u0", "u1", "u2"]);

        *collector.failing.lock().unwrap() = false;
        publisher.shared.publish();

        assert_eq!(collector.delivered.sent_user_keys(), ["u0", "u1", "u2"]);
        assert_eq!(publisher.pending_events(), 0);
    }

    #[test]
    fn failed_publish_clears_immediate_flush_flag() {
        let collector = Arc::new(FlakyCollector {
            failing: Mutex::new(true),
            attempts: AtomicUsize::new(0),
            delivered: RecordingCollector::default(),
        });
        let publisher = EventPublisher::new(collector.clone(), config(2), Map::new());

        publisher.add_event(event("u0"));
        publisher.add_event(event("u1"));
        assert!(wait_until(|| {
            collector.attempts.load(Ordering::SeqCst) == 1
                && !super::lock(&publisher.shared.queue).immediate_flush_scheduled
        }));

        // The re-queued batch is still above the threshold, so the next event flushes again.
        publisher.add_event(event("u2"));
        assert!(wait_until(|| collector.attempts.load(Ordering::SeqCst) == 2));
        assert!(publisher.pending_events() <= 4);
    }

    #[test]
    fn stop_flushes_remaining_events() {
        let collector = Arc::new(RecordingCollector::default());
        let publisher = EventPublisher::new(collector.clone(), config(100), Map::new());
        publisher.start().unwrap();

        publisher.add_event(event("u0"));
        publisher.add_event(event("u1"));
        publisher.stop().unwrap();

        assert_eq!(collector.sent_user_keys(), ["u0", "u1"]);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let collector = Arc::new(RecordingCollector::default());
        let publisher = EventPublisher::new(collector.clone(), config(100), Map::new());

        publisher.start().unwrap();
        publisher.start().unwrap();
        publisher.add_event(event("u0"));
        publisher.stop().unwrap();
        publisher.stop().unwrap();

        assert_eq!(collector.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn periodic_flush_sends_events() {
        let collector = Arc::new(RecordingCollector::default());
        let publisher = EventPublisher::new(
            collector.clone(),
            EventPublisherConfig {
                flush_interval: Duration::from_millis(20),
                ..config(100)
            },
            Map::new(),
        );
        publisher.start().unwrap();

        publisher.add_event(event("u0"));

        assert!(wait_until(|| collector.sent_user_keys() == ["u0"]));
        publisher.stop().unwrap();
    }
}
