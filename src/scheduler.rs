//! Delayed, coalescing dispatch of push notifications.
//!
//! Notifications are buffered per (user, context, topic) for a short delay.
//! Each arrival for a buffered target joins that entry and pushes its
//! deadline back, capped at a maximum delay, so a burst is flushed as one
//! group. Identical notifications (same source and payload) within an entry
//! are kept once. A timer thread, started on demand and stopped once the
//! buffer runs empty, flushes due entries and hands each group to the
//! transports of its matching subscriptions.

use crate::config::PushConfig;
use crate::delivery::TransportRegistry;
use crate::error::{PushError, Result};
use crate::registry::RegistryCache;
use crate::types::{NotificationGroupKey, PushMatch, PushNotification};
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Buffered notifications of one (user, context, topic).
struct Pending {
    /// In arrival order, without duplicates.
    notifications: Vec<PushNotification>,
    /// Arrival order of the entry's first notification.
    seq: u64,
    first_seen: Instant,
    deadline: Instant,
}

impl Pending {
    /// Add a notification unless an identical one is already buffered.
    /// Returns false for a duplicate.
    fn push(&mut self, notification: PushNotification) -> bool {
        let duplicate = self.notifications.iter().any(|n| {
            n.source_token == notification.source_token && n.payload == notification.payload
        });
        if !duplicate {
            self.notifications.push(notification);
        }
        !duplicate
    }
}

/// Notifications of one (user, context, topic), in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchGroup {
    pub key: NotificationGroupKey,
    pub notifications: Vec<PushNotification>,
}

struct Timer {
    generation: u64,
    stop: Sender<()>,
}

#[derive(Default)]
struct State {
    buffer: HashMap<NotificationGroupKey, Pending>,
    next_seq: u64,
    next_generation: u64,
    timer: Option<Timer>,
    stopped: bool,
}

/// Counters of a scheduler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Notifications accepted by `handle`.
    pub handled: u64,
    /// Notifications that joined an already buffered entry.
    pub coalesced: u64,
    /// Groups flushed.
    pub dispatched_groups: u64,
    /// Successful transport calls.
    pub delivered: u64,
    /// Groups whose dispatch failed as a whole.
    pub failed_groups: u64,
}

#[derive(Default)]
struct Counters {
    handled: AtomicU64,
    coalesced: AtomicU64,
    dispatched_groups: AtomicU64,
    delivered: AtomicU64,
    failed_groups: AtomicU64,
}

struct Inner {
    delay: Duration,
    max_delay: Duration,
    frequency: Duration,
    cache: Arc<RegistryCache>,
    transports: Arc<dyn TransportRegistry>,
    state: Mutex<State>,
    counters: Counters,
}

/// Buffers notifications and dispatches them after the coalescing delay.
pub struct NotificationScheduler {
    inner: Arc<Inner>,
}

impl NotificationScheduler {
    pub fn new(
        cache: Arc<RegistryCache>,
        transports: Arc<dyn TransportRegistry>,
        config: &PushConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                delay: config.delay,
                max_delay: config.max_delay,
                frequency: config.timer_frequency,
                cache,
                transports,
                state: Mutex::new(State::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Buffer a notification, joining the pending entry of its target and
    /// refreshing that entry's deadline if there is one.
    ///
    /// Starts the flush timer if it is not running. Does nothing once the
    /// scheduler is stopped. Fails only if the timer thread cannot be
    /// started, which stops this scheduler.
    pub fn handle(&self, notification: PushNotification) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.stopped {
            trace!(topic = %notification.topic, "scheduler stopped, dropping notification");
            return Ok(());
        }

        let now = Instant::now();
        let key = notification.group_key();
        inner.counters.handled.fetch_add(1, Ordering::Relaxed);
        match state.buffer.get_mut(&key) {
            Some(pending) => {
                pending.deadline = (now + inner.delay).min(pending.first_seen + inner.max_delay);
                if !pending.push(notification) {
                    trace!(topic = %key.topic, "identical notification already buffered");
                }
                inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.buffer.insert(
                    key,
                    Pending {
                        notifications: vec![notification],
                        seq,
                        first_seen: now,
                        deadline: now + inner.delay.min(inner.max_delay),
                    },
                );
            }
        }

        if state.timer.is_none() {
            if let Err(e) = Inner::start_timer(inner, &mut state) {
                error!(code = %e.code(), error = %e, "cannot start notification flush timer");
                state.stopped = true;
                state.buffer.clear();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Cancel the timer and discard all buffered notifications.
    ///
    /// Later calls to [`handle`](Self::handle) are ignored.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        let dropped: usize = state.buffer.values().map(|p| p.notifications.len()).sum();
        state.buffer.clear();
        if let Some(timer) = state.timer.take() {
            let _ = timer.stop.try_send(());
        }
        debug!(dropped, "notification scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    /// Number of buffered notifications.
    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .buffer
            .values()
            .map(|p| p.notifications.len())
            .sum()
    }

    pub fn is_timer_running(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            handled: c.handled.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            dispatched_groups: c.dispatched_groups.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed_groups: c.failed_groups.load(Ordering::Relaxed),
        }
    }

    /// Flush everything due at `now` on the calling thread, regardless of
    /// the timer. Returns the number of dispatched groups.
    pub fn flush_due(&self, now: Instant) -> usize {
        let (groups, _) = self.inner.check_and_flush(None, now);
        groups
    }
}

impl Drop for NotificationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn start_timer(this: &Arc<Self>, state: &mut State) -> Result<()> {
        let generation = state.next_generation;
        state.next_generation += 1;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let inner = Arc::clone(this);
        let frequency = this.frequency;

        thread::Builder::new()
            .name("push-notification-flush".to_string())
            .spawn(move || run_timer(inner, generation, frequency, stop_rx))
            .map_err(|e| PushError::scheduler(format!("spawning flush timer: {e}")))?;

        state.timer = Some(Timer {
            generation,
            stop: stop_tx,
        });
        trace!(generation, "notification flush timer started");
        Ok(())
    }

    /// Take due entries under the lock, then dispatch them without it.
    ///
    /// With `generation` set, the call comes from that timer; the returned
    /// flag tells it whether to keep running.
    fn check_and_flush(&self, generation: Option<u64>, now: Instant) -> (usize, bool) {
        let (due, keep_running) = {
            let mut state = self.state.lock();
            if state.stopped {
                return (0, false);
            }
            if let Some(generation) = generation {
                if state.timer.as_ref().map(|t| t.generation) != Some(generation) {
                    return (0, false);
                }
            }

            let due = take_due(&mut state.buffer, now);
            let keep_running = generation.is_none() || !state.buffer.is_empty();
            if !keep_running {
                state.timer = None;
            }
            (due, keep_running)
        };

        let groups = due.len();
        for (key, pending) in due {
            self.dispatch_guarded(&DispatchGroup {
                key,
                notifications: pending.notifications,
            });
        }
        (groups, keep_running)
    }

    /// Dispatch one group; failures and panics stay within the group.
    fn dispatch_guarded(&self, group: &DispatchGroup) {
        self.counters.dispatched_groups.fetch_add(1, Ordering::Relaxed);
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(group)));
        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "dispatch panicked".to_string(),
        };
        self.counters.failed_groups.fetch_add(1, Ordering::Relaxed);
        error!(
            user_id = group.key.user_id,
            context_id = group.key.context_id,
            topic = %group.key.topic,
            error = %failure,
            "failed to dispatch push notifications"
        );
    }

    fn dispatch(&self, group: &DispatchGroup) -> Result<()> {
        let key = &group.key;
        let index = self.cache.get_index_for(key.user_id, key.context_id)?;
        let hits = index.interested_subscriptions(None, &key.topic);
        if hits.is_empty() {
            trace!(
                user_id = key.user_id,
                context_id = key.context_id,
                topic = %key.topic,
                "no interested subscriptions"
            );
            return Ok(());
        }

        for (destination, matches) in hits {
            let Some(transport) = self
                .transports
                .get_transport_for(&destination.client, &destination.transport_id)
            else {
                warn!(
                    client = %destination.client,
                    transport_id = %destination.transport_id,
                    "no transport available, skipping"
                );
                continue;
            };

            for notification in &group.notifications {
                let targets = without_source(notification, &matches);
                if targets.is_empty() {
                    continue;
                }
                match transport.transport(notification, &targets) {
                    Ok(()) => {
                        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!(
                            client = %destination.client,
                            transport_id = %destination.transport_id,
                            topic = %notification.topic,
                            code = %e.code(),
                            error = %e,
                            "push transport failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

fn run_timer(inner: Arc<Inner>, generation: u64, frequency: Duration, stop: Receiver<()>) {
    let ticker = crossbeam_channel::tick(frequency);
    loop {
        select! {
            recv(ticker) -> _ => {
                let (_, keep_running) = inner.check_and_flush(Some(generation), Instant::now());
                if !keep_running {
                    break;
                }
            }
            recv(stop) -> _ => break,
        }
    }
    trace!(generation, "notification flush timer finished");
}

/// Remove and return the entries whose deadline has passed, in arrival
/// order of their first notification.
fn take_due(
    buffer: &mut HashMap<NotificationGroupKey, Pending>,
    now: Instant,
) -> Vec<(NotificationGroupKey, Pending)> {
    let keys: Vec<NotificationGroupKey> = buffer
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(k, _)| k.clone())
        .collect();
    let mut due: Vec<(NotificationGroupKey, Pending)> = keys
        .into_iter()
        .filter_map(|k| buffer.remove(&k).map(|p| (k, p)))
        .collect();
    due.sort_by_key(|(_, p)| p.seq);
    due
}

/// Matches other than the subscription the notification originated from.
fn without_source(notification: &PushNotification, matches: &[PushMatch]) -> Vec<PushMatch> {
    match &notification.source_token {
        Some(token) => matches.iter().filter(|m| &m.token != token).cloned().collect(),
        None => matches.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{Transport, TransportMap};
    use crate::events::CacheEventBus;
    use crate::registry::{DurableRegistry, MemoryRegistry, RegistryStore};
    use crate::types::PushSubscription;
    use serde_json::json;

    #[derive(Default)]
    struct Recording {
        id: String,
        calls: Mutex<Vec<(PushNotification, Vec<PushMatch>)>>,
        fail: bool,
    }

    impl Recording {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                ..Default::default()
            })
        }
    }

    impl Transport for Recording {
        fn id(&self) -> &str {
            &self.id
        }

        fn transport(&self, notification: &PushNotification, matches: &[PushMatch]) -> Result<()> {
            if self.fail {
                return Err(PushError::transport("app", &self.id, "gateway down"));
            }
            self.calls
                .lock()
                .push((notification.clone(), matches.to_vec()));
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<MemoryRegistry>,
        transports: Arc<TransportMap>,
        apn: Arc<Recording>,
        scheduler: NotificationScheduler,
        _bus: Arc<CacheEventBus>,
    }

    fn fixture(delay_ms: u64, frequency_ms: u64) -> Fixture {
        let registry = Arc::new(MemoryRegistry::new());
        let bus = Arc::new(CacheEventBus::new());
        let config = PushConfig {
            delay: Duration::from_millis(delay_ms),
            timer_frequency: Duration::from_millis(frequency_ms),
            ..Default::default()
        };
        let cache = RegistryCache::new(registry.clone(), bus.clone(), &config);
        let transports = Arc::new(TransportMap::new());
        let apn = Recording::new("apn");
        transports.register(apn.clone());
        let scheduler = NotificationScheduler::new(cache, transports.clone(), &config);
        Fixture {
            registry,
            transports,
            apn,
            scheduler,
            _bus: bus,
        }
    }

    fn mail(user: i32, n: i64) -> PushNotification {
        PushNotification::new(user, 3, "ox:mail:new").with_payload(json!({ "n": n }))
    }

    const HOUR: u64 = 3_600_000;

    #[test]
    fn test_three_notifications_one_group() {
        let f = fixture(3000, HOUR);
        f.registry
            .register(&PushSubscription::new(7, 3, "app", "apn", "t1").with_topic("ox:mail:*"))
            .unwrap();

        for n in 0..3 {
            f.scheduler.handle(mail(7, n)).unwrap();
        }
        assert_eq!(f.scheduler.pending_count(), 3);

        // Nothing is due before the delay.
        assert_eq!(f.scheduler.flush_due(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(4);
        assert_eq!(f.scheduler.flush_due(later), 1);
        assert_eq!(f.scheduler.pending_count(), 0);

        let calls = f.apn.calls.lock();
        let payloads: Vec<_> = calls.iter().map(|(n, _)| n.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(payloads, vec![0, 1, 2]);
        assert_eq!(calls[0].1[0].matched_topic, "ox:mail:*");
        assert_eq!(f.scheduler.stats().dispatched_groups, 1);
    }

    #[test]
    fn test_equal_notifications_coalesce() {
        let f = fixture(3000, HOUR);
        f.registry
            .register(&PushSubscription::new(7, 3, "app", "apn", "t1").with_topic("ox:mail:new"))
            .unwrap();

        for _ in 0..5 {
            f.scheduler.handle(mail(7, 1)).unwrap();
        }
        assert_eq!(f.scheduler.pending_count(), 1);
        assert_eq!(f.scheduler.stats().coalesced, 4);

        f.scheduler.flush_due(Instant::now() + Duration::from_secs(4));
        assert_eq!(f.apn.calls.lock().len(), 1);
    }

    #[test]
    fn test_refresh_extends_deadline_up_to_max_delay() {
        let f = fixture(3000, HOUR);
        let start = Instant::now();
        f.scheduler.handle(mail(7, 1)).unwrap();
        f.scheduler.handle(mail(7, 1)).unwrap();

        let state = f.scheduler.inner.state.lock();
        let pending = state.buffer.values().next().unwrap();
        assert!(pending.deadline >= start + Duration::from_millis(3000));
        assert!(pending.deadline <= pending.first_seen + Duration::from_millis(10_000));
    }

    #[test]
    fn test_groups_by_user_and_topic() {
        let f = fixture(3000, HOUR);
        for user in [7, 8] {
            f.registry
                .register(&PushSubscription::new(user, 3, "app", "apn", format!("t{user}")).with_topic("*"))
                .unwrap();
        }

        f.scheduler.handle(mail(7, 1)).unwrap();
        f.scheduler.handle(mail(8, 1)).unwrap();
        f.scheduler.handle(PushNotification::new(7, 3, "ox:calendar:new")).unwrap();
        f.scheduler.handle(mail(7, 2)).unwrap();

        assert_eq!(f.scheduler.flush_due(Instant::now() + Duration::from_secs(4)), 3);
        assert_eq!(f.apn.calls.lock().len(), 4);
    }

    #[test]
    fn test_missing_transport_skips_group_only() {
        let f = fixture(3000, HOUR);
        f.registry
            .register(&PushSubscription::new(7, 3, "app", "wns", "t1").with_topic("*"))
            .unwrap();
        f.registry
            .register(&PushSubscription::new(7, 3, "app", "apn", "t2").with_topic("*"))
            .unwrap();

        f.scheduler.handle(mail(7, 1)).unwrap();
        f.scheduler.flush_due(Instant::now() + Duration::from_secs(4));

        let calls = f.apn.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.len(), 1);
        assert_eq!(calls[0].1[0].token, "t2");
        assert_eq!(f.scheduler.stats().failed_groups, 0);
    }

    #[test]
    fn test_failing_transport_does_not_stop_other_groups() {
        let f = fixture(3000, HOUR);
        f.transports.register(Arc::new(Recording {
            id: "broken".into(),
            fail: true,
            ..Default::default()
        }));
        f.registry
            .register(&PushSubscription::new(7, 3, "app", "broken", "t1").with_topic("*"))
            .unwrap();
        f.registry
            .register(&PushSubscription::new(8, 3, "app", "apn", "t2").with_topic("*"))
            .unwrap();

        f.scheduler.handle(mail(7, 1)).unwrap();
        f.scheduler.handle(mail(8, 1)).unwrap();
        assert_eq!(f.scheduler.flush_due(Instant::now() + Duration::from_secs(4)), 2);

        assert_eq!(f.apn.calls.lock().len(), 1);
        assert_eq!(f.scheduler.stats().delivered, 1);
    }

    #[test]
    fn test_source_subscription_excluded() {
        let f = fixture(3000, HOUR);
        f.registry
            .register(&PushSubscription::new(7, 3, "app", "apn", "origin").with_topic("*"))
            .unwrap();
        f.registry
            .register(&PushSubscription::new(7, 3, "app", "apn", "other").with_topic("*"))
            .unwrap();

        f.scheduler
            .handle(mail(7, 1).with_source_token("origin"))
            .unwrap();
        f.scheduler.flush_due(Instant::now() + Duration::from_secs(4));

        let calls = f.apn.calls.lock();
        assert_eq!(calls.len(), 1);
        let tokens: Vec<_> = calls[0].1.iter().map(|m| m.token.as_str()).collect();
        assert_eq!(tokens, vec!["other"]);
    }

    #[test]
    fn test_stop_discards_and_ignores() {
        let f = fixture(3000, HOUR);
        f.scheduler.handle(mail(7, 1)).unwrap();
        assert!(f.scheduler.is_timer_running());

        f.scheduler.stop();
        assert!(f.scheduler.is_stopped());
        assert_eq!(f.scheduler.pending_count(), 0);
        assert!(!f.scheduler.is_timer_running());

        f.scheduler.handle(mail(7, 2)).unwrap();
        assert_eq!(f.scheduler.pending_count(), 0);
        assert_eq!(f.scheduler.flush_due(Instant::now() + Duration::from_secs(4)), 0);
        assert!(f.apn.calls.lock().is_empty());
    }

    #[test]
    fn test_timer_flushes_and_goes_idle() {
        let f = fixture(30, 10);
        f.registry
            .register(&PushSubscription::new(7, 3, "app", "apn", "t1").with_topic("ox:mail:new"))
            .unwrap();

        f.scheduler.handle(mail(7, 1)).unwrap();
        assert!(f.scheduler.is_timer_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.scheduler.is_timer_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!f.scheduler.is_timer_running());
        assert_eq!(f.apn.calls.lock().len(), 1);

        // A new notification restarts the timer.
        f.scheduler.handle(mail(7, 2)).unwrap();
        assert!(f.scheduler.is_timer_running());
    }

    #[test]
    fn test_spaced_arrivals_flush_as_one_group() {
        let f = fixture(300, 20);
        f.registry
            .register(&PushSubscription::new(7, 3, "app", "apn", "t1").with_topic("ox:mail:*"))
            .unwrap();

        // Each arrival lands inside the window opened by the previous one.
        for n in 0..3 {
            if n > 0 {
                thread::sleep(Duration::from_millis(120));
            }
            f.scheduler.handle(mail(7, n)).unwrap();
        }
        assert_eq!(f.scheduler.stats().dispatched_groups, 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.scheduler.is_timer_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(f.scheduler.stats().dispatched_groups, 1);
        let calls = f.apn.calls.lock();
        let payloads: Vec<_> = calls.iter().map(|(n, _)| n.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(payloads, vec![0, 1, 2]);
    }

    /// Registry failing every load of one user.
    struct FailingFor {
        inner: MemoryRegistry,
        user_id: i32,
    }

    impl DurableRegistry for FailingFor {
        fn load_subscriptions_for(&self, user_id: i32, context_id: i32) -> Result<Vec<PushSubscription>> {
            if user_id == self.user_id {
                return Err(PushError::registry(user_id, context_id, "database unavailable"));
            }
            self.inner.load_subscriptions_for(user_id, context_id)
        }
    }

    #[test]
    fn test_failed_group_does_not_block_others() {
        let inner = MemoryRegistry::new();
        for user in [7, 8] {
            inner
                .register(&PushSubscription::new(user, 3, "app", "apn", format!("t{user}")).with_topic("*"))
                .unwrap();
        }
        let config = PushConfig {
            delay: Duration::from_secs(3),
            timer_frequency: Duration::from_millis(HOUR),
            ..Default::default()
        };
        let cache = RegistryCache::new(
            Arc::new(FailingFor { inner, user_id: 7 }),
            Arc::new(CacheEventBus::new()),
            &config,
        );
        let transports = Arc::new(TransportMap::new());
        let apn = Recording::new("apn");
        transports.register(apn.clone());
        let scheduler = NotificationScheduler::new(cache, transports, &config);

        scheduler.handle(mail(7, 1)).unwrap();
        scheduler.handle(mail(8, 1)).unwrap();
        assert_eq!(scheduler.flush_due(Instant::now() + Duration::from_secs(4)), 2);

        let calls = apn.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.user_id, 8);
        let stats = scheduler.stats();
        assert_eq!(stats.dispatched_groups, 2);
        assert_eq!(stats.failed_groups, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_take_due_orders_by_arrival() {
        let now = Instant::now();
        let mut buffer = HashMap::new();
        for (seq, user, late) in [(2u64, 9, false), (0, 7, false), (1, 8, true)] {
            let notification = mail(user, 0);
            buffer.insert(
                notification.group_key(),
                Pending {
                    notifications: vec![notification],
                    seq,
                    first_seen: now,
                    deadline: if late { now + Duration::from_secs(60) } else { now },
                },
            );
        }

        let due = take_due(&mut buffer, now);
        let users: Vec<_> = due.iter().map(|(k, _)| k.user_id).collect();
        assert_eq!(users, vec![7, 9]);
        assert_eq!(buffer.len(), 1);
    }
}
