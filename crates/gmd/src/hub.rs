//! Multi-channel publish/subscribe with heartbeat-based eviction.
//!
//! Each subscriber owns a bounded queue; publishers drop the oldest entry on
//! overflow and never block. A background heartbeat pings every subscription
//! and closes the ones that stop draining within the pong deadline.

use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gm_core::config::HubConfig;
use gm_core::events::{GmEvent, LogRecord, TeamEvent};

pub const CHANNEL_STATUS: &str = "status";
pub const CHANNEL_LOGS: &str = "logs";
pub const CHANNEL_TEAMS: &str = "teams";
pub const CHANNEL_GM: &str = "gm";

const PING_TYPE: &str = "ping";

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SubscriptionShared {
    channel: String,
    capacity: usize,
    queue: Mutex<VecDeque<Value>>,
    available: Condvar,
    closed: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped: AtomicU64,
}

impl SubscriptionShared {
    fn enqueue(&self, value: Value) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut queue = lock(&self.queue);
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(value);
        drop(queue);
        self.available.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }
}

/// Receiving half handed to a subscriber. Dropping it closes the
/// subscription.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Messages dropped on the floor because this subscriber fell behind.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Acknowledge liveness. `recv_timeout` does this implicitly whenever it
    /// consumes a heartbeat ping.
    pub fn pong(&self) {
        *lock(&self.shared.last_pong) = Instant::now();
    }

    /// Blocking receive with a deadline. Heartbeat pings are acknowledged
    /// and swallowed; `None` means timeout or a closed subscription.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        let mut queue = lock(&self.shared.queue);
        loop {
            while let Some(value) = queue.pop_front() {
                if is_ping(&value) {
                    drop(queue);
                    self.pong();
                    queue = lock(&self.shared.queue);
                    continue;
                }
                return Some(value);
            }

            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _timeout) = self
                .shared
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
    }

    pub fn try_recv(&self) -> Option<Value> {
        self.recv_timeout(Duration::from_millis(0))
    }

    /// Stop receiving. Publishers skip closed subscriptions; the heartbeat
    /// prunes them from their channel.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.close();
    }
}

fn is_ping(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some(PING_TYPE)
}

struct HeartbeatHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct HubInner {
    config: HubConfig,
    channels: Mutex<HashMap<String, Vec<Arc<SubscriptionShared>>>>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl HubInner {
    fn prune_closed(&self) {
        let mut channels = lock(&self.channels);
        for subscribers in channels.values_mut() {
            subscribers.retain(|shared| !shared.closed.load(Ordering::SeqCst));
        }
        channels.retain(|_, subscribers| !subscribers.is_empty());
    }
}

/// Cheaply cloneable handle to the process-wide hub.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                channels: Mutex::new(HashMap::new()),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self, channel: &str) -> Subscription {
        let shared = Arc::new(SubscriptionShared {
            channel: channel.to_string(),
            capacity: self.inner.config.queue_capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            last_pong: Mutex::new(Instant::now()),
            dropped: AtomicU64::new(0),
        });

        lock(&self.inner.channels)
            .entry(channel.to_string())
            .or_default()
            .push(Arc::clone(&shared));

        Subscription { shared }
    }

    /// Fan a payload out to every live subscriber on the channel. Never
    /// blocks on slow consumers.
    pub fn publish(&self, channel: &str, payload: Value) {
        let subscribers: Vec<Arc<SubscriptionShared>> = {
            let channels = lock(&self.inner.channels);
            match channels.get(channel) {
                Some(subscribers) => subscribers.clone(),
                None => return,
            }
        };

        for shared in subscribers {
            shared.enqueue(payload.clone());
        }
    }

    pub fn publish_gm(&self, event: &GmEvent) {
        if let Ok(value) = serde_json::to_value(event) {
            self.publish(CHANNEL_GM, value);
        }
    }

    pub fn publish_team(&self, event: &TeamEvent) {
        if let Ok(value) = serde_json::to_value(event) {
            self.publish(CHANNEL_TEAMS, value);
        }
    }

    pub fn publish_log(&self, record: &LogRecord) {
        if let Ok(value) = serde_json::to_value(record) {
            self.publish(CHANNEL_LOGS, value);
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.inner.channels)
            .get(channel)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|shared| !shared.closed.load(Ordering::SeqCst))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Start the background heartbeat. Idempotent.
    pub fn start_heartbeat(&self) {
        let mut slot = lock(&self.inner.heartbeat);
        if slot.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let inner = Arc::clone(&self.inner);
        let stop_flag = Arc::clone(&stop);
        let thread = thread::spawn(move || heartbeat_loop(inner, stop_flag));
        *slot = Some(HeartbeatHandle { stop, thread });
    }

    pub fn stop_heartbeat(&self) {
        let handle = lock(&self.inner.heartbeat).take();
        if let Some(handle) = handle {
            handle.stop.store(true, Ordering::SeqCst);
            let _ = handle.thread.join();
        }
    }
}

fn heartbeat_loop(inner: Arc<HubInner>, stop: Arc<AtomicBool>) {
    let interval = Duration::from_secs(inner.config.heartbeat_interval_secs.max(1));
    let pong_deadline = Duration::from_secs(inner.config.heartbeat_timeout_secs.max(1));
    let tick = Duration::from_millis(25);

    while !stop.load(Ordering::SeqCst) {
        if !sleep_interruptible(interval, &stop, tick) {
            return;
        }

        let subscribers: Vec<Arc<SubscriptionShared>> = {
            let channels = lock(&inner.channels);
            channels.values().flatten().cloned().collect()
        };
        if subscribers.is_empty() {
            continue;
        }

        let ping_sent = Instant::now();
        for shared in &subscribers {
            shared.enqueue(json!({ "type": PING_TYPE }));
        }

        if !sleep_interruptible(pong_deadline, &stop, tick) {
            return;
        }

        for shared in &subscribers {
            let last_pong = *lock(&shared.last_pong);
            if last_pong < ping_sent {
                shared.close();
            }
        }
        inner.prune_closed();
    }
}

fn sleep_interruptible(total: Duration, stop: &AtomicBool, tick: Duration) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(tick.min(deadline - Instant::now()));
    }
    !stop.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gm_core::events::{GmEvent, TeamStream};
    use gm_core::state::ProjectPhase;
    use gm_core::types::{ProjectId, SessionId};

    fn test_config(capacity: usize) -> HubConfig {
        HubConfig {
            heartbeat_interval_secs: 1,
            heartbeat_timeout_secs: 1,
            queue_capacity: capacity,
        }
    }

    #[test]
    fn publish_reaches_subscribers_on_the_same_channel_only() {
        let hub = EventHub::new(test_config(8));
        let gm_sub = hub.subscribe(CHANNEL_GM);
        let teams_sub = hub.subscribe(CHANNEL_TEAMS);

        hub.publish_gm(&GmEvent::PhaseChange {
            project_id: ProjectId::new("P1"),
            phase: ProjectPhase::Waiting,
        });

        let value = gm_sub
            .recv_timeout(Duration::from_millis(500))
            .expect("gm event");
        assert_eq!(value["type"], "phase_change");
        assert!(teams_sub.try_recv().is_none());
    }

    #[test]
    fn slow_subscriber_drops_oldest_without_blocking_publisher() {
        let hub = EventHub::new(test_config(2));
        let sub = hub.subscribe(CHANNEL_TEAMS);

        for index in 0..5 {
            hub.publish_team(&gm_core::events::TeamEvent::line(
                SessionId::new("S1"),
                TeamStream::Stdout,
                format!("line {index}"),
            ));
        }

        // Only the two newest survive.
        let first = sub.recv_timeout(Duration::from_millis(100)).expect("first");
        let second = sub
            .recv_timeout(Duration::from_millis(100))
            .expect("second");
        assert_eq!(first["data"], "line 3");
        assert_eq!(second["data"], "line 4");
        assert!(sub.try_recv().is_none());
        assert_eq!(sub.dropped_count(), 3);
    }

    #[test]
    fn recv_timeout_returns_none_when_nothing_arrives() {
        let hub = EventHub::new(test_config(8));
        let sub = hub.subscribe(CHANNEL_LOGS);
        let started = Instant::now();
        assert!(sub.recv_timeout(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn dropping_subscription_removes_it_from_the_channel() {
        let hub = EventHub::new(test_config(8));
        let sub = hub.subscribe(CHANNEL_GM);
        assert_eq!(hub.subscriber_count(CHANNEL_GM), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(CHANNEL_GM), 0);
    }

    #[test]
    fn heartbeat_evicts_subscriber_that_stops_draining() {
        let hub = EventHub::new(test_config(8));
        let idle = hub.subscribe(CHANNEL_GM);
        hub.start_heartbeat();

        // Never drain: the ping sits unacknowledged past the pong deadline.
        let deadline = Instant::now() + Duration::from_secs(10);
        while !idle.is_closed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(idle.is_closed(), "idle subscriber should be evicted");

        hub.stop_heartbeat();
    }

    #[test]
    fn heartbeat_keeps_draining_subscriber_alive() {
        let hub = EventHub::new(test_config(8));
        let active = hub.subscribe(CHANNEL_GM);
        hub.start_heartbeat();

        // Drain (and thereby pong) for a few heartbeat cycles.
        let until = Instant::now() + Duration::from_millis(3500);
        while Instant::now() < until {
            let _ = active.recv_timeout(Duration::from_millis(100));
            assert!(!active.is_closed(), "draining subscriber must stay alive");
        }

        hub.stop_heartbeat();
    }

    #[test]
    fn explicit_close_stops_reception() {
        let hub = EventHub::new(test_config(8));
        let sub = hub.subscribe(CHANNEL_GM);
        sub.close();
        hub.publish(CHANNEL_GM, json!({"type": "x"}));
        assert!(sub.recv_timeout(Duration::from_millis(50)).is_none());
        assert!(sub.is_closed());
    }

    #[test]
    fn publish_to_unknown_channel_is_a_no_op() {
        let hub = EventHub::new(test_config(8));
        hub.publish("nobody-listening", json!({"type": "x"}));
    }
}
