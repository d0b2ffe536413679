//! Poll loop, timer arming, and callback dispatch.

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use switchgrid_core::error::Result;
use switchgrid_core::model::version_stamp;
use switchgrid_store::{KeyValue, KvStore};

use crate::event::{next_occurrence, Event, TIMER_KEY_PREFIX};

/// How often the store is scanned for timer records.
pub const EVENT_SCAN_INTERVAL: Duration = Duration::from_secs(60);
/// Events due within this window of a scan get an in-process timer armed.
pub const EVENT_SCHEDULE_WINDOW: Duration = Duration::from_secs(90);
/// Attempts per firing before the firing is abandoned.
pub const CALLBACK_RETRY_LIMIT: usize = 3;
/// Pause between failed callback attempts.
pub const CALLBACK_RETRY_DELAY: Duration = Duration::from_millis(300);

/// One-shot events more than this far past due are dropped unfired.
fn stale_grace() -> ChronoDuration {
    ChronoDuration::minutes(1)
}

/// Invoked when an event fires, with the event id and its data payload.
pub type EventCallback =
    Arc<dyn Fn(String, serde_json::Map<String, serde_json::Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Scan and window overrides, mostly for tests.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub scan_interval: Duration,
    pub window: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self { scan_interval: EVENT_SCAN_INTERVAL, window: EVENT_SCHEDULE_WINDOW }
    }
}

struct SchedulerInner {
    store: Arc<KvStore>,
    callback: EventCallback,
    window: Duration,
    /// Armed timer tasks by event id. Held across a full scan pass, which
    /// also serializes arming against a timer's self-removal when it fires.
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Durable event scheduler. Owns a background poll loop over the `timer/`
/// store prefix and one spawned timer task per armed event.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Scheduler {
    /// Start the scheduler. The first scan runs before this returns, so
    /// events already due are armed immediately. Must be called from within
    /// a tokio runtime.
    pub fn start(store: Arc<KvStore>, callback: EventCallback, options: SchedulerOptions) -> Arc<Self> {
        let inner = Arc::new(SchedulerInner {
            store,
            callback,
            window: options.window,
            timers: Mutex::new(HashMap::new()),
        });
        inner.poll();

        let scheduler = Arc::new(Self {
            inner: inner.clone(),
            poll_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.scan_interval);
            ticker.tick().await; // first tick is immediate, the startup scan covered it
            loop {
                ticker.tick().await;
                inner.poll();
            }
        });
        *scheduler.poll_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        tracing::info!("⏱️ Scheduler started (scan every {:?})", options.scan_interval);
        scheduler
    }

    /// Run one scan pass outside the regular interval.
    pub fn poll_now(&self) {
        self.inner.poll();
    }

    /// Persist an event, stamping a fresh version so a concurrent scan does
    /// not treat it as an external edit.
    pub fn save_event(&self, event: &mut Event) -> Result<()> {
        self.inner.save_event(event)
    }

    /// Number of currently armed timers.
    pub fn armed_count(&self) -> usize {
        self.inner.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop the poll loop. Already armed timers keep running so imminent
    /// firings are not lost; no new scans happen after this returns.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.poll_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        tracing::info!("🔻 Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SchedulerInner {
    fn save_event(&self, event: &mut Event) -> Result<()> {
        event.version = version_stamp();
        let value = serde_json::to_string(event)?;
        self.store
            .set(&KeyValue::new(&format!("{TIMER_KEY_PREFIX}{}", event.id), &value))
    }

    /// One scan pass: arm every due event, cancel timers for edited or
    /// removed events, drop stale one-shots.
    fn poll(self: &Arc<Self>) {
        let records = match self.store.scan_prefix(TIMER_KEY_PREFIX) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("⚠️ Timer scan failed: {e}");
                return;
            }
        };

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let mut active: HashSet<String> = HashSet::new();

        for record in records {
            let mut event: Event = match serde_json::from_str(&record.value) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping malformed timer record {}: {e}", record.key);
                    continue;
                }
            };
            event.id = record
                .key
                .strip_prefix(TIMER_KEY_PREFIX)
                .unwrap_or(&record.key)
                .to_string();

            if timers.contains_key(&event.id) {
                if event.version != 0 {
                    // Still armed and unchanged since we stamped it
                    active.insert(event.id);
                    continue;
                }
                // Edited externally while armed: cancel and rebuild below
                tracing::info!("🔄 Event {} changed externally, re-arming", event.id);
                if let Some(handle) = timers.remove(&event.id) {
                    handle.abort();
                }
            }

            let now = Utc::now();
            if event.recur_mins == 0 && now - event.time > stale_grace() {
                tracing::info!("🗑️ Dropping stale one-shot event {} (was due {})", event.id, event.time);
                if let Err(e) = self.store.delete(&record.key) {
                    tracing::error!("⚠️ Failed to delete stale event {}: {e}", event.id);
                }
                continue;
            }

            let delay = if event.version == 0 {
                let (next, delay) = next_occurrence(now, event.time, event.recur_mins);
                event.time = next;
                if let Err(e) = self.save_event(&mut event) {
                    tracing::error!("⚠️ Failed to claim event {}: {e}", event.id);
                    continue;
                }
                delay
            } else {
                (event.time - now).to_std().unwrap_or(Duration::ZERO)
            };

            if delay > self.window {
                tracing::trace!("Event {} due in {delay:?}, outside window", event.id);
                continue;
            }

            tracing::info!("⏰ Arming event {} to fire in {delay:?}", event.id);
            active.insert(event.id.clone());
            let inner = self.clone();
            let armed = event.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.fire(armed).await;
            });
            timers.insert(event.id, handle);
        }

        // Timers whose store record disappeared
        timers.retain(|id, handle| {
            if active.contains(id) {
                true
            } else {
                tracing::info!("🗑️ Event {id} removed from store, cancelling timer");
                handle.abort();
                false
            }
        });
    }

    async fn fire(self: Arc<Self>, event: Event) {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&event.id);

        tracing::info!("⏰ Firing event {}", event.id);
        let mut result = Ok(());
        for attempt in 1..=CALLBACK_RETRY_LIMIT {
            result = (self.callback)(event.id.clone(), event.data.clone()).await;
            match &result {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Event {} callback attempt {attempt}/{CALLBACK_RETRY_LIMIT} failed: {e}",
                        event.id
                    );
                    if attempt < CALLBACK_RETRY_LIMIT {
                        tokio::time::sleep(CALLBACK_RETRY_DELAY).await;
                    }
                }
            }
        }

        match result {
            Err(e) => {
                tracing::error!("⚠️ Event {} abandoned after {CALLBACK_RETRY_LIMIT} attempts: {e}", event.id);
            }
            Ok(()) => {
                if event.recur_mins != 0 {
                    let mut event = event;
                    let (next, _) = next_occurrence(Utc::now(), event.time, event.recur_mins);
                    event.time = next;
                    if let Err(e) = self.save_event(&mut event) {
                        tracing::error!("⚠️ Failed to reschedule event {}: {e}", event.id);
                    } else {
                        tracing::info!("🔁 Event {} rescheduled for {}", event.id, event.time);
                    }
                }
            }
        }
    }
}
