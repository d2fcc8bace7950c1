//! LoadingStateManager - reference-counted loading indicators
//!
//! Driven explicitly by callers, not by the dispatcher. Overlapping
//! `show`/`hide` pairs under one key keep a single indicator visible:
//! loading:start fires on 0 -> 1 and loading:end on 1 -> 0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use af_common::{ApiEvent, EventBus, LoadingKind};
use af_config::LoadingConfig;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct LoadingOptions {
    pub kind: LoadingKind,
    /// Emit loading:timeout if still visible after this long
    pub timeout: Option<Duration>,
}

impl LoadingOptions {
    pub fn kind(kind: LoadingKind) -> Self {
        Self { kind, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadingPhase {
    Active,
    /// Error visual shown until the grace period ends
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadingSnapshot {
    pub key: String,
    pub refcount: u32,
    pub kind: LoadingKind,
    pub progress: Option<u8>,
    pub status: Option<String>,
    pub phase: LoadingPhase,
}

struct LoadingEntry {
    refcount: u32,
    kind: LoadingKind,
    progress: Option<u8>,
    status: Option<String>,
    phase: LoadingPhase,
    /// Changes whenever the entry is recreated or changes phase, so stale
    /// timers can recognise they no longer apply
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl LoadingEntry {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    entries: Mutex<HashMap<String, LoadingEntry>>,
    events: EventBus,
    default_timeout: Option<Duration>,
    error_grace: Duration,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct LoadingStateManager {
    inner: Arc<Inner>,
}

impl LoadingStateManager {
    pub fn new(events: EventBus) -> Self {
        Self::from_config(&LoadingConfig::default(), events)
    }

    pub fn from_config(config: &LoadingConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                events,
                default_timeout: config.default_timeout_ms.map(Duration::from_millis),
                error_grace: Duration::from_millis(config.error_grace_ms),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Increment the key's count, showing the indicator on the first call.
    /// Returns the new count.
    pub fn show(&self, key: &str, options: LoadingOptions) -> u32 {
        let mut entries = self.inner.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            if entry.phase == LoadingPhase::Active {
                entry.refcount += 1;
                debug!(key, refcount = entry.refcount, "Loading nested");
                return entry.refcount;
            }
            // An error visual is replaced by a fresh indicator
            entry.stop_timer();
        }

        let generation = self.inner.next_generation();
        let timeout = options.timeout.or(self.inner.default_timeout);
        let timer = timeout.map(|after| self.spawn_timeout(key.to_string(), generation, after));

        entries.insert(
            key.to_string(),
            LoadingEntry {
                refcount: 1,
                kind: options.kind,
                progress: None,
                status: None,
                phase: LoadingPhase::Active,
                generation,
                timer,
            },
        );
        debug!(key, kind = ?options.kind, "Loading started");
        self.inner.events.emit(ApiEvent::LoadingStart {
            key: key.to_string(),
            kind: options.kind,
        });
        1
    }

    /// Decrement the key's count, removing the indicator at zero.
    /// Unknown keys and errored keys are left alone. Returns the remaining count.
    pub fn hide(&self, key: &str) -> u32 {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return 0;
        };
        if entry.phase != LoadingPhase::Active {
            return 0;
        }

        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return entry.refcount;
        }

        if let Some(mut entry) = entries.remove(key) {
            entry.stop_timer();
        }
        debug!(key, "Loading ended");
        self.inner.events.emit(ApiEvent::LoadingEnd { key: key.to_string() });
        0
    }

    /// Report determinate progress. `percent` is clamped to 0..=100.
    pub fn update_progress(&self, key: &str, percent: f64, status: Option<&str>) -> bool {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.phase != LoadingPhase::Active {
            return false;
        }

        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        let percent = percent.round() as u8;
        entry.progress = Some(percent);
        entry.status = status.map(String::from);

        self.inner.events.emit(ApiEvent::LoadingProgress {
            key: key.to_string(),
            percent,
            status: entry.status.clone(),
        });
        true
    }

    /// Switch the key to an error visual that clears itself after the grace period
    pub fn error(&self, key: &str, message: &str) {
        let mut entries = self.inner.entries.lock();
        let generation = self.inner.next_generation();
        let timer = self.spawn_grace(key.to_string(), generation);

        match entries.get_mut(key) {
            Some(entry) => {
                entry.stop_timer();
                entry.refcount = 0;
                entry.phase = LoadingPhase::Error;
                entry.status = Some(message.to_string());
                entry.generation = generation;
                entry.timer = Some(timer);
            }
            None => {
                entries.insert(
                    key.to_string(),
                    LoadingEntry {
                        refcount: 0,
                        kind: LoadingKind::default(),
                        progress: None,
                        status: Some(message.to_string()),
                        phase: LoadingPhase::Error,
                        generation,
                        timer: Some(timer),
                    },
                );
            }
        }

        warn!(key, message, "Loading failed");
        self.inner.events.emit(ApiEvent::LoadingError {
            key: key.to_string(),
            message: message.to_string(),
        });
    }

    pub fn is_visible(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn refcount(&self, key: &str) -> u32 {
        self.inner.entries.lock().get(key).map(|e| e.refcount).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<LoadingSnapshot> {
        let entries = self.inner.entries.lock();
        let mut list: Vec<LoadingSnapshot> = entries
            .iter()
            .map(|(key, e)| LoadingSnapshot {
                key: key.clone(),
                refcount: e.refcount,
                kind: e.kind,
                progress: e.progress,
                status: e.status.clone(),
                phase: e.phase,
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    fn spawn_timeout(&self, key: String, generation: u64, after: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let still_active = inner
                .entries
                .lock()
                .get(&key)
                .map(|e| e.generation == generation && e.phase == LoadingPhase::Active)
                .unwrap_or(false);
            if still_active {
                warn!(key = %key, timeout_ms = after.as_millis() as u64, "Loading indicator stuck");
                inner.events.emit(ApiEvent::LoadingTimeout { key });
            }
        })
    }

    fn spawn_grace(&self, key: String, generation: u64) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let grace = self.inner.error_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut entries = inner.entries.lock();
            let expired = entries
                .get(&key)
                .map(|e| e.generation == generation)
                .unwrap_or(false);
            if expired {
                entries.remove(&key);
                drop(entries);
                inner.events.emit(ApiEvent::LoadingEnd { key });
            }
        })
    }
}

impl Inner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<ApiEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_refcount_show_show_hide_hide_hide() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let loading = LoadingStateManager::new(events);

        assert_eq!(loading.show("x", LoadingOptions::default()), 1);
        assert_eq!(loading.show("x", LoadingOptions::default()), 2);
        assert_eq!(loading.hide("x"), 1);
        assert!(loading.is_visible("x"));
        assert_eq!(loading.refcount("x"), 1);

        assert_eq!(loading.hide("x"), 0);
        assert!(!loading.is_visible("x"));

        assert_eq!(loading.hide("x"), 0);
        assert_eq!(loading.refcount("x"), 0);

        assert_eq!(drain(&mut rx), vec!["loading:start", "loading:end"]);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let loading = LoadingStateManager::new(EventBus::default());
        loading.show("users", LoadingOptions::default());
        loading.show("orders", LoadingOptions::kind(LoadingKind::Skeleton));
        loading.hide("users");

        let snapshot = loading.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, "orders");
        assert_eq!(snapshot[0].kind, LoadingKind::Skeleton);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_without_hiding() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let loading = LoadingStateManager::new(events);

        loading.show("export", LoadingOptions::default().with_timeout(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(drain(&mut rx), vec!["loading:start", "loading:timeout"]);
        assert!(loading.is_visible("export"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hide_before_timeout_suppresses_it() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let loading = LoadingStateManager::new(events);

        loading.show("save", LoadingOptions::default().with_timeout(Duration::from_secs(5)));
        loading.hide("save");
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(drain(&mut rx), vec!["loading:start", "loading:end"]);
    }

    #[tokio::test]
    async fn test_progress_is_clamped() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let loading = LoadingStateManager::new(events);

        assert!(!loading.update_progress("upload", 10.0, None));
        loading.show("upload", LoadingOptions::kind(LoadingKind::Progress));
        assert!(loading.update_progress("upload", 150.0, Some("almost")));

        let _ = rx.try_recv();
        match rx.try_recv().unwrap() {
            ApiEvent::LoadingProgress { percent, status, .. } => {
                assert_eq!(percent, 100);
                assert_eq!(status.as_deref(), Some("almost"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        loading.update_progress("upload", -3.0, None);
        assert_eq!(loading.snapshot()[0].progress, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_clears_after_grace() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let config = LoadingConfig {
            default_timeout_ms: None,
            error_grace_ms: 1000,
        };
        let loading = LoadingStateManager::from_config(&config, events);

        loading.show("report", LoadingOptions::default());
        loading.error("report", "Generation failed");
        assert!(loading.is_visible("report"));
        assert_eq!(loading.snapshot()[0].phase, LoadingPhase::Error);
        // hide does not disturb the error visual
        assert_eq!(loading.hide("report"), 0);
        assert!(loading.is_visible("report"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!loading.is_visible("report"));
        assert_eq!(
            drain(&mut rx),
            vec!["loading:start", "loading:error", "loading:end"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_show_after_error_replaces_visual() {
        let loading = LoadingStateManager::new(EventBus::default());
        loading.error("sync", "offline");
        loading.show("sync", LoadingOptions::default());

        tokio::time::sleep(Duration::from_secs(10)).await;
        // The stale grace timer must not remove the new indicator
        assert!(loading.is_visible("sync"));
        assert_eq!(loading.refcount("sync"), 1);
    }
}
