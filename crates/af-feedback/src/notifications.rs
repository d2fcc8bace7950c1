//! NotificationQueue - bounded, coalescing user notifications
//!
//! - Each entry has its own auto-dismiss timer
//! - A message identical to the newest entry bumps its repeat count and
//!   restarts its timer instead of stacking
//! - When full, the oldest timed entry is evicted with an explicit
//!   notification:dismissed event; nothing is dropped silently. Entries
//!   without a duration go only when every entry lacks one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use af_common::{ApiEvent, ClassifiedError, DismissReason, ErrorKind, EventBus, NoticeKind};
use af_config::NotificationConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";

/// A button offered alongside a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoticeAction {
    pub label: String,
    /// Opaque identifier the UI maps to behaviour, e.g. a route
    pub action: String,
}

impl NoticeAction {
    pub fn new(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: u64,
    pub kind: NoticeKind,
    pub message: String,
    pub actions: Vec<NoticeAction>,
    /// `None` means the notification stays until dismissed
    pub duration: Option<Duration>,
    /// How many times this message was pushed back to back
    pub repeat: u32,
    pub created_at: DateTime<Utc>,
}

struct Slot {
    notification: Notification,
    /// Bumped whenever the timer restarts
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct QueueState {
    slots: VecDeque<Slot>,
    next_id: u64,
}

struct Inner {
    state: Mutex<QueueState>,
    events: EventBus,
    config: NotificationConfig,
}

#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<Inner>,
}

impl NotificationQueue {
    pub fn new(events: EventBus) -> Self {
        Self::from_config(NotificationConfig::default(), events)
    }

    pub fn from_config(config: NotificationConfig, events: EventBus) -> Self {
        let config = NotificationConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    slots: VecDeque::new(),
                    next_id: 1,
                }),
                events,
                config,
            }),
        }
    }

    /// Enqueue a notification and return its id. A repeat of the newest
    /// message returns that entry's id.
    pub fn push(
        &self,
        kind: NoticeKind,
        message: impl Into<String>,
        actions: Vec<NoticeAction>,
        duration: Option<Duration>,
    ) -> u64 {
        let message = message.into();
        let mut state = self.inner.state.lock();

        if let Some(newest) = state.slots.back_mut() {
            if newest.notification.kind == kind && newest.notification.message == message {
                newest.notification.repeat += 1;
                newest.notification.duration = duration;
                newest.epoch += 1;
                newest.stop_timer();
                let id = newest.notification.id;
                let epoch = newest.epoch;
                newest.timer = duration.map(|d| self.spawn_timer(id, epoch, d));

                debug!(id, repeat = newest.notification.repeat, "Coalesced notification");
                self.inner.events.emit(ApiEvent::NotificationShown {
                    id,
                    kind,
                    message,
                    repeat: newest.notification.repeat,
                });
                return id;
            }
        }

        while state.slots.len() >= self.inner.config.capacity {
            let victim = state
                .slots
                .iter()
                .position(|slot| slot.notification.duration.is_some())
                .unwrap_or(0);
            let Some(mut oldest) = state.slots.remove(victim) else { break };
            oldest.stop_timer();
            debug!(id = oldest.notification.id, "Evicting oldest notification");
            self.inner.events.emit(ApiEvent::NotificationDismissed {
                id: oldest.notification.id,
                reason: DismissReason::Evicted,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        let timer = duration.map(|d| self.spawn_timer(id, 0, d));
        state.slots.push_back(Slot {
            notification: Notification {
                id,
                kind,
                message: message.clone(),
                actions,
                duration,
                repeat: 1,
                created_at: Utc::now(),
            },
            epoch: 0,
            timer,
        });

        self.inner.events.emit(ApiEvent::NotificationShown {
            id,
            kind,
            message,
            repeat: 1,
        });
        id
    }

    pub fn success(&self, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Success, message, Vec::new(), Some(self.default_duration()))
    }

    pub fn info(&self, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Info, message, Vec::new(), Some(self.default_duration()))
    }

    pub fn warning(&self, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Warning, message, Vec::new(), Some(self.default_duration()))
    }

    pub fn error(&self, message: impl Into<String>) -> u64 {
        self.push(NoticeKind::Error, message, Vec::new(), Some(self.error_duration()))
    }

    /// Show a surfaced request failure. Aborted requests are never shown.
    pub fn report(&self, error: &ClassifiedError) -> Option<u64> {
        if error.kind == ErrorKind::Aborted {
            return None;
        }
        let (kind, duration) = match error.kind {
            ErrorKind::Validation | ErrorKind::RateLimited | ErrorKind::Network => {
                (NoticeKind::Warning, self.default_duration())
            }
            _ => (NoticeKind::Error, self.error_duration()),
        };
        Some(self.push(kind, error.user_message.clone(), Vec::new(), Some(duration)))
    }

    /// Tell the user their session ended. Without a login route the
    /// notification stays until dismissed.
    pub fn report_session_expired(&self, login_route: Option<&str>) -> u64 {
        match login_route {
            Some(route) => self.push(
                NoticeKind::Warning,
                SESSION_EXPIRED_MESSAGE,
                vec![NoticeAction::new("Sign in", route)],
                Some(self.error_duration()),
            ),
            None => {
                warn!("Session expired with no login route available");
                self.push(NoticeKind::Error, SESSION_EXPIRED_MESSAGE, Vec::new(), None)
            }
        }
    }

    pub fn dismiss(&self, id: u64) -> bool {
        self.remove(id, None, DismissReason::Manual)
    }

    /// Dismiss everything, returning how many entries were removed
    pub fn clear(&self) -> usize {
        let drained: Vec<Slot> = self.inner.state.lock().slots.drain(..).collect();
        let removed = drained.len();
        for mut slot in drained {
            slot.stop_timer();
            self.inner.events.emit(ApiEvent::NotificationDismissed {
                id: slot.notification.id,
                reason: DismissReason::Cleared,
            });
        }
        if removed > 0 {
            debug!(removed, "Cleared notifications");
        }
        removed
    }

    pub fn entries(&self) -> Vec<Notification> {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .map(|s| s.notification.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn default_duration(&self) -> Duration {
        Duration::from_millis(self.inner.config.default_duration_ms)
    }

    fn error_duration(&self) -> Duration {
        Duration::from_millis(self.inner.config.error_duration_ms)
    }

    /// Remove `id`, optionally only if its timer epoch still matches
    fn remove(&self, id: u64, epoch: Option<u64>, reason: DismissReason) -> bool {
        let mut state = self.inner.state.lock();
        let Some(pos) = state.slots.iter().position(|s| s.notification.id == id) else {
            return false;
        };
        if let Some(epoch) = epoch {
            if state.slots[pos].epoch != epoch {
                return false;
            }
        }
        if let Some(mut slot) = state.slots.remove(pos) {
            if reason != DismissReason::Timeout {
                slot.stop_timer();
            }
        }
        drop(state);

        debug!(id, reason = ?reason, "Notification dismissed");
        self.inner
            .events
            .emit(ApiEvent::NotificationDismissed { id, reason });
        true
    }

    fn spawn_timer(&self, id: u64, epoch: u64, after: Duration) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            queue.remove(id, Some(epoch), DismissReason::Timeout);
        })
    }
}

/// Route surfaced failures from the event bus into `queue`.
///
/// api:requestFailed becomes a notification (Authentication failures as a
/// session-expired notice) and auth:tokenExpired posts the session notice.
pub fn spawn_error_reporter(
    queue: NotificationQueue,
    events: &EventBus,
    login_route: Option<String>,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        info!("Error reporter started");
        loop {
            match rx.recv().await {
                Ok(ApiEvent::ApiRequestFailed { error, .. }) => {
                    if error.kind == ErrorKind::Authentication {
                        queue.report_session_expired(login_route.as_deref());
                    } else {
                        queue.report(&error);
                    }
                }
                Ok(ApiEvent::AuthTokenExpired) => {
                    queue.report_session_expired(login_route.as_deref());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Error reporter lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Error reporter stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::Receiver;

    fn queue_with(capacity: usize) -> (NotificationQueue, Receiver<ApiEvent>) {
        let events = EventBus::default();
        let rx = events.subscribe();
        let config = NotificationConfig {
            capacity,
            ..NotificationConfig::default()
        };
        (NotificationQueue::from_config(config, events), rx)
    }

    fn drain(rx: &mut Receiver<ApiEvent>) -> Vec<ApiEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_dismiss_per_entry() {
        let (queue, mut rx) = queue_with(5);
        let short = queue.push(NoticeKind::Info, "short", Vec::new(), Some(Duration::from_secs(1)));
        let long = queue.push(NoticeKind::Info, "long", Vec::new(), Some(Duration::from_secs(5)));
        assert_eq!(queue.len(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let ids: Vec<u64> = queue.entries().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![long]);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(queue.is_empty());

        let dismissed: Vec<u64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ApiEvent::NotificationDismissed { id, reason } => {
                    assert_eq!(reason, DismissReason::Timeout);
                    Some(id)
                }
                _ => None,
            })
            .collect();
        assert_eq!(dismissed, vec![short, long]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_duplicates_coalesce_and_reset_timer() {
        let (queue, _rx) = queue_with(5);
        let first = queue.push(NoticeKind::Error, "Server down", Vec::new(), Some(Duration::from_secs(2)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let second = queue.push(NoticeKind::Error, "Server down", Vec::new(), Some(Duration::from_secs(2)));
        assert_eq!(first, second);

        let entries = queue.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].repeat, 2);

        // The original deadline has passed but the timer was restarted
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(queue.len(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_non_consecutive_duplicates_stack() {
        let (queue, _rx) = queue_with(5);
        queue.push(NoticeKind::Info, "a", Vec::new(), None);
        queue.push(NoticeKind::Info, "b", Vec::new(), None);
        queue.push(NoticeKind::Info, "a", Vec::new(), None);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_eviction_is_explicit() {
        let (queue, mut rx) = queue_with(2);
        let a = queue.push(NoticeKind::Info, "a", Vec::new(), None);
        queue.push(NoticeKind::Info, "b", Vec::new(), None);
        queue.push(NoticeKind::Info, "c", Vec::new(), None);

        let messages: Vec<String> = queue.entries().into_iter().map(|n| n.message).collect();
        assert_eq!(messages, vec!["b", "c"]);

        let evicted = drain(&mut rx).into_iter().any(|e| {
            matches!(e, ApiEvent::NotificationDismissed { id, reason: DismissReason::Evicted } if id == a)
        });
        assert!(evicted);
    }

    #[tokio::test]
    async fn test_eviction_keeps_persistent_entries() {
        let (queue, mut rx) = queue_with(2);
        let expired = queue.report_session_expired(None);
        let a = queue.push(NoticeKind::Info, "a", Vec::new(), Some(Duration::from_secs(5)));
        queue.push(NoticeKind::Info, "b", Vec::new(), Some(Duration::from_secs(5)));

        let ids: Vec<u64> = queue.entries().into_iter().map(|n| n.id).collect();
        assert_eq!(ids[0], expired);
        assert_eq!(queue.entries()[1].message, "b");

        let evicted: Vec<u64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ApiEvent::NotificationDismissed { id, reason: DismissReason::Evicted } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(evicted, vec![a]);
    }

    #[tokio::test]
    async fn test_dismiss_and_clear() {
        let (queue, mut rx) = queue_with(5);
        let a = queue.info("a");
        queue.warning("b");
        queue.error("c");

        assert!(queue.dismiss(a));
        assert!(!queue.dismiss(a));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());

        let reasons: Vec<DismissReason> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ApiEvent::NotificationDismissed { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(
            reasons,
            vec![DismissReason::Manual, DismissReason::Cleared, DismissReason::Cleared]
        );
    }

    #[tokio::test]
    async fn test_report_skips_aborted() {
        let (queue, _rx) = queue_with(5);
        assert!(queue.report(&ClassifiedError::aborted("cancelled")).is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_report_uses_user_message() {
        let (queue, _rx) = queue_with(5);
        let err = ClassifiedError::new(ErrorKind::Validation, "name: required")
            .with_user_message("Please check the highlighted fields");
        queue.report(&err);

        let entries = queue.entries();
        assert_eq!(entries[0].kind, NoticeKind::Warning);
        assert_eq!(entries[0].message, "Please check the highlighted fields");

        queue.report(&ClassifiedError::new(ErrorKind::ServerError, "boom"));
        assert_eq!(queue.entries()[1].kind, NoticeKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expired_without_route_persists() {
        let (queue, _rx) = queue_with(5);
        queue.report_session_expired(None);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let entries = queue.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].duration.is_none());
        assert!(entries[0].actions.is_empty());
    }

    #[tokio::test]
    async fn test_session_expired_with_route_offers_action() {
        let (queue, _rx) = queue_with(5);
        queue.report_session_expired(Some("/login"));

        let entries = queue.entries();
        assert_eq!(entries[0].actions, vec![NoticeAction::new("Sign in", "/login")]);
        assert!(entries[0].duration.is_some());
    }
}
