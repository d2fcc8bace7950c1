//! Application-wide event channel
//!
//! Components publish `ApiEvent`s on a shared `EventBus`; UI layers and
//! reporters subscribe and react. Delivery preserves emission order per
//! subscriber. A subscriber that falls behind by more than the channel
//! capacity observes a `Lagged` error from tokio and skips ahead.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::{ClassifiedError, RequestId};

/// Default broadcast buffer size
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Visual style of a loading indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingKind {
    #[default]
    Spinner,
    Progress,
    Skeleton,
    Overlay,
}

/// Severity of a user notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Success,
    Info,
    Warning,
    Error,
}

/// Why a notification left the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DismissReason {
    Timeout,
    Manual,
    Evicted,
    Cleared,
}

#[derive(Debug, Clone)]
pub enum ApiEvent {
    AuthTokenExpired,
    AuthTokenRefreshed,
    AuthForbidden { request_id: RequestId, url: String },
    NetworkOffline,
    NetworkOnline,
    ApiServerError { status: u16, url: String },
    ApiRequestFailed { request_id: RequestId, error: ClassifiedError },
    LoadingStart { key: String, kind: LoadingKind },
    LoadingProgress { key: String, percent: u8, status: Option<String> },
    LoadingEnd { key: String },
    LoadingTimeout { key: String },
    LoadingError { key: String, message: String },
    NotificationShown { id: u64, kind: NoticeKind, message: String, repeat: u32 },
    NotificationDismissed { id: u64, reason: DismissReason },
}

impl ApiEvent {
    /// Stable wire name, `namespace:event`
    pub fn name(&self) -> &'static str {
        match self {
            ApiEvent::AuthTokenExpired => "auth:tokenExpired",
            ApiEvent::AuthTokenRefreshed => "auth:tokenRefreshed",
            ApiEvent::AuthForbidden { .. } => "auth:forbidden",
            ApiEvent::NetworkOffline => "network:offline",
            ApiEvent::NetworkOnline => "network:online",
            ApiEvent::ApiServerError { .. } => "api:serverError",
            ApiEvent::ApiRequestFailed { .. } => "api:requestFailed",
            ApiEvent::LoadingStart { .. } => "loading:start",
            ApiEvent::LoadingProgress { .. } => "loading:progress",
            ApiEvent::LoadingEnd { .. } => "loading:end",
            ApiEvent::LoadingTimeout { .. } => "loading:timeout",
            ApiEvent::LoadingError { .. } => "loading:error",
            ApiEvent::NotificationShown { .. } => "notification:shown",
            ApiEvent::NotificationDismissed { .. } => "notification:dismissed",
        }
    }
}

/// Cloneable handle to the broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ApiEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ApiEvent) {
        trace!(event = event.name(), "Emitting event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApiEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(ApiEvent::NetworkOffline);
        bus.emit(ApiEvent::NetworkOnline);
        bus.emit(ApiEvent::LoadingEnd { key: "users".to_string() });

        assert_eq!(rx.recv().await.unwrap().name(), "network:offline");
        assert_eq!(rx.recv().await.unwrap().name(), "network:online");
        assert_eq!(rx.recv().await.unwrap().name(), "loading:end");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(ApiEvent::AuthTokenExpired);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.clone().subscribe();

        bus.emit(ApiEvent::AuthTokenRefreshed);

        assert_eq!(a.recv().await.unwrap().name(), "auth:tokenRefreshed");
        assert_eq!(b.recv().await.unwrap().name(), "auth:tokenRefreshed");
    }
}
