use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use af_common::{Method, RequestId};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::request::RequestConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestPhase {
    /// Running interceptors or waiting for a scheduler slot
    Queued,
    /// Holding a slot with a transport call outstanding
    InFlight,
    /// Between attempts
    Waiting,
}

impl RequestPhase {
    fn to_u8(self) -> u8 {
        match self {
            RequestPhase::Queued => 0,
            RequestPhase::InFlight => 1,
            RequestPhase::Waiting => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RequestPhase::InFlight,
            2 => RequestPhase::Waiting,
            _ => RequestPhase::Queued,
        }
    }
}

/// Registry entry for one dispatched request
#[derive(Debug)]
pub struct ActiveRequest {
    pub id: RequestId,
    pub method: Method,
    pub url: String,
    pub cancel: CancellationToken,
    pub started_at: Instant,
    phase: AtomicU8,
}

impl ActiveRequest {
    pub fn phase(&self) -> RequestPhase {
        RequestPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: RequestPhase) {
        self.phase.store(phase.to_u8(), Ordering::SeqCst);
    }
}

/// Point-in-time view of a tracked request
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRequestInfo {
    pub id: RequestId,
    pub method: Method,
    pub url: String,
    pub phase: RequestPhase,
    pub elapsed: Duration,
}

/// Tracks every request between dispatch and completion
#[derive(Debug, Default)]
pub struct RequestRegistry {
    next_id: AtomicU64,
    active: DashMap<RequestId, Arc<ActiveRequest>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and track the request. The entry lives until the
    /// returned guard is dropped.
    pub fn register(self: &Arc<Self>, config: &RequestConfig) -> RegistrationGuard {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let entry = Arc::new(ActiveRequest {
            id,
            method: config.method,
            url: config.url.clone(),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
            phase: AtomicU8::new(RequestPhase::Queued.to_u8()),
        });
        self.active.insert(id, entry.clone());
        debug!(request_id = %id, method = %config.method, url = %config.url, "Registered request");
        RegistrationGuard {
            registry: self.clone(),
            entry,
        }
    }

    pub fn get(&self, id: RequestId) -> Option<Arc<ActiveRequest>> {
        self.active.get(&id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Signal cancellation. Returns false for unknown or already-cancelled ids.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.get(id) {
            Some(entry) => cancel_once(&entry.cancel),
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let entries: Vec<Arc<ActiveRequest>> = self.active.iter().map(|e| e.value().clone()).collect();
        entries.iter().filter(|e| cancel_once(&e.cancel)).count()
    }

    pub fn snapshot(&self) -> Vec<ActiveRequestInfo> {
        let mut list: Vec<ActiveRequestInfo> = self
            .active
            .iter()
            .map(|e| ActiveRequestInfo {
                id: e.id,
                method: e.method,
                url: e.url.clone(),
                phase: e.phase(),
                elapsed: e.started_at.elapsed(),
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    fn remove(&self, id: RequestId) {
        if self.active.remove(&id).is_some() {
            debug!(request_id = %id, "Removed request from registry");
        }
    }
}

/// Removes the registry entry on drop, on every exit path
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: Arc<RequestRegistry>,
    entry: Arc<ActiveRequest>,
}

impl RegistrationGuard {
    pub fn id(&self) -> RequestId {
        self.entry.id
    }

    pub fn entry(&self) -> &Arc<ActiveRequest> {
        &self.entry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.entry.cancel
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        // Stops replays still parked on this request's token
        self.entry.cancel.cancel();
        self.registry.remove(self.entry.id);
    }
}

/// Fire `token`, returning false if it was already cancelled
pub(crate) fn cancel_once(token: &CancellationToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    token.cancel();
    true
}
