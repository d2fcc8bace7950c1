//! User-facing feedback state driven by the apiflow event bus

pub mod loading;
pub mod notifications;

pub use loading::{LoadingOptions, LoadingPhase, LoadingSnapshot, LoadingStateManager};
pub use notifications::{
    spawn_error_reporter, NoticeAction, Notification, NotificationQueue, SESSION_EXPIRED_MESSAGE,
};
