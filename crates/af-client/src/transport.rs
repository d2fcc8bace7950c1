use af_common::{Response, TransportError};
use async_trait::async_trait;

use crate::request::RequestConfig;

/// The narrow boundary between orchestration and the network stack.
///
/// Implementations return any HTTP status as `Ok`; only failures where no
/// status was received are `Err`. Dropping the returned future must abort
/// the underlying call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestConfig) -> Result<Response, TransportError>;
}
