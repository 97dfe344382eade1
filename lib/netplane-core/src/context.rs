//! Cancellation helpers

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `token` is cancelled first. Returns `true`
/// when the full duration elapsed.
pub async fn sleep_with_context(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// A cancellable scope. Cancelling a context cancels all of its children
/// but never its parent.
#[derive(Clone, Debug, Default)]
pub struct CancelableContext {
    token: CancellationToken,
}

impl CancelableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Resolves once the context is cancelled
    pub async fn done(&self) {
        self.token.cancelled().await
    }

    pub fn cancel(&self) {
        self.token.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn sleep(&self, duration: Duration) -> bool {
        sleep_with_context(&self.token, duration).await
    }
}
