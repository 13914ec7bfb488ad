//! Shutdown coordination for the monitor.

use tokio_util::sync::CancellationToken;

/// Coordinator for graceful shutdown.
///
/// Long-running tasks hold a child token obtained from [`Shutdown::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait until shutdown is triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_trigger() {
        let shutdown = Shutdown::new();
        let sub = shutdown.subscribe();
        assert!(!sub.is_cancelled());
        shutdown.trigger();
        sub.cancelled().await;
        // the coordinator's own waiters resolve too
        tokio::time::timeout(std::time::Duration::from_secs(1), shutdown.triggered())
            .await
            .unwrap();
    }
}
