//! Coordinated gateway shutdown.
//!
//! A SIGTERM or Ctrl+C flips a watch channel that every listener observes.
//! Open notify requests then get a bounded window to drain before the
//! pushkins stop admitting outbound work; anything still in flight after
//! that is abandoned, and the caller's retry loop covers it.

use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::push::NotificationDispatcher;

/// Owns the shutdown sequence for the whole gateway.
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a coordinator in the running state.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// A receiver that flips to `true` once shutdown begins.
    ///
    /// Listeners hold one of these and stop accepting connections when it
    /// changes.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Begin shutting down. Idempotent.
    pub fn begin(&self) {
        let _ = self.sender.send(true);
    }

    /// Wait for SIGTERM or Ctrl+C, then begin shutdown.
    pub async fn on_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        self.begin();
    }

    /// Drain the gateway.
    ///
    /// Signals the listeners, waits up to `drain_timeout` for them to finish
    /// their open requests, then tells every pushkin to stop admitting
    /// dispatches. The pushkins close last so requests inside the drain
    /// window can still complete their provider sends.
    pub async fn drain<T>(
        &self,
        dispatcher: &NotificationDispatcher,
        listeners: JoinHandle<T>,
        drain_timeout: Duration,
    ) {
        self.begin();

        match timeout(drain_timeout, listeners).await {
            Ok(_) => {
                info!("Open requests drained");
            }
            Err(_) => {
                warn!(
                    "Shutdown timed out after {:?}, abandoning in-flight requests",
                    drain_timeout
                );
            }
        }

        dispatcher.shutdown();
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::ApnsConfig;
    use crate::metrics::Metrics;
    use crate::push::apns::ApnsPushkin;
    use crate::push::{DispatchFailure, Pushkin, PushkinRegistry};

    fn test_dispatcher() -> NotificationDispatcher {
        let mut registry = PushkinRegistry::new();
        registry.insert(
            "com.example.app".to_string(),
            Pushkin::Apns(ApnsPushkin::mock(
                "com.example.app",
                ApnsConfig {
                    certfile: String::new(),
                    keyfile: String::new(),
                    key_id: "K".to_string(),
                    team_id: "T".to_string(),
                    topic: "com.example.app".to_string(),
                    platform: "sandbox".to_string(),
                    max_connections: 20,
                    event_id_only: false,
                    rate_limit: None,
                },
                String::new(),
            )),
        );
        NotificationDispatcher::new(
            registry,
            Arc::new(Metrics::new().unwrap()),
            Duration::from_secs(5),
        )
    }

    fn notification() -> crate::push::Notification {
        serde_json::from_value(serde_json::json!({
            "devices": [{"app_id": "com.example.app", "pushkey": "AA"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_watch_flips_on_begin() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.watch();

        assert!(!*rx.borrow());

        shutdown.begin();
        shutdown.begin(); // idempotent

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_watch_after_begin_sees_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.begin();

        let rx = shutdown.watch();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_all_listeners_observe_shutdown() {
        let shutdown = Shutdown::new();
        let mut rx1 = shutdown.watch();
        let mut rx2 = shutdown.watch();

        shutdown.begin();

        rx1.changed().await.unwrap();
        rx2.changed().await.unwrap();
        assert!(*rx1.borrow());
        assert!(*rx2.borrow());
    }

    #[tokio::test]
    async fn test_drain_closes_pushkins() {
        let shutdown = Shutdown::new();
        let dispatcher = test_dispatcher();

        // A listener set that exits as soon as shutdown is signaled.
        let mut rx = shutdown.watch();
        let listeners = tokio::spawn(async move {
            let _ = rx.changed().await;
        });

        shutdown
            .drain(&dispatcher, listeners, Duration::from_secs(1))
            .await;

        // New dispatches are refused once the drain completes.
        let n = notification();
        let err = dispatcher.dispatch(&n).await.unwrap_err();
        assert!(matches!(err, DispatchFailure::Provider(_)));
        assert!(err.to_string().contains("shut down"));
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_stuck_listeners() {
        let shutdown = Shutdown::new();
        let dispatcher = test_dispatcher();

        // A listener that never exits; the drain window must bound the wait.
        let listeners = tokio::spawn(std::future::pending::<()>());

        let start = std::time::Instant::now();
        shutdown
            .drain(&dispatcher, listeners, Duration::from_millis(50))
            .await;

        assert!(start.elapsed() < Duration::from_secs(2));

        // Pushkins are closed even when the window expires.
        let n = notification();
        let err = dispatcher.dispatch(&n).await.unwrap_err();
        assert!(matches!(err, DispatchFailure::Provider(_)));
    }

    #[tokio::test]
    async fn test_drain_signals_listeners() {
        let shutdown = Shutdown::new();
        let dispatcher = test_dispatcher();

        // The listener only exits because drain flips the channel; a drain
        // that forgot to signal would burn the whole window instead.
        let mut rx = shutdown.watch();
        let listeners = tokio::spawn(async move {
            let _ = rx.changed().await;
        });

        let start = std::time::Instant::now();
        shutdown
            .drain(&dispatcher, listeners, Duration::from_secs(30))
            .await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
