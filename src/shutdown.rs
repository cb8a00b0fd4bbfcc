//! Process shutdown coordination.
//!
//! One token fans out to everything long-lived: the worker loop stops
//! between jobs, the active runner sees a child of this token through its
//! [`PreparedJob`](crate::runner::PreparedJob), open SSE streams end, and
//! the HTTP server stops accepting. Connection draining is capped by a
//! grace period so a stuck client cannot hold the process open.

use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

const DEFAULT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
    grace: Duration,
}

impl Shutdown {
    /// Install SIGINT/SIGTERM listeners with the default drain grace period.
    pub fn install() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        let token = CancellationToken::new();
        spawn_signal_listener(token.clone());
        Self { token, grace }
    }

    /// Token watched by the worker loop, the server and SSE streams.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once the grace period after the shutdown signal has elapsed.
    /// Races against the server's connection drain; whichever finishes first
    /// ends the process.
    pub async fn grace_expired(&self) {
        self.token.cancelled().await;
        tokio::time::sleep(self.grace).await;
    }
}

fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "Shutting down"),
            _ = sigint.recv() => tracing::info!(signal = "SIGINT", "Shutting down"),
        }
        token.cancel();
    });
}
