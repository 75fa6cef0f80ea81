//! Run-scoped cancellation.
//!
//! A [`CancelHandle`] trips every [`CancelToken`] cloned from it. Once a run
//! is cancelled no new step starts, backoff sleeps end early, and in-flight
//! driver calls are left to finish or time out.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The tripping side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// The observing side of a cancellation pair. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

/// Create a connected handle and token.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx: Some(rx) })
}

impl CancelHandle {
    /// Cancel the run. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Whether [`CancelHandle::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolve once the run is cancelled. Never resolves for
    /// [`CancelToken::never`] or if the handle is dropped uncancelled.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}

/// Cancel `handle` when the process receives a shutdown signal.
///
/// On Unix, this waits for SIGTERM or SIGINT.
/// On Windows, this waits for CTRL+C.
pub fn cancel_on_shutdown_signal(handle: CancelHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if wait_for_shutdown_signal().await {
            handle.cancel();
        }
    })
}

/// Wait for a shutdown signal. Returns false if no handler could be
/// installed.
async fn wait_for_shutdown_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Failed to install signal handlers");
                    return false;
                },
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, cancelling run");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, cancelling run");
            }
        }
        true
    }

    #[cfg(windows)]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received CTRL+C, cancelling run");
                true
            },
            Err(e) => {
                warn!(error = %e, "Failed to install CTRL+C handler");
                false
            },
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::future::pending::<bool>().await
    }
}
