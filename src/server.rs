//! HTTP routing and listener supervision.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::post;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::gateway::SecurityGateway;
use crate::issuance::{IssuanceService, create_certificate_handler};

pub const CERTIFICATES_PATH: &str = "/api/v1/certificates";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("listener failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Every route sits behind the security gateway.
pub fn build_router(issuance: Arc<IssuanceService>, gateway: Arc<SecurityGateway>) -> Router {
    Router::new()
        .route(CERTIFICATES_PATH, post(create_certificate_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            gateway,
            SecurityGateway::authorize,
        ))
        .with_state(issuance)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The shutdown future (normally a signal) completed.
    Signal,
    /// The supervisor's token was cancelled from outside.
    Cancelled,
    /// A task returned `Ok` on its own.
    TaskExited { task: String },
    TaskFailed { task: String, error: String },
}

impl ShutdownReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, ShutdownReason::TaskFailed { .. })
    }
}

type TaskOutcome = (String, Result<(), ServerError>);

/// Runs long-lived tasks until the first one ends or a shutdown is requested,
/// then cancels and drains the rest.
#[derive(Default)]
pub struct Supervisor {
    tasks: JoinSet<TaskOutcome>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the supervisor starts shutting down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns `task`, handing it a child token to watch for shutdown.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
    {
        let name = name.into();
        let fut = task(self.cancel.child_token());
        self.tasks.spawn(async move { (name, fut.await) });
    }

    /// Serves `router` on `listener` until shutdown, draining in-flight requests.
    pub fn spawn_listener(&mut self, name: impl Into<String>, listener: TcpListener, router: Router) {
        let name = name.into();
        let addr = listener.local_addr().ok();
        info!(task = %name, addr = ?addr, "listener started");
        self.spawn(name, move |token| async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .map_err(ServerError::Serve)
        });
    }

    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> ShutdownReason {
        let reason = tokio::select! {
            _ = shutdown => ShutdownReason::Signal,
            _ = self.cancel.cancelled() => ShutdownReason::Cancelled,
            Some(joined) = self.tasks.join_next() => match joined {
                Ok((task, Ok(()))) => ShutdownReason::TaskExited { task },
                Ok((task, Err(err))) => ShutdownReason::TaskFailed { task, error: err.to_string() },
                Err(err) => ShutdownReason::TaskFailed {
                    task: "unknown".to_string(),
                    error: err.to_string(),
                },
            },
        };
        info!(reason = ?reason, "shutting down");

        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((task, Ok(()))) => info!(task = %task, "task stopped"),
                Ok((task, Err(err))) => warn!(task = %task, error = %err, "task failed during shutdown"),
                Err(err) => error!(error = %err, "task panicked during shutdown"),
            }
        }
        reason
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn first_exiting_task_stops_the_rest() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut supervisor = Supervisor::new();

        let flag = Arc::clone(&stopped);
        supervisor.spawn("long", move |token| async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        supervisor.spawn("short", |_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(ServerError::Serve(std::io::Error::other("boom")))
        });

        let reason = supervisor.run(std::future::pending()).await;
        assert_eq!(
            reason,
            ShutdownReason::TaskFailed {
                task: "short".into(),
                error: "listener failed: boom".into()
            }
        );
        assert!(reason.is_failure());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_future_wins() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("idle", |token| async move {
            token.cancelled().await;
            Ok(())
        });
        let reason = supervisor
            .run(tokio::time::sleep(Duration::from_millis(10)))
            .await;
        assert_eq!(reason, ShutdownReason::Signal);
    }

    #[tokio::test]
    async fn external_cancellation() {
        let supervisor = Supervisor::new();
        let token = supervisor.cancellation_token();
        token.cancel();
        assert_eq!(
            supervisor.run(std::future::pending()).await,
            ShutdownReason::Cancelled
        );
    }

    #[tokio::test]
    async fn listener_drains_on_shutdown() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut supervisor = Supervisor::new();
        supervisor.spawn_listener("http", listener, Router::new());
        let reason = supervisor
            .run(tokio::time::sleep(Duration::from_millis(20)))
            .await;
        assert_eq!(reason, ShutdownReason::Signal);
    }
}
