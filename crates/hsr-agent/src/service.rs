use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service start failed: {0}")]
    StartFailed(String),
    #[error("signal handling failed: {0}")]
    SignalFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[async_trait(?Send)]
pub trait ServiceHost {
    async fn start(&mut self) -> Result<(), ServiceError>;
    async fn stop(&mut self) -> Result<(), ServiceError>;
    fn status(&self) -> ServiceStatus;
}

/// Runs the agent attached to the terminal; stopping flips the shutdown
/// flag that the agent loop watches.
pub struct ForegroundService {
    status: ServiceStatus,
    shutdown: watch::Sender<bool>,
}

impl ForegroundService {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                status: ServiceStatus::Stopped,
                shutdown: tx,
            },
            rx,
        )
    }
}

#[async_trait(?Send)]
impl ServiceHost for ForegroundService {
    async fn start(&mut self) -> Result<(), ServiceError> {
        if self.status == ServiceStatus::Running {
            return Err(ServiceError::StartFailed("already running".to_string()));
        }
        info!("Starting hsr-agent in foreground mode");
        self.status = ServiceStatus::Starting;
        self.status = ServiceStatus::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ServiceError> {
        info!("Stopping hsr-agent");
        self.status = ServiceStatus::Stopping;
        // No receivers left means the loop has already exited.
        let _ = self.shutdown.send(true);
        self.status = ServiceStatus::Stopped;
        Ok(())
    }

    fn status(&self) -> ServiceStatus {
        self.status
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() -> Result<(), ServiceError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term =
            signal(SignalKind::terminate()).map_err(|e| ServiceError::SignalFailed(e.to_string()))?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map_err(|e| ServiceError::SignalFailed(e.to_string())),
            _ = term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| ServiceError::SignalFailed(e.to_string()))
    }
}
