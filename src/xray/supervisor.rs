use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};

use super::config::EngineConfig;
use super::stats::Counter;
use crate::stats_service::QueryStatsRequest;
use crate::stats_service::stats_service_client::StatsServiceClient;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine binary not found at {0:?}")]
    BinaryNotFound(PathBuf),
    #[error("Invalid engine config: {0}")]
    InvalidConfig(String),
    #[error("Cannot serialize engine config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Engine config file error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot spawn engine process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Engine control plane on port {port} not reachable within {timeout:?}")]
    ConnectTimeout { port: u16, timeout: Duration },
    #[error("Engine start cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Stopped,
    Starting,
    Running,
}

/// Owns the local engine process and its control-plane connection.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Replaces the config the next `start`/`restart` writes. Does not touch the process.
    async fn set_config(&self, config: EngineConfig);
    async fn start(&self) -> Result<(), EngineError>;
    async fn restart(&self) -> Result<(), EngineError>;
    /// Idempotent; safe before any `start`.
    async fn shutdown(&self);
    /// Reads and resets all counters. Empty on RPC failure.
    async fn query_stats(&self) -> Vec<Counter>;
}

struct EngineState {
    config: EngineConfig,
    phase: EnginePhase,
    child: Option<Child>,
    client: Option<StatsServiceClient<Channel>>,
}

pub struct XraySupervisor {
    binary_path: PathBuf,
    config_path: PathBuf,
    connect_timeout: Duration,
    cancel: CancellationToken,
    state: Mutex<EngineState>,
}

impl XraySupervisor {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        log_level: &str,
        connect_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            config_path: config_path.into(),
            connect_timeout,
            cancel,
            state: Mutex::new(EngineState {
                config: EngineConfig::skeleton(log_level, super::config::DEFAULT_API_PORT),
                phase: EnginePhase::Stopped,
                child: None,
                client: None,
            }),
        }
    }

    pub async fn phase(&self) -> EnginePhase {
        self.state.lock().await.phase
    }

    async fn write_config(&self, config: &EngineConfig) -> Result<(), EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        let io_err = |source| EngineError::Io {
            path: self.config_path.clone(),
            source,
        };
        if let Some(dir) = self.config_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await.map_err(io_err)?;
            }
        }
        let raw = serde_json::to_vec(config)?;
        fs::write(&self.config_path, raw).await.map_err(io_err)
    }

    fn spawn_engine(&self) -> Result<Child, EngineError> {
        if !Path::new(&self.binary_path).is_file() {
            return Err(EngineError::BinaryNotFound(self.binary_path.clone()));
        }
        info!(path = ?self.binary_path, "Executing the engine binary...");
        Command::new(&self.binary_path)
            .arg("-c")
            .arg(&self.config_path)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)
    }

    /// Dials the control plane every second until it answers, the deadline passes,
    /// or the supervisor's token is cancelled.
    async fn connect(&self, port: u16) -> Result<StatsServiceClient<Channel>, EngineError> {
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?
            .connect_timeout(CONNECT_RETRY_INTERVAL);
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = sleep_until(deadline) => {
                    return Err(EngineError::ConnectTimeout { port, timeout: self.connect_timeout });
                }
                attempt = endpoint.connect() => attempt,
            };
            match attempt {
                Ok(channel) => {
                    debug!(port, "Connected to the engine control plane.");
                    return Ok(StatsServiceClient::new(channel));
                }
                Err(e) => debug!(port, error = %e, "Engine control plane not ready yet."),
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = sleep(CONNECT_RETRY_INTERVAL) => {}
            }
        }
    }

    async fn launch(&self, state: &mut EngineState) -> Result<StatsServiceClient<Channel>, EngineError> {
        self.write_config(&state.config).await?;
        let port = state
            .config
            .api_port()
            .ok_or_else(|| EngineError::InvalidConfig("api inbound not found".to_string()))?;
        state.child = Some(self.spawn_engine()?);
        self.connect(port).await
    }

    async fn stop_locked(state: &mut EngineState) {
        if state.client.take().is_some() {
            debug!("Engine control-plane connection closed.");
        }
        if let Some(mut child) = state.child.take() {
            match child.kill().await {
                Ok(()) => debug!(pid = ?child.id(), "Engine process killed."),
                Err(e) => warn!(error = %e, "Cannot kill the engine process."),
            }
        }
        state.phase = EnginePhase::Stopped;
    }
}

#[async_trait]
impl ProcessSupervisor for XraySupervisor {
    async fn set_config(&self, config: EngineConfig) {
        self.state.lock().await.config = config;
    }

    async fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.phase != EnginePhase::Stopped {
            Self::stop_locked(&mut state).await;
        }
        state.phase = EnginePhase::Starting;

        match self.launch(&mut state).await {
            Ok(client) => {
                state.client = Some(client);
                state.phase = EnginePhase::Running;
                info!("Engine started.");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Engine failed to start.");
                Self::stop_locked(&mut state).await;
                Err(e)
            }
        }
    }

    async fn restart(&self) -> Result<(), EngineError> {
        info!("Restarting the engine...");
        self.shutdown().await;
        self.start().await
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.phase == EnginePhase::Stopped && state.child.is_none() {
            debug!("Engine already stopped.");
            return;
        }
        Self::stop_locked(&mut state).await;
        info!("Engine stopped.");
    }

    async fn query_stats(&self) -> Vec<Counter> {
        let client = {
            let mut state = self.state.lock().await;
            if let Some(child) = state.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    error!(%status, "Engine process exited unexpectedly.");
                }
            }
            state.client.clone()
        };
        let Some(mut client) = client else {
            warn!("Engine control plane not connected, skipping stats query.");
            return Vec::new();
        };

        let request = QueryStatsRequest {
            reset: true,
            ..Default::default()
        };
        match client.query_stats(request).await {
            Ok(response) => response
                .into_inner()
                .stat
                .into_iter()
                .map(|s| Counter::new(s.name, s.value))
                .collect(),
            Err(status) => {
                error!(error = %status, "Cannot query engine stats.");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(dir: &Path, binary: &str, timeout: Duration) -> XraySupervisor {
        XraySupervisor::new(
            binary,
            dir.join("app").join("xray.json"),
            "warning",
            timeout,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "/nonexistent/xray", Duration::from_secs(1));
        sup.shutdown().await;
        sup.shutdown().await;
        assert_eq!(sup.phase().await, EnginePhase::Stopped);
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal_but_config_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "/nonexistent/xray", Duration::from_secs(1));
        sup.set_config(EngineConfig::skeleton("warning", 4444)).await;

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, EngineError::BinaryNotFound(_)));
        assert_eq!(sup.phase().await, EnginePhase::Stopped);

        let written: EngineConfig =
            serde_json::from_slice(&std::fs::read(dir.path().join("app").join("xray.json")).unwrap())
                .unwrap();
        assert_eq!(written.api_port(), Some(4444));
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "/nonexistent/xray", Duration::from_secs(1));
        let mut config = EngineConfig::skeleton("warning", 4444);
        config.inbounds.clear();
        sup.set_config(config).await;

        assert!(matches!(sup.start().await, Err(EngineError::InvalidConfig(_))));
        assert!(!dir.path().join("app").join("xray.json").exists());
    }

    #[tokio::test]
    async fn test_query_stats_without_connection_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "/nonexistent/xray", Duration::from_secs(1));
        assert!(sup.query_stats().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreachable_control_plane_times_out() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -c <config path>` exits immediately, so nothing ever listens on the api port.
        let sup = supervisor(dir.path(), "/bin/sh", Duration::from_millis(1500));
        let port = crate::ports::PortAllocator::new().allocate().unwrap();
        sup.set_config(EngineConfig::skeleton("warning", port)).await;

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, EngineError::ConnectTimeout { .. }));
        assert_eq!(sup.phase().await, EnginePhase::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_aborts_start() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let sup = XraySupervisor::new(
            "/bin/sh",
            dir.path().join("xray.json"),
            "warning",
            Duration::from_secs(30),
            cancel.clone(),
        );
        let port = crate::ports::PortAllocator::new().allocate().unwrap();
        sup.set_config(EngineConfig::skeleton("warning", port)).await;

        cancel.cancel();
        assert!(matches!(sup.start().await, Err(EngineError::Cancelled)));
    }
}
