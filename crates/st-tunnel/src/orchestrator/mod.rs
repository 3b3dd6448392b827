//! Tunnel orchestration
//!
//! One run connects once, allocates every requested device, runs one
//! session per device concurrently and tears everything down when all
//! sessions have ended or an interrupt arrives.
//!
//! # Failure semantics
//!
//! - A connect failure aborts the run before anything is allocated.
//! - A device allocation failure closes every device opened so far and the
//!   transport, so a partial device set never runs.
//! - A session failure is recorded but never stops sibling sessions. The
//!   first recorded failure is returned once teardown is complete.

mod results;

pub use results::{RunResults, SessionResult, TaskGuard};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use st_core::error::{ConnectError, PortError, SessionError, TunnelError};
use st_core::traits::{Connector, Transport};
use st_core::types::{DeviceSpec, Target};

use crate::device::DeviceBridge;
use crate::session::SessionRunner;
use crate::signal::shutdown_signal;

/// Lifecycle of one orchestrator run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    Failed,
    SessionsStarting,
    SessionsRunning,
    Draining,
    Closed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Connecting => "connecting",
            RunState::Failed => "failed",
            RunState::SessionsStarting => "starting sessions",
            RunState::SessionsRunning => "running",
            RunState::Draining => "draining",
            RunState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Drives a set of device sessions over one transport
pub struct Orchestrator<C: Connector> {
    connector: C,
    runner: SessionRunner,
    force_link: bool,
    state: watch::Sender<RunState>,
}

impl<C: Connector> Orchestrator<C> {
    /// Create an orchestrator connecting through `connector` and running
    /// `runner` for every device
    pub fn new(connector: C, runner: SessionRunner) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            connector,
            runner,
            force_link: false,
            state,
        }
    }

    /// Replace existing local symlinks instead of failing
    pub fn force_link(mut self, force: bool) -> Self {
        self.force_link = force;
        self
    }

    /// Observe run state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Current run state
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    fn set_state(&self, state: RunState) {
        tracing::debug!("Run state: {}", state);
        self.state.send_replace(state);
    }

    /// Run until every session ends or SIGINT/SIGTERM arrives
    pub async fn run(&self, target: &Target, devices: &[DeviceSpec]) -> Result<(), TunnelError> {
        self.run_until(target, devices, shutdown_signal()).await
    }

    /// Run until every session ends or `interrupt` resolves
    pub async fn run_until<F>(
        &self,
        target: &Target,
        devices: &[DeviceSpec],
        interrupt: F,
    ) -> Result<(), TunnelError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = interrupt => {
                        tracing::info!("Interrupted, stopping all sessions");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        };

        let result = self.run_inner(target, devices, &cancel).await;
        watcher.abort();
        result
    }

    async fn run_inner(
        &self,
        target: &Target,
        devices: &[DeviceSpec],
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        self.set_state(RunState::Connecting);
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            connected = self.connector.connect(target) => Some(connected),
        };
        let transport = match connected {
            Some(Ok(transport)) => Arc::new(transport),
            Some(Err(e)) => {
                tracing::error!("Failed to connect to {}: {}", target, e);
                self.set_state(RunState::Failed);
                return Err(connect_failure(e));
            }
            None => {
                tracing::info!("Interrupted while connecting to {}", target);
                self.set_state(RunState::Closed);
                return Ok(());
            }
        };

        self.set_state(RunState::SessionsStarting);
        let bridges = match self.open_devices(devices) {
            Ok(bridges) => bridges,
            Err(e) => {
                tracing::error!("{}", e);
                transport.close().await;
                self.set_state(RunState::Failed);
                return Err(e.into());
            }
        };

        if cancel.is_cancelled() {
            for bridge in &bridges {
                bridge.close();
            }
            transport.close().await;
            self.set_state(RunState::Closed);
            return Ok(());
        }

        let results = Arc::new(RunResults::new());
        let mut tasks = JoinSet::new();

        for (bridge, spec) in bridges.iter().zip(devices) {
            let guard = results.start();
            let runner = self.runner.clone();
            let transport = Arc::clone(&transport);
            let bridge = Arc::clone(bridge);
            let remote = spec.remote.clone();
            let device = spec.name();
            let cancel = cancel.clone();
            let results = Arc::clone(&results);

            tasks.spawn(async move {
                let _guard = guard;
                let run = runner.run(&*transport, bridge, &remote, cancel);
                let error = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(result) => result.err(),
                    Err(_) => Some(SessionError::ChannelFailure {
                        device: device.clone(),
                        message: "session task panicked".to_string(),
                    }),
                };
                results.record(SessionResult { device, error });
            });
        }

        self.set_state(RunState::SessionsRunning);
        tracing::info!("Tunnel to {} running with {} device(s)", target, bridges.len());

        tokio::select! {
            _ = results.wait_idle() => {}
            _ = cancel.cancelled() => {
                for bridge in &bridges {
                    bridge.close();
                }
            }
        }

        self.set_state(RunState::Draining);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Session task failed: {}", e);
            }
        }

        for bridge in &bridges {
            bridge.close();
        }
        transport.close().await;
        self.set_state(RunState::Closed);

        match results.take_error() {
            Some(error) => Err(error.into()),
            None => {
                tracing::info!("All sessions finished");
                Ok(())
            }
        }
    }

    /// Open every device, closing the ones already opened if one fails
    fn open_devices(&self, devices: &[DeviceSpec]) -> Result<Vec<Arc<DeviceBridge>>, PortError> {
        let mut bridges = Vec::with_capacity(devices.len());

        for spec in devices {
            match DeviceBridge::open(&spec.local, self.force_link) {
                Ok(bridge) => {
                    tracing::debug!("Opened {} for remote {}", spec.name(), spec.remote);
                    bridges.push(Arc::new(bridge));
                }
                Err(e) => {
                    for bridge in &bridges {
                        bridge.close();
                    }
                    return Err(e);
                }
            }
        }

        Ok(bridges)
    }
}

/// Trust failures are reported as such rather than as generic connect errors
fn connect_failure(error: ConnectError) -> TunnelError {
    match error {
        ConnectError::Trust(e) => TunnelError::Trust(e),
        e => TunnelError::Connect(e),
    }
}
