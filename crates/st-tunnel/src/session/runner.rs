//! Per-device session runner

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use st_core::error::SessionError;
use st_core::traits::{RemoteEvent, RemoteInput, RemoteSession, Transport};
use st_core::types::RemoteCommand;

use crate::device::DeviceBridge;

/// Read buffer for device → remote traffic
const UPLINK_BUFFER_SIZE: usize = 4096;

/// Upper bound on signalling and closing a remote session on interrupt
pub const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Time the uplink gets to finish after its device is closed
const UPLINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit status the remote shell reports for an unknown command
const EXIT_COMMAND_NOT_FOUND: u32 = 127;

/// How the downlink loop ended
enum Ending {
    /// The channel closed; carries what the remote side reported
    Finished {
        status: Option<u32>,
        signal: Option<String>,
    },
    /// The run was cancelled
    Interrupted,
    /// Writing remote output into the device failed
    DeviceWrite(std::io::Error),
}

/// Runs one device's remote session to completion
#[derive(Debug, Clone)]
pub struct SessionRunner {
    command: RemoteCommand,
}

impl SessionRunner {
    /// Create a runner launching `command` for each device
    pub fn new(command: RemoteCommand) -> Self {
        Self { command }
    }

    /// Command executed for `remote_path`
    pub fn command_for(&self, remote_path: &str) -> String {
        self.command.for_device(remote_path)
    }

    /// Bind `device` to a new remote session running the command for
    /// `remote_path` and wait until the session ends or `cancel` fires.
    ///
    /// The device is closed before returning. A cancelled run returns
    /// `Ok(())` without waiting for the remote command to exit.
    pub async fn run<T: Transport>(
        &self,
        transport: &T,
        device: Arc<DeviceBridge>,
        remote_path: &str,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let name = device.path().display().to_string();
        let command = self.command_for(remote_path);

        let result = self
            .run_session(transport, &device, &name, &command, cancel)
            .await;

        device.close();
        result
    }

    async fn run_session<T: Transport>(
        &self,
        transport: &T,
        device: &Arc<DeviceBridge>,
        name: &str,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let channel_failure = |message: String| SessionError::ChannelFailure {
            device: name.to_string(),
            message,
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = transport.open_session() => Some(opened),
        };
        let Some(opened) = opened else {
            tracing::info!("{}: interrupted before the session opened", name);
            return Ok(());
        };
        let mut session = opened.map_err(|e| channel_failure(e.to_string()))?;

        tracing::debug!("{}: executing {:?}", name, command);
        let launched = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            launched = session.exec(command) => Some(launched),
        };
        let input = match launched {
            Some(launched) => launched.map_err(|e| channel_failure(e.to_string()))?,
            None => {
                tracing::info!("{}: interrupted while launching the remote command", name);
                if tokio::time::timeout(INTERRUPT_TIMEOUT, session.interrupt())
                    .await
                    .is_err()
                {
                    tracing::warn!("{}: timed out interrupting remote command", name);
                }
                return Ok(());
            }
        };

        let uplink = spawn_uplink(Arc::clone(device), input, name.to_string(), cancel.clone());
        tracing::info!("{}: session started", name);

        let ending = downlink(&mut session, device, &cancel).await;

        if matches!(ending, Ending::Interrupted) {
            tracing::debug!("{}: interrupting remote command", name);
            if tokio::time::timeout(INTERRUPT_TIMEOUT, session.interrupt())
                .await
                .is_err()
            {
                tracing::warn!("{}: timed out interrupting remote command", name);
            }
        }

        // Unblocks the uplink's pending device read
        device.close();
        join_uplink(uplink, name).await;

        match ending {
            Ending::Interrupted => {
                tracing::info!("{}: session interrupted", name);
                Ok(())
            }
            Ending::DeviceWrite(e) => Err(channel_failure(format!("device write failed: {}", e))),
            Ending::Finished { status, signal } => {
                let result = exit_outcome(name, command, status, signal);
                match &result {
                    Ok(()) => tracing::info!("{}: remote command exited", name),
                    Err(e) => tracing::warn!("{}", e),
                }
                result
            }
        }
    }
}

/// Remote output → device, until the channel closes or the run is cancelled
async fn downlink<S: RemoteSession>(
    session: &mut S,
    device: &DeviceBridge,
    cancel: &CancellationToken,
) -> Ending {
    let mut status = None;
    let mut signal = None;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ending::Interrupted,
            event = session.recv() => event,
        };

        match event {
            Some(RemoteEvent::Data(data)) => {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ending::Interrupted,
                    written = device.write_all(&data) => written,
                };
                if let Err(e) = written {
                    if cancel.is_cancelled() {
                        return Ending::Interrupted;
                    }
                    return Ending::DeviceWrite(e);
                }
            }
            Some(RemoteEvent::Stderr(data)) => {
                let _ = tokio::io::stderr().write_all(&data).await;
            }
            Some(RemoteEvent::Exit(code)) => status = Some(code),
            Some(RemoteEvent::Signaled(name)) => signal = Some(name),
            Some(RemoteEvent::Eof) => {}
            Some(RemoteEvent::Closed) | None => break,
        }
    }

    Ending::Finished { status, signal }
}

/// Device → remote input, until the device closes or the channel refuses data.
///
/// When the device itself reaches end of stream the remote command's stdin
/// is closed, so a remote side waiting on its input can finish.
fn spawn_uplink<I: RemoteInput>(
    device: Arc<DeviceBridge>,
    input: I,
    name: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; UPLINK_BUFFER_SIZE];

        loop {
            match device.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("{}: device reached end of stream", name);
                    break;
                }
                Ok(n) => {
                    if let Err(e) = input.send(&buf[..n]).await {
                        tracing::debug!("{}: {}", name, e);
                        return;
                    }
                }
                Err(e) => {
                    if !device.is_closed() {
                        tracing::error!("{}: device read error: {}", name, e);
                    }
                    break;
                }
            }
        }

        // A closed bridge means teardown, not end of input
        if device.is_closed() || cancel.is_cancelled() {
            return;
        }
        if let Err(e) = input.eof().await {
            tracing::debug!("{}: failed to close remote input: {}", name, e);
        }
    })
}

async fn join_uplink(mut uplink: JoinHandle<()>, name: &str) {
    match tokio::time::timeout(UPLINK_DRAIN_TIMEOUT, &mut uplink).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("{}: uplink task failed: {}", name, e),
        Err(_) => {
            tracing::debug!("{}: aborting stalled uplink", name);
            uplink.abort();
        }
    }
}

/// Map what the remote side reported into the session result
fn exit_outcome(
    device: &str,
    command: &str,
    status: Option<u32>,
    signal: Option<String>,
) -> Result<(), SessionError> {
    if let Some(signal) = signal {
        return Err(SessionError::RemoteSignaled {
            device: device.to_string(),
            signal,
        });
    }

    match status {
        Some(0) => Ok(()),
        Some(EXIT_COMMAND_NOT_FOUND) => Err(SessionError::RemoteExecNotFound {
            device: device.to_string(),
            command: command.to_string(),
        }),
        Some(status) => Err(SessionError::RemoteNonZeroExit {
            device: device.to_string(),
            status,
        }),
        None => Err(SessionError::ChannelFailure {
            device: device.to_string(),
            message: "channel closed without exit status".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit() {
        assert!(exit_outcome("/dev/ttyV0", "sertun serve /dev/ttyS0", Some(0), None).is_ok());
    }

    #[test]
    fn test_exit_127_is_exec_not_found() {
        let err = exit_outcome("/dev/ttyV0", "picocom /dev/ttyS0", Some(127), None).unwrap_err();
        match err {
            SessionError::RemoteExecNotFound { device, command } => {
                assert_eq!(device, "/dev/ttyV0");
                assert_eq!(command, "picocom /dev/ttyS0");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_nonzero_exit_carries_status() {
        let err = exit_outcome("/dev/ttyV0", "cmd", Some(3), None).unwrap_err();
        assert!(matches!(err, SessionError::RemoteNonZeroExit { status: 3, .. }));
        assert_eq!(err.device(), "/dev/ttyV0");
    }

    #[test]
    fn test_signal_wins_over_status() {
        let err = exit_outcome("a", "cmd", Some(130), Some("INT".into())).unwrap_err();
        assert!(matches!(err, SessionError::RemoteSignaled { ref signal, .. } if signal == "INT"));
    }

    #[test]
    fn test_missing_status_is_channel_failure() {
        let err = exit_outcome("a", "cmd", None, None).unwrap_err();
        assert!(matches!(err, SessionError::ChannelFailure { .. }));
    }

    #[test]
    fn test_command_for_device() {
        let runner = SessionRunner::new(RemoteCommand::new("sertun").force_link(true));
        assert_eq!(
            runner.command_for("/dev/tty USB0"),
            "sertun serve --force '/dev/tty USB0'"
        );
        let runner = SessionRunner::new(RemoteCommand::new("/usr/bin/cat"));
        assert_eq!(runner.command_for("/dev/ttyS0"), "/usr/bin/cat /dev/ttyS0");
    }
}
