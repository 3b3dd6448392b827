//! Serve mode: the command run on the remote host for each device
//!
//! Binds the process' stdin and stdout to a local device, so the SSH channel
//! that launched it becomes that device's byte stream.

use std::future::Future;
use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use st_core::error::TunnelError;

use crate::device::DeviceBridge;
use crate::signal::shutdown_signal;

const PUMP_BUFFER_SIZE: usize = 4096;

/// Serve the device at `path` over stdin/stdout until stdin closes, the
/// device closes, or SIGINT/SIGTERM arrives
pub async fn serve(path: &Path, force_link: bool) -> Result<(), TunnelError> {
    serve_with(
        path,
        force_link,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_signal(),
    )
    .await
}

/// Serve the device at `path` over the given streams until one side closes
/// or `shutdown` resolves. The device is always closed before returning.
pub async fn serve_with<R, W, F>(
    path: &Path,
    force_link: bool,
    input: R,
    output: W,
    shutdown: F,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let device = DeviceBridge::open(path, force_link)?;
    match device.tty_name() {
        Some(tty) => tracing::info!("Serving {:?} ({:?})", path, tty),
        None => tracing::info!("Serving {:?}", path),
    }

    let result = tokio::select! {
        result = pump(&device, input, output) => result,
        _ = shutdown => Ok(()),
    };

    device.close();
    result?;
    tracing::info!("Stopped serving {:?}", path);
    Ok(())
}

/// Copy `input` → device and device → `output` concurrently until either
/// direction reaches end of stream
pub async fn pump<R, W>(device: &DeviceBridge, mut input: R, mut output: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let inbound = async {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                tracing::debug!("Input closed");
                return Ok::<_, io::Error>(());
            }
            device.write_all(&buf[..n]).await?;
        }
    };

    let outbound = async {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            let n = device.read(&mut buf).await?;
            if n == 0 {
                tracing::debug!("Device closed");
                return Ok::<_, io::Error>(());
            }
            output.write_all(&buf[..n]).await?;
            output.flush().await?;
        }
    };

    tokio::select! {
        result = inbound => result,
        result = outbound => result,
    }
}
