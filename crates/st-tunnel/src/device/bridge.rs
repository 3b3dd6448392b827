//! Device bridge: one local serial-like endpoint
//!
//! A bridge is either an existing device opened directly, or a freshly
//! allocated pseudo-terminal whose slave is exposed at the requested path
//! through a symlink the bridge owns. Bytes pass through untouched.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, PtyPair, PtySize};
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

use st_core::error::PortError;

use super::fd::{dup_nonblocking, make_raw, read_fd, set_nonblocking, slave_name, write_all_fd};

/// What a bridge reads from and writes to
enum Backing {
    /// Master side of an allocated pseudo-terminal. The pair keeps the slave
    /// open so master reads never report a hangup while no peer is attached.
    Pty {
        fd: AsyncFd<OwnedFd>,
        _pair: Mutex<PtyPair>,
    },
    /// Existing device that the reactor can poll
    Device(AsyncFd<OwnedFd>),
    /// Existing regular file; the reactor cannot poll these, so I/O runs on
    /// the blocking pool
    File(Arc<File>),
}

impl Backing {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Backing::Pty { fd, .. } | Backing::Device(fd) => read_fd(fd, buf).await,
            Backing::File(file) => {
                let file = Arc::clone(file);
                let len = buf.len();
                let chunk = tokio::task::spawn_blocking(move || {
                    let mut chunk = vec![0u8; len];
                    let n = (&*file).read(&mut chunk)?;
                    chunk.truncate(n);
                    Ok::<_, io::Error>(chunk)
                })
                .await
                .map_err(io::Error::other)??;
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
        }
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        match self {
            Backing::Pty { fd, .. } | Backing::Device(fd) => write_all_fd(fd, data).await,
            Backing::File(file) => {
                let file = Arc::clone(file);
                let data = data.to_vec();
                tokio::task::spawn_blocking(move || (&*file).write_all(&data))
                    .await
                    .map_err(io::Error::other)?
            }
        }
    }
}

/// A local endpoint bridged to a remote device
pub struct DeviceBridge {
    /// Requested local path
    path: PathBuf,
    /// Slave tty name when the bridge allocated a pseudo-terminal
    tty: Option<PathBuf>,
    /// Taken on close; in-flight operations hold their own reference
    backing: Mutex<Option<Arc<Backing>>>,
    /// Symlink to remove on close, present only if this bridge created it
    link: Mutex<Option<PathBuf>>,
    /// Cancelled on close to unblock pending reads and writes
    closed: CancellationToken,
}

impl DeviceBridge {
    /// Open the endpoint at `path`.
    ///
    /// - an existing symlink fails with `AlreadyLinked` unless `force_link`,
    ///   in which case it is replaced by a fresh pseudo-terminal
    /// - an existing non-symlink is opened directly and never deleted
    /// - a missing path gets a raw-mode pseudo-terminal linked at `path`
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(path: impl AsRef<Path>, force_link: bool) -> Result<Self, PortError> {
        let path = path.as_ref();

        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if !force_link {
                    return Err(PortError::AlreadyLinked(path.to_path_buf()));
                }
                tracing::info!("Removing existing symlink {:?}", path);
                std::fs::remove_file(path).map_err(|e| PortError::AllocationFailed {
                    path: path.to_path_buf(),
                    reason: format!("failed to remove existing symlink: {}", e),
                })?;
                Self::allocate(path)
            }
            Ok(meta) => Self::open_existing(path, meta.file_type().is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::allocate(path),
            Err(e) => Err(PortError::DeviceOpenFailed {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn open_existing(path: &Path, regular_file: bool) -> Result<Self, PortError> {
        let open_failed = |source: io::Error| PortError::DeviceOpenFailed {
            path: path.to_path_buf(),
            source,
        };

        tracing::info!("Opening existing device {:?}", path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(open_failed)?;

        let backing = if regular_file {
            Backing::File(Arc::new(file))
        } else {
            let polled = file.try_clone().map_err(open_failed)?;
            match AsyncFd::new(OwnedFd::from(polled)) {
                Ok(fd) => Backing::Device(fd),
                // Character devices such as /dev/null cannot be polled
                Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                    tracing::debug!("{:?} is not pollable, using blocking I/O", path);
                    set_nonblocking(file.as_raw_fd(), false).map_err(open_failed)?;
                    Backing::File(Arc::new(file))
                }
                Err(e) => return Err(open_failed(e)),
            }
        };

        Ok(Self::with_backing(path, None, backing, None))
    }

    fn allocate(path: &Path) -> Result<Self, PortError> {
        let failed = |reason: String| PortError::AllocationFailed {
            path: path.to_path_buf(),
            reason,
        };

        let pair = native_pty_system()
            .openpty(PtySize::default())
            .map_err(|e| failed(format!("openpty failed: {}", e)))?;

        let master_fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| failed("pty master has no file descriptor".to_string()))?;
        let tty = slave_name(master_fd)
            .map_err(|e| failed(format!("failed to resolve pty slave name: {}", e)))?;

        make_raw(master_fd).map_err(|e| failed(format!("failed to set raw mode: {}", e)))?;
        let fd = dup_nonblocking(master_fd)
            .and_then(AsyncFd::new)
            .map_err(|e| failed(format!("failed to register pty: {}", e)))?;

        std::os::unix::fs::symlink(&tty, path)
            .map_err(|e| failed(format!("failed to link {:?}: {}", tty, e)))?;
        tracing::info!("Linked {:?} to {:?}", path, tty);

        let backing = Backing::Pty {
            fd,
            _pair: Mutex::new(pair),
        };
        Ok(Self::with_backing(
            path,
            Some(tty),
            backing,
            Some(path.to_path_buf()),
        ))
    }

    fn with_backing(
        path: &Path,
        tty: Option<PathBuf>,
        backing: Backing,
        link: Option<PathBuf>,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            tty,
            backing: Mutex::new(Some(Arc::new(backing))),
            link: Mutex::new(link),
            closed: CancellationToken::new(),
        }
    }

    /// Requested local path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Slave tty the symlink points at, for allocated bridges
    pub fn tty_name(&self) -> Option<&Path> {
        self.tty.as_deref()
    }

    /// Whether closing this bridge removes a symlink it created
    pub fn owns_symlink(&self) -> bool {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn backing(&self) -> Option<Arc<Backing>> {
        self.backing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Read the next chunk from the device. Returns `Ok(0)` once the bridge
    /// is closed, including for reads already pending at close time.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(backing) = self.backing() else {
            return Ok(0);
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(0),
            result = backing.read(buf) => result,
        }
    }

    /// Write all of `data` to the device. Fails with `BrokenPipe` once the
    /// bridge is closed.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let backing = self.backing().ok_or_else(closed_error)?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            result = backing.write_all(data) => result,
        }
    }

    /// Close the device. Idempotent: the backing handle is released and an
    /// owned symlink is removed exactly once.
    pub fn close(&self) {
        self.closed.cancel();

        let backing = self
            .backing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if backing.is_some() {
            tracing::debug!("Closing device {:?}", self.path);
        }
        drop(backing);

        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(link) = link {
            remove_owned_link(&link);
        }
    }
}

impl Drop for DeviceBridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DeviceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBridge")
            .field("path", &self.path)
            .field("tty", &self.tty)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Remove `link` if it is still a symlink; anything else in its place was
/// put there by someone else and is left alone.
fn remove_owned_link(link: &Path) {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => match std::fs::remove_file(link) {
            Ok(()) => tracing::info!("Removed symlink {:?}", link),
            Err(e) => tracing::warn!("Failed to remove symlink {:?}: {}", link, e),
        },
        Ok(_) => tracing::warn!("{:?} is no longer a symlink, leaving it in place", link),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to inspect symlink {:?}: {}", link, e),
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Open the slave end of a bridge the way a serial client would
    fn open_peer(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
            .unwrap()
    }

    #[tokio::test]
    async fn test_allocates_pty_and_symlink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ttyV0");

        let bridge = DeviceBridge::open(&path, false).unwrap();
        assert!(bridge.owns_symlink());
        let meta = std::fs::symlink_metadata(&path).unwrap();
        assert!(meta.file_type().is_symlink());
        let tty = bridge.tty_name().unwrap();
        assert_eq!(std::fs::read_link(&path).unwrap().as_path(), tty);
        assert!(tty.starts_with("/dev"), "unexpected slave name {:?}", tty);
        assert!(tty.exists());

        bridge.close();
        assert!(!path.exists());
        assert!(std::fs::symlink_metadata(&path).is_err());
    }

    #[tokio::test]
    async fn test_close_twice_removes_symlink_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ttyV0");

        let bridge = DeviceBridge::open(&path, false).unwrap();
        bridge.close();
        assert!(bridge.is_closed());
        assert!(!bridge.owns_symlink());

        // A new link at the same path must survive a second close
        std::os::unix::fs::symlink("/dev/null", &path).unwrap();
        bridge.close();
        assert!(std::fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
    }

    #[tokio::test]
    async fn test_existing_symlink_requires_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ttyV0");
        std::os::unix::fs::symlink("/dev/null", &path).unwrap();

        let err = DeviceBridge::open(&path, false).unwrap_err();
        assert!(matches!(err, PortError::AlreadyLinked(_)));
        assert_eq!(std::fs::read_link(&path).unwrap(), PathBuf::from("/dev/null"));

        let bridge = DeviceBridge::open(&path, true).unwrap();
        assert!(bridge.owns_symlink());
        assert_ne!(std::fs::read_link(&path).unwrap(), PathBuf::from("/dev/null"));
        bridge.close();
        assert!(std::fs::symlink_metadata(&path).is_err());
    }

    #[tokio::test]
    async fn test_existing_file_is_never_deleted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device");
        std::fs::write(&path, b"hello").unwrap();

        let bridge = DeviceBridge::open(&path, true).unwrap();
        assert!(!bridge.owns_symlink());
        assert!(bridge.tty_name().is_none());

        let mut buf = [0u8; 16];
        let n = bridge.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        bridge.close();
        bridge.close();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_replaced_link_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ttyV0");

        let bridge = DeviceBridge::open(&path, false).unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"not ours").unwrap();

        bridge.close();
        assert_eq!(std::fs::read(&path).unwrap(), b"not ours");
    }

    #[tokio::test]
    async fn test_pty_passes_bytes_through_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ttyV0");
        let bridge = DeviceBridge::open(&path, false).unwrap();
        let mut peer = open_peer(&path);

        // Raw mode: no CR/LF translation, no echo
        let payload = b"AT\r\n\x00\x7f\x03line\n";
        peer.write_all(payload).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        while received.len() < payload.len() {
            let n = tokio::time::timeout(Duration::from_secs(5), bridge.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);

        bridge.write_all(b"OK\r\n").await.unwrap();
        let reply = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).map(|_| buf)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&reply, b"OK\r\n");

        bridge.close();
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ttyV0");
        let bridge = Arc::new(DeviceBridge::open(&path, false).unwrap());

        let reader = Arc::clone(&bridge);
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge.close();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("read still blocked after close")
            .unwrap();
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_io_after_close() {
        let dir = TempDir::new().unwrap();
        let bridge = DeviceBridge::open(dir.path().join("ttyV0"), false).unwrap();
        bridge.close();

        let mut buf = [0u8; 4];
        assert_eq!(bridge.read(&mut buf).await.unwrap(), 0);
        let err = bridge.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_drop_removes_symlink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ttyV0");
        {
            let _bridge = DeviceBridge::open(&path, false).unwrap();
            assert!(std::fs::symlink_metadata(&path).is_ok());
        }
        assert!(std::fs::symlink_metadata(&path).is_err());
    }

    #[tokio::test]
    async fn test_unopenable_path() {
        let dir = TempDir::new().unwrap();
        let err = DeviceBridge::open(dir.path(), false).unwrap_err();
        assert!(matches!(err, PortError::DeviceOpenFailed { .. }));
    }

    #[tokio::test]
    async fn test_unpollable_device_uses_blocking_io() {
        let bridge = DeviceBridge::open("/dev/null", false).unwrap();
        assert!(!bridge.owns_symlink());
        assert!(bridge.tty_name().is_none());

        bridge.write_all(b"discarded").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), bridge.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        bridge.close();
        assert!(Path::new("/dev/null").exists());
    }
}
