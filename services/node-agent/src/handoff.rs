//! Named-pipe handoff between pipeline stages.
//!
//! Stages run as separate processes sharing one directory. Data moves through
//! single-use FIFOs: the writer creates the pipe and blocks opening it until
//! the reader shows up, the reader polls until the pipe exists. Upstream
//! stages then block on a completion pipe until the remover writes
//! [`COMPLETE_MESSAGE`] into it.
//!
//! Opening a FIFO blocks the calling thread, so every open runs on the
//! blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use imgsweep_reconcile::ImageRecord;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use thiserror::Error;
use tracing::{debug, info};

/// Sentinel written into completion pipes.
pub const COMPLETE_MESSAGE: &str = "complete";

/// Mode every pipe is created with.
pub const PIPE_MODE: u32 = 0o644;

/// Completion pipes are written by the remover, which may run as another user.
pub const COMPLETION_PIPE_MODE: u32 = 0o666;

/// How often a reader checks for a data pipe that does not exist yet.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const COLLECT_SCAN_PIPE: &str = "collect-scan";
pub const SCAN_REMOVE_PIPE: &str = "scan-remove";
pub const COMPLETE_COLLECT_PIPE: &str = "remove-complete-collect";
pub const COMPLETE_SCAN_PIPE: &str = "remove-complete-scan";

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("failed to create pipe {path}")]
    Create {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to set permissions on pipe {path}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to open pipe {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to read pipe {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to write to pipe {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode image list")]
    Encode(#[source] serde_json::Error),

    #[error("invalid image list in {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("garbage in pipe {path}: expected {COMPLETE_MESSAGE:?}, got {message:?}")]
    UnexpectedMessage { path: PathBuf, message: String },

    #[error("no stage is listening on {path}")]
    NoPeer { path: PathBuf },

    #[error("blocking pipe task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// Well-known pipe locations under the shared directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    /// Collector to scanner (or to remover when scanning is off).
    pub collect_scan: PathBuf,
    /// Scanner to remover.
    pub scan_remove: PathBuf,
    /// Remover acknowledges the collector.
    pub complete_collect: PathBuf,
    /// Remover acknowledges the scanner.
    pub complete_scan: PathBuf,
}

impl PipePaths {
    pub fn new(shared_dir: &Path) -> Self {
        Self {
            collect_scan: shared_dir.join(COLLECT_SCAN_PIPE),
            scan_remove: shared_dir.join(SCAN_REMOVE_PIPE),
            complete_collect: shared_dir.join(COMPLETE_COLLECT_PIPE),
            complete_scan: shared_dir.join(COMPLETE_SCAN_PIPE),
        }
    }
}

/// Create a FIFO at `path` with `mode`.
///
/// The process umask applies, like any other file creation.
pub fn create_fifo(path: &Path, mode: u32) -> Result<(), HandoffError> {
    mkfifo(path, Mode::from_bits_truncate(mode as nix::libc::mode_t)).map_err(|source| {
        HandoffError::Create {
            path: path.to_path_buf(),
            source,
        }
    })?;
    debug!(pipe = %path.display(), mode = format_args!("{mode:o}"), "Created pipe");
    Ok(())
}

/// Create a completion pipe that any local user can write to.
pub fn create_completion_pipe(path: &Path) -> Result<(), HandoffError> {
    create_fifo(path, PIPE_MODE)?;
    fs::set_permissions(path, fs::Permissions::from_mode(COMPLETION_PIPE_MODE)).map_err(
        |source| HandoffError::Permissions {
            path: path.to_path_buf(),
            source,
        },
    )
}

/// Publish `images` on a new data pipe at `path`.
///
/// Returns once a reader has opened the pipe and the whole list is written.
pub async fn write_images(path: &Path, images: &[ImageRecord]) -> Result<(), HandoffError> {
    let data = serde_json::to_vec(images).map_err(HandoffError::Encode)?;
    create_fifo(path, PIPE_MODE)?;

    let path = path.to_path_buf();
    let count = images.len();
    tokio::task::spawn_blocking(move || {
        let mut file = open_blocking(&path, Access::Write)?;
        file.write_all(&data)
            .map_err(|source| HandoffError::Write {
                path: path.clone(),
                source,
            })?;
        info!(pipe = %path.display(), count, "Wrote images to pipe");
        Ok(())
    })
    .await?
}

/// Read the image list published at `path`, waiting for the pipe to appear.
pub async fn read_images(path: &Path) -> Result<Vec<ImageRecord>, HandoffError> {
    let data = read_when_present(path).await?;
    serde_json::from_slice(&data).map_err(|source| HandoffError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Block until the remover acknowledges on the completion pipe at `path`.
///
/// Anything but the exact sentinel is a protocol violation.
pub async fn wait_for_completion(path: &Path) -> Result<(), HandoffError> {
    let owned = path.to_path_buf();
    let data = tokio::task::spawn_blocking(move || read_all_blocking(&owned)).await??;

    if data != COMPLETE_MESSAGE.as_bytes() {
        return Err(HandoffError::UnexpectedMessage {
            path: path.to_path_buf(),
            message: String::from_utf8_lossy(&data).into_owned(),
        });
    }

    info!(pipe = %path.display(), "Received completion message");
    Ok(())
}

/// Write the sentinel into the completion pipe at `path`.
///
/// The waiting stage must already have created the pipe; a missing pipe is
/// reported as [`HandoffError::NoPeer`].
pub async fn signal_completion(path: &Path) -> Result<(), HandoffError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = match open_blocking(&path, Access::Write) {
            Err(HandoffError::Open { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Err(HandoffError::NoPeer { path });
            }
            other => other?,
        };
        file.write_all(COMPLETE_MESSAGE.as_bytes())
            .map_err(|source| HandoffError::Write {
                path: path.clone(),
                source,
            })?;
        info!(pipe = %path.display(), "Sent completion message");
        Ok(())
    })
    .await?
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

fn open_blocking(path: &Path, access: Access) -> Result<File, HandoffError> {
    let mut options = OpenOptions::new();
    match access {
        Access::Read => options.read(true),
        Access::Write => options.write(true),
    };
    options.open(path).map_err(|source| HandoffError::Open {
        path: path.to_path_buf(),
        source,
    })
}

fn read_all_blocking(path: &Path) -> Result<Vec<u8>, HandoffError> {
    let mut file = open_blocking(path, Access::Read)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|source| HandoffError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(data)
}

async fn read_when_present(path: &Path) -> Result<Vec<u8>, HandoffError> {
    loop {
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || read_all_blocking(&owned)).await? {
            Err(HandoffError::Open { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!(pipe = %path.display(), "Waiting for pipe");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;

    use super::*;

    #[test]
    fn test_pipe_paths() {
        let paths = PipePaths::new(Path::new("/run/imgsweep/shared-data"));
        assert_eq!(
            paths.collect_scan,
            PathBuf::from("/run/imgsweep/shared-data/collect-scan")
        );
        assert_eq!(
            paths.complete_scan,
            PathBuf::from("/run/imgsweep/shared-data/remove-complete-scan")
        );
    }

    #[test]
    fn test_completion_pipe_is_world_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(COMPLETE_COLLECT_PIPE);

        create_completion_pipe(&path).unwrap();

        let metadata = fs::metadata(&path).unwrap();
        assert!(metadata.file_type().is_fifo());
        assert_eq!(metadata.permissions().mode() & 0o777, COMPLETION_PIPE_MODE);
    }

    #[test]
    fn test_create_fifo_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(COLLECT_SCAN_PIPE);

        create_fifo(&path, PIPE_MODE).unwrap();
        assert!(matches!(
            create_fifo(&path, PIPE_MODE),
            Err(HandoffError::Create { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_images_round_trip_through_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(COLLECT_SCAN_PIPE);
        let images = vec![
            ImageRecord::new("sha256:a").with_name("nginx:latest"),
            ImageRecord::new("sha256:b").with_digest("redis@sha256:222"),
        ];

        // Reader starts first and polls until the writer creates the pipe.
        let reader = tokio::spawn({
            let path = path.clone();
            async move { read_images(&path).await }
        });

        write_images(&path, &images).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), images);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completion_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(COMPLETE_COLLECT_PIPE);
        create_completion_pipe(&path).unwrap();

        let waiter = tokio::spawn({
            let path = path.clone();
            async move { wait_for_completion(&path).await }
        });

        signal_completion(&path).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_garbage_in_completion_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(COMPLETE_SCAN_PIPE);
        create_completion_pipe(&path).unwrap();

        let waiter = tokio::spawn({
            let path = path.clone();
            async move { wait_for_completion(&path).await }
        });

        let writer_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let mut file = OpenOptions::new().write(true).open(&writer_path).unwrap();
            file.write_all(b"completed").unwrap();
        })
        .await
        .unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            HandoffError::UnexpectedMessage { ref message, .. } if message == "completed"
        ));
    }

    #[tokio::test]
    async fn test_signal_without_waiting_stage() {
        let dir = tempfile::tempdir().unwrap();
        let err = signal_completion(&dir.path().join(COMPLETE_SCAN_PIPE))
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::NoPeer { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_image_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCAN_REMOVE_PIPE);
        create_fifo(&path, PIPE_MODE).unwrap();

        let writer_path = path.clone();
        let writer = tokio::task::spawn_blocking(move || {
            let mut file = OpenOptions::new().write(true).open(&writer_path).unwrap();
            file.write_all(b"{\"not\": \"a list\"}").unwrap();
        });

        let err = read_images(&path).await.unwrap_err();
        writer.await.unwrap();
        assert!(matches!(err, HandoffError::Decode { .. }));
    }
}
