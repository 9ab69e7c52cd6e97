use crate::exec::executor::relay;
use crate::exec::{CommandChannel, RemoteExecutor, RemoteProcess};
use crate::k8s::CaptureTarget;
use crate::sink::{CaptureSink, DiscardSink};
use crate::{Result, SniffError};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// tar record size (blocking factor 20).
const RECORD_SIZE: usize = 20 * 512;
const STDERR_LIMIT: usize = 4096;

/// A remote command that reads an archive on stdin and extracts it into a
/// directory.
pub trait ArchiveReceiver: Send + Sync {
    fn command(&self, dest_dir: &str) -> Vec<String>;
}

/// `tar -xmf - -C <dir>`, present in most images that have a shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarReceiver;

impl ArchiveReceiver for TarReceiver {
    fn command(&self, dest_dir: &str) -> Vec<String> {
        vec![
            "tar".to_string(),
            "-xmf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            dest_dir.to_string(),
        ]
    }
}

/// Copies local files into a container by streaming a tar archive into a
/// receiving command's stdin.
#[derive(Clone)]
pub struct RemoteUploader<C> {
    executor: RemoteExecutor<C>,
    receiver: Arc<dyn ArchiveReceiver>,
}

impl<C: CommandChannel> RemoteUploader<C> {
    pub fn new(executor: RemoteExecutor<C>) -> Self {
        Self {
            executor,
            receiver: Arc::new(TarReceiver),
        }
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn ArchiveReceiver>) -> Self {
        self.receiver = receiver;
        self
    }

    /// Uploads `local` to the absolute path `remote`, keeping it executable.
    ///
    /// The local file is read before any channel is opened. A non-zero exit
    /// of the receiver is reported as [`SniffError::RemoteWrite`] with its
    /// stderr.
    pub async fn upload_file(
        &self,
        target: &CaptureTarget,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        let local_io = |source| SniffError::LocalIo {
            path: local.to_path_buf(),
            source,
        };
        let data = tokio::fs::read(local).await.map_err(local_io)?;
        let mode = file_mode(&tokio::fs::metadata(local).await.map_err(local_io)?);

        let remote_path = Path::new(remote);
        let (dest_dir, name) = match (remote_path.parent(), remote_path.file_name()) {
            (Some(dir), Some(name)) => (dir.to_string_lossy(), name.to_string_lossy()),
            _ => {
                return Err(SniffError::Config(format!(
                    "remote path '{}' has no file name",
                    remote
                )))
            }
        };
        let dest_dir = if dest_dir.is_empty() { "/".into() } else { dest_dir };

        let archive = build_archive(&name, &data, mode)?;
        let argv = self.receiver.command(&dest_dir);
        debug!(
            "uploading {} ({} bytes, mode {:o}) as {} archive bytes via {:?}",
            local.display(),
            data.len(),
            mode,
            archive.len(),
            argv
        );

        let RemoteProcess {
            stdin,
            mut stdout,
            mut stderr,
            completion,
        } = self.executor.open(target, &argv, true).await?;
        let mut stdin = stdin.ok_or_else(|| {
            SniffError::Connection("receiver channel has no stdin".to_string())
        })?;

        let feed = async move {
            stdin.write_all(&archive).await?;
            stdin.shutdown().await?;
            Ok::<_, SniffError>(())
        };
        let mut discard = DiscardSink::new();
        let mut diagnostics = CaptureSink::with_limit(STDERR_LIMIT);

        let (fed, drained_out, drained_err) = tokio::join!(
            feed,
            relay(&mut stdout, &mut discard),
            relay(&mut stderr, &mut diagnostics)
        );

        let code = completion.await?;
        if code != 0 {
            return Err(SniffError::RemoteWrite {
                exit_code: code,
                stderr: diagnostics.text(),
            });
        }
        fed.map_err(|e| match e {
            SniffError::Io(io) => SniffError::StreamInterrupted(io.to_string()),
            other => other,
        })?;
        drained_out?;
        drained_err?;

        info!("uploaded {} to {}", local.display(), remote);
        Ok(())
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    (metadata.permissions().mode() & 0o7777) | 0o111
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o755
}

/// Single-entry ustar archive, padded to a whole record so receivers that
/// read full records see the end marker without waiting for stdin EOF.
fn build_archive(name: &str, data: &[u8], mode: u32) -> Result<Vec<u8>> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut header = tar::Header::new_ustar();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header.set_entry_type(tar::EntryType::Regular);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, data)?;
    let mut archive = builder.into_inner()?;

    let padded = archive.len().div_ceil(RECORD_SIZE) * RECORD_SIZE;
    archive.resize(padded, 0);
    Ok(archive)
}
