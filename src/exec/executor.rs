use crate::exec::{CommandChannel, RemoteProcess};
use crate::k8s::CaptureTarget;
use crate::{Result, SniffError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const RELAY_CHUNK_SIZE: usize = 32 * 1024;

/// Runs commands in a container and relays their output as it arrives.
#[derive(Clone)]
pub struct RemoteExecutor<C> {
    channel: C,
    connect_timeout: Duration,
}

impl<C: CommandChannel> RemoteExecutor<C> {
    pub fn new(channel: C, connect_timeout: Duration) -> Self {
        Self {
            channel,
            connect_timeout,
        }
    }

    /// Opens a session, bounding only the connection phase by the timeout.
    pub async fn open(
        &self,
        target: &CaptureTarget,
        argv: &[String],
        stdin: bool,
    ) -> Result<RemoteProcess> {
        match tokio::time::timeout(self.connect_timeout, self.channel.open(target, argv, stdin))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SniffError::Connection(format!(
                "timed out after {:?} connecting to {}",
                self.connect_timeout, target
            ))),
        }
    }

    /// Runs `argv` and streams stdout and stderr into the given sinks until the
    /// remote process exits. Returns its exit code.
    pub async fn run<O, E>(
        &self,
        target: &CaptureTarget,
        argv: &[String],
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<i32>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        let RemoteProcess {
            stdout: mut remote_out,
            stderr: mut remote_err,
            completion,
            ..
        } = self.open(target, argv, false).await?;

        let (out_bytes, err_bytes) = tokio::try_join!(
            relay(&mut remote_out, stdout),
            relay(&mut remote_err, stderr)
        )?;
        stdout.flush().await?;
        stderr.flush().await?;

        let code = completion.await?;
        debug!(
            "{:?} exited with {} ({} stdout bytes, {} stderr bytes)",
            argv.first(),
            code,
            out_bytes,
            err_bytes
        );

        Ok(code)
    }
}

/// Copies `reader` into `writer` chunk by chunk, preserving order. Read
/// failures are transport failures; write failures belong to the sink.
pub(crate) async fn relay<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| SniffError::StreamInterrupted(e.to_string()))?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
