//! Running commands inside a remote container and moving files into it.
//!
//! Everything here goes through [`CommandChannel`], one multiplexed
//! stdin/stdout/stderr session per command. [`KubeChannel`] speaks the pod
//! `exec` subresource; [`InMemoryCluster`] is a deterministic stand-in.

pub mod executor;
pub mod kube_channel;
pub mod memory;
pub mod uploader;

use crate::k8s::CaptureTarget;
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};

pub use executor::RemoteExecutor;
pub use kube_channel::KubeChannel;
pub use memory::InMemoryCluster;
pub use uploader::{ArchiveReceiver, RemoteUploader, TarReceiver};

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A command running in the remote container.
///
/// Single use: each stream has exactly one owner once the process is split
/// apart. Dropping it tears the remote session down.
pub struct RemoteProcess {
    pub stdin: Option<RemoteWriter>,
    pub stdout: RemoteReader,
    pub stderr: RemoteReader,
    /// Resolves to the exit code once the remote command terminates.
    pub completion: BoxFuture<'static, Result<i32>>,
}

impl RemoteProcess {
    pub fn new<F>(
        stdin: Option<RemoteWriter>,
        stdout: RemoteReader,
        stderr: RemoteReader,
        completion: F,
    ) -> Self
    where
        F: Future<Output = Result<i32>> + Send + 'static,
    {
        Self {
            stdin,
            stdout,
            stderr,
            completion: Box::pin(completion),
        }
    }
}

/// Opens command sessions against a container.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Starts `argv` in the target container. Fails with
    /// [`SniffError::Connection`](crate::SniffError::Connection) before any
    /// bytes flow if the session cannot be established.
    async fn open(
        &self,
        target: &CaptureTarget,
        argv: &[String],
        stdin: bool,
    ) -> Result<RemoteProcess>;
}
