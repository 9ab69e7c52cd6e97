use crate::exec::{CommandChannel, RemoteProcess, RemoteReader, RemoteWriter};
use crate::k8s::CaptureTarget;
use crate::{Result, SniffError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{AttachParams, AttachedProcess};
use kube::{Api, Client};
use tracing::debug;

/// Command sessions over the pod `exec` subresource.
#[derive(Clone)]
pub struct KubeChannel {
    client: Client,
}

impl KubeChannel {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Aborts the websocket task when the owning process handle goes away.
struct AbortOnDrop(AttachedProcess);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl CommandChannel for KubeChannel {
    async fn open(
        &self,
        target: &CaptureTarget,
        argv: &[String],
        stdin: bool,
    ) -> Result<RemoteProcess> {
        debug!("exec on {}: {:?}", target, argv);

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), target.namespace());
        let params = AttachParams::default()
            .container(target.container())
            .stdin(stdin)
            .stdout(true)
            .stderr(true);

        let mut process = pods
            .exec(target.pod(), argv.to_vec(), &params)
            .await
            .map_err(|e| SniffError::Connection(format!("exec on {}: {}", target, e)))?;

        let stdout: RemoteReader = Box::new(
            process
                .stdout()
                .ok_or_else(|| SniffError::Connection("stdout not available".to_string()))?,
        );
        let stderr: RemoteReader = Box::new(
            process
                .stderr()
                .ok_or_else(|| SniffError::Connection("stderr not available".to_string()))?,
        );
        let writer: Option<RemoteWriter> = if stdin {
            let w = process
                .stdin()
                .ok_or_else(|| SniffError::Connection("stdin not available".to_string()))?;
            Some(Box::new(w))
        } else {
            None
        };
        let status = process
            .take_status()
            .ok_or_else(|| SniffError::Connection("status not available".to_string()))?;

        let guard = AbortOnDrop(process);
        let completion = async move {
            let status = status.await;
            drop(guard);
            match status {
                Some(status) => exit_code(status),
                None => Err(SniffError::StreamInterrupted(
                    "connection closed before the remote command reported its status"
                        .to_string(),
                )),
            }
        };

        Ok(RemoteProcess::new(writer, stdout, stderr, completion))
    }
}

/// Translates the exec status message into an exit code.
fn exit_code(status: Status) -> Result<i32> {
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }

    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.trim().parse::<i32>().ok());

    match code {
        Some(code) => Ok(code),
        None => Err(SniffError::CommandNotStarted(
            status
                .message
                .unwrap_or_else(|| "remote command failed without an exit code".to_string()),
        )),
    }
}
