//! Capture orchestration: make sure the capture binary is in the container,
//! start it, and relay its pcap stream to a file or a viewer.

use crate::capture::session::{BinaryPresence, CaptureSession, Destination};
use crate::config::SniffConfig;
use crate::exec::{ArchiveReceiver, CommandChannel, RemoteExecutor, RemoteUploader};
use crate::k8s::CaptureTarget;
use crate::sink::{CaptureSink, DiscardSink};
use crate::{Phase, Result, SniffError};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::{Child, Command};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_OUTPUT_LIMIT: usize = 4096;

pub struct Sniffer<C> {
    target: CaptureTarget,
    config: SniffConfig,
    executor: RemoteExecutor<C>,
    uploader: RemoteUploader<C>,
    session: CaptureSession,
}

impl<C: CommandChannel + Clone + 'static> Sniffer<C> {
    pub fn new(channel: C, target: CaptureTarget, config: SniffConfig) -> Self {
        let executor = RemoteExecutor::new(channel, config.connect_timeout);
        let uploader = RemoteUploader::new(executor.clone());
        let session = CaptureSession::new(config.filter.clone());

        Self {
            target,
            config,
            executor,
            uploader,
            session,
        }
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn ArchiveReceiver>) -> Self {
        self.uploader = self.uploader.with_receiver(receiver);
        self
    }

    pub fn target(&self) -> &CaptureTarget {
        &self.target
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    /// Full invocation: provision the binary, then capture until the remote
    /// process ends, the viewer exits, or `cancel` fires.
    pub async fn run(&mut self, destination: Destination, cancel: CancellationToken) -> Result<()> {
        info!("Starting ksniff");

        info!(
            "Sniffing on pod: '{}' [namespace: '{}', container: '{}', filter: '{}']",
            self.target.pod(),
            self.target.namespace(),
            self.target.container(),
            self.config.filter
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("interrupted before capture started");
                return Ok(());
            }
            result = self.ensure_binary() => result?,
        }
        self.capture(destination, cancel).await?;

        info!("ksniff done");
        Ok(())
    }

    /// Probes for the capture binary. `Ok(false)` means it is absent;
    /// stderr output alongside a zero exit is an inconclusive probe.
    pub async fn probe_binary(&self) -> Result<bool> {
        let mut stdout = CaptureSink::with_limit(PROBE_OUTPUT_LIMIT);
        let mut stderr = CaptureSink::with_limit(PROBE_OUTPUT_LIMIT);

        let code = self
            .executor
            .run(&self.target, &self.config.probe_argv(), &mut stdout, &mut stderr)
            .await?;

        if code != 0 {
            debug!("presence probe exited with {}: {}", code, stderr.text());
            return Ok(false);
        }

        if !stderr.is_empty() {
            return Err(SniffError::Probe(format!(
                "failed to check for tcpdump: {}",
                stderr.text()
            )));
        }

        info!("static-tcpdump found: {}", stdout.text());
        Ok(true)
    }

    /// Uploads the capture binary unless the container already has it.
    pub async fn ensure_binary(&mut self) -> Result<()> {
        let remote = self.config.remote_binary_path.clone();
        info!("checking for static tcpdump binary on: {}", remote);

        let presence = match self.probe_binary().await {
            Ok(true) => BinaryPresence::Present,
            Ok(false) => BinaryPresence::Absent,
            Err(e @ SniffError::Probe(_)) => {
                warn!("{}; uploading anyway", e);
                BinaryPresence::Unknown
            }
            Err(e) => return Err(e.in_phase(Phase::PresenceProbe)),
        };
        self.session.binary_checked(presence);

        if presence == BinaryPresence::Present {
            info!("tcpdump was already on remote pod");
            self.session.binary_ready();
            return Ok(());
        }

        info!(
            "couldn't find static tcpdump binary on: {}, starting to upload",
            remote
        );
        self.session.upload_started();

        self.uploader
            .upload_file(&self.target, &self.config.local_binary_path, &remote)
            .await
            .map_err(|e| match e {
                local @ SniffError::LocalIo { .. } => local,
                other => SniffError::ProvisioningFailed(format!(
                    "upload file command failed: {}",
                    other
                )),
            })
            .map_err(|e| e.in_phase(Phase::Upload))?;

        match self.probe_binary().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(SniffError::ProvisioningFailed(format!(
                    "{} is still missing after upload",
                    remote
                ))
                .in_phase(Phase::Upload))
            }
            Err(e @ SniffError::Probe(_)) => warn!("could not verify upload: {}", e),
            Err(e) => return Err(e.in_phase(Phase::Upload)),
        }

        info!("tcpdump uploaded successfully");
        self.session.binary_ready();
        Ok(())
    }

    /// Launches the capture and relays it into `destination`.
    pub async fn capture(
        &mut self,
        destination: Destination,
        cancel: CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            info!("interrupted before capture started");
            return Ok(());
        }

        let argv = self.config.capture_argv();
        info!("starting capture on {} into {}", self.target, destination);
        self.session.capturing(destination.clone());

        let result = match &destination {
            Destination::File(path) => self.capture_to_file(&argv, path, &cancel).await,
            Destination::Viewer(viewer) => self.capture_to_viewer(&argv, viewer, &cancel).await,
        };

        self.session.done();
        result.map_err(|e| e.in_phase(Phase::Capture))
    }

    async fn capture_to_file(
        &self,
        argv: &[String],
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|source| SniffError::LocalIo {
                path: path.to_path_buf(),
                source,
            })?;
        let mut writer = BufWriter::new(file);
        let mut discard = DiscardSink::new();

        let outcome = tokio::select! {
            result = self.executor.run(&self.target, argv, &mut writer, &mut discard) => Some(result),
            _ = cancel.cancelled() => None,
        };
        writer.flush().await?;

        match outcome {
            None => {
                info!("capture cancelled, output written to {}", path.display());
                Ok(())
            }
            Some(Ok(0)) => {
                info!("capture finished, output written to {}", path.display());
                Ok(())
            }
            Some(Ok(code)) => Err(SniffError::RemoteExit(code)),
            Some(Err(e)) => Err(e),
        }
    }

    async fn capture_to_viewer(
        &self,
        argv: &[String],
        viewer: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (program, args) = viewer
            .split_first()
            .ok_or_else(|| SniffError::Config("viewer command must not be empty".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SniffError::Viewer(format!("failed to start {}: {}", program, e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SniffError::Viewer("viewer stdin not available".to_string()))?;

        let executor = self.executor.clone();
        let target = self.target.clone();
        let argv = argv.to_vec();
        let mut relay = RelayTask(tokio::spawn(async move {
            let mut discard = DiscardSink::new();
            executor.run(&target, &argv, &mut stdin, &mut discard).await
        }));

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => Finished::Cancelled,
            result = &mut relay.0 => Finished::Relay(result),
            status = child.wait() => Finished::Viewer(status),
        };

        let status = match finished {
            Finished::Viewer(status) => {
                drop(relay);
                debug!("viewer exited, closing capture channel");
                status
            }
            Finished::Relay(result) => {
                drop(relay);
                match result {
                    Ok(Ok(0)) => debug!("capture finished, waiting for viewer"),
                    // The viewer closed its input; its exit status decides.
                    Ok(Err(SniffError::Io(e))) => debug!("viewer stopped reading: {}", e),
                    other => {
                        let err = match other {
                            Ok(Ok(code)) => SniffError::RemoteExit(code),
                            Ok(Err(e)) => e,
                            Err(e) => SniffError::StreamInterrupted(format!(
                                "capture relay stopped: {}",
                                e
                            )),
                        };
                        warn!("capture relay failed, stopping viewer: {}", err);
                        stop_viewer(&mut child).await;
                        return Err(err);
                    }
                }
                child.wait().await
            }
            Finished::Cancelled => {
                drop(relay);
                info!("capture cancelled, stopping viewer");
                stop_viewer(&mut child).await;
                return Ok(());
            }
        };

        let status =
            status.map_err(|e| SniffError::Viewer(format!("failed to wait for {}: {}", program, e)))?;
        if !status.success() {
            return Err(SniffError::Viewer(format!("{} exited with {}", program, status)));
        }

        Ok(())
    }
}

async fn stop_viewer(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("viewer already gone: {}", e);
    }
    if let Err(e) = child.wait().await {
        debug!("failed to reap viewer: {}", e);
    }
}

/// Aborts the relay, and with it the remote channel, when dropped.
struct RelayTask(JoinHandle<Result<i32>>);

impl Drop for RelayTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Finished {
    Viewer(std::io::Result<ExitStatus>),
    Relay(std::result::Result<Result<i32>, JoinError>),
    Cancelled,
}
