//! In-memory container used to exercise the exec layer without a cluster.
//!
//! It understands the handful of commands the sniffer issues: the `ls` presence
//! probe run through `/bin/sh -c`, the `tar` archive receiver, and executing a
//! stored file with an executable bit, which replays a scripted capture stream.

use crate::exec::{CommandChannel, RemoteProcess, RemoteReader, RemoteWriter};
use crate::k8s::CaptureTarget;
use crate::{Result, SniffError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tracing::debug;

const DEFAULT_PIPE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub data: Vec<u8>,
    pub mode: u32,
}

impl RemoteFile {
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

#[derive(Debug, Default)]
struct CaptureScript {
    chunks: Vec<Bytes>,
    endless: bool,
    interrupt_after: Option<usize>,
}

#[derive(Debug, Default)]
struct ClusterState {
    files: HashMap<String, RemoteFile>,
    read_only_dirs: HashSet<String>,
    capture: CaptureScript,
    probe_warning: Option<String>,
    commands: Vec<Vec<String>>,
}

/// A single fake container reachable through [`CommandChannel`].
#[derive(Clone)]
pub struct InMemoryCluster {
    target: CaptureTarget,
    pipe_capacity: usize,
    state: Arc<Mutex<ClusterState>>,
    running: Arc<AtomicUsize>,
}

impl InMemoryCluster {
    pub fn new(target: CaptureTarget) -> Self {
        Self {
            target,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            state: Arc::new(Mutex::new(ClusterState::default())),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Capacity of each simulated stream pipe; writers block when it is full.
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity.max(1);
        self
    }

    pub fn with_file(self, path: &str, data: impl Into<Vec<u8>>, mode: u32) -> Self {
        self.state().files.insert(
            path.to_string(),
            RemoteFile {
                data: data.into(),
                mode,
            },
        );
        self
    }

    pub fn with_read_only_dir(self, dir: &str) -> Self {
        self.state().read_only_dirs.insert(normalize_dir(dir));
        self
    }

    /// Chunks written to stdout when an executable file is run.
    pub fn with_capture_output(self, chunks: Vec<Bytes>) -> Self {
        self.state().capture.chunks = chunks;
        self
    }

    /// Repeat the capture chunks until the reader goes away.
    pub fn with_endless_capture(self) -> Self {
        self.state().capture.endless = true;
        self
    }

    /// Drop the connection after `chunks` capture chunks, without a status.
    pub fn with_capture_interrupted_after(self, chunks: usize) -> Self {
        self.state().capture.interrupt_after = Some(chunks);
        self
    }

    /// Emit `warning` on stderr from a successful presence probe.
    pub fn with_probe_warning(self, warning: &str) -> Self {
        self.state().probe_warning = Some(warning.to_string());
        self
    }

    pub fn file(&self, path: &str) -> Option<RemoteFile> {
        self.state().files.get(path).cloned()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state().commands.clone()
    }

    /// Number of commands started whose first argument is `program`.
    pub fn count_commands(&self, program: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(program))
            .count()
    }

    /// Remote commands that have not finished yet.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn execute(
        &self,
        argv: Vec<String>,
        stdin: Option<DuplexStream>,
        mut stdout: DuplexStream,
        mut stderr: DuplexStream,
    ) -> Result<i32> {
        match argv.first().map(String::as_str) {
            Some("/bin/sh") if argv.len() == 3 && argv[1] == "-c" => {
                self.shell(&argv[2], &mut stdout, &mut stderr).await
            }
            Some("tar") => self.extract(&argv, stdin, &mut stderr).await,
            Some(path) => self.run_file(path, &mut stdout).await,
            None => Err(SniffError::CommandNotStarted("empty command".to_string())),
        }
    }

    async fn shell(
        &self,
        script: &str,
        stdout: &mut DuplexStream,
        stderr: &mut DuplexStream,
    ) -> Result<i32> {
        let listed = script.strip_prefix("ls -alt ").and_then(shell_word);
        let path = match listed.as_deref() {
            Some(path) => path,
            None => {
                stderr
                    .write_all(format!("sh: {}: not found\n", script).as_bytes())
                    .await?;
                return Ok(127);
            }
        };

        let (found, warning) = {
            let state = self.state();
            (state.files.get(path).cloned(), state.probe_warning.clone())
        };

        match found {
            Some(file) => {
                let listing = format!(
                    "{} 1 root root {} Jan  1 00:00 {}\n",
                    mode_string(file.mode),
                    file.data.len(),
                    path
                );
                stdout.write_all(listing.as_bytes()).await?;
                if let Some(warning) = warning {
                    stderr.write_all(warning.as_bytes()).await?;
                }
                Ok(0)
            }
            None => {
                stderr
                    .write_all(format!("ls: {}: No such file or directory\n", path).as_bytes())
                    .await?;
                Ok(1)
            }
        }
    }

    async fn extract(
        &self,
        argv: &[String],
        stdin: Option<DuplexStream>,
        stderr: &mut DuplexStream,
    ) -> Result<i32> {
        let dir = match argv.iter().position(|a| a == "-C") {
            Some(i) if i + 1 < argv.len() => normalize_dir(&argv[i + 1]),
            _ => String::from("/"),
        };

        let mut stdin = match stdin {
            Some(s) => s,
            None => {
                stderr.write_all(b"tar: no archive on stdin\n").await?;
                return Ok(2);
            }
        };

        let mut archive = Vec::new();
        stdin.read_to_end(&mut archive).await?;

        let entries = match unpack(&archive) {
            Ok(entries) => entries,
            Err(e) => {
                stderr
                    .write_all(format!("tar: invalid archive: {}\n", e).as_bytes())
                    .await?;
                return Ok(2);
            }
        };

        let read_only = self.state().read_only_dirs.contains(&dir);
        if read_only {
            for (name, _) in &entries {
                let msg = format!("tar: {}: Cannot open: Permission denied\n", name);
                stderr.write_all(msg.as_bytes()).await?;
            }
            return Ok(2);
        }

        {
            let mut state = self.state();
            for (name, file) in entries {
                let path = Path::new(&dir).join(name.trim_start_matches("./"));
                state
                    .files
                    .insert(path.to_string_lossy().into_owned(), file);
            }
        }

        Ok(0)
    }

    async fn run_file(&self, path: &str, stdout: &mut DuplexStream) -> Result<i32> {
        let (file, chunks, endless, interrupt_after) = {
            let state = self.state();
            (
                state.files.get(path).cloned(),
                state.capture.chunks.clone(),
                state.capture.endless,
                state.capture.interrupt_after,
            )
        };

        match file {
            None => {
                return Err(SniffError::CommandNotStarted(format!(
                    "exec: \"{}\": stat {}: no such file or directory",
                    path, path
                )))
            }
            Some(f) if !f.is_executable() => {
                return Err(SniffError::CommandNotStarted(format!(
                    "exec: \"{}\": permission denied",
                    path
                )))
            }
            Some(_) => {}
        }

        let mut sent = 0usize;
        loop {
            for chunk in &chunks {
                if interrupt_after == Some(sent) {
                    return Err(SniffError::StreamInterrupted(
                        "connection reset by peer".to_string(),
                    ));
                }
                if stdout.write_all(chunk).await.is_err() {
                    return Err(SniffError::StreamInterrupted(
                        "reader went away".to_string(),
                    ));
                }
                sent += 1;
            }
            if !endless || chunks.is_empty() {
                break;
            }
        }

        if interrupt_after == Some(sent) {
            return Err(SniffError::StreamInterrupted(
                "connection reset by peer".to_string(),
            ));
        }

        Ok(0)
    }
}

/// Decrements the running counter when a remote command finishes.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandChannel for InMemoryCluster {
    async fn open(
        &self,
        target: &CaptureTarget,
        argv: &[String],
        stdin: bool,
    ) -> Result<RemoteProcess> {
        if *target != self.target {
            return Err(SniffError::Connection(format!(
                "pods \"{}\" not found in namespace \"{}\"",
                target.pod(),
                target.namespace()
            )));
        }

        debug!("in-memory exec on {}: {:?}", target, argv);
        self.state().commands.push(argv.to_vec());

        let (stdout_remote, stdout_local) = duplex(self.pipe_capacity);
        let (stderr_remote, stderr_local) = duplex(self.pipe_capacity);
        let (stdin_local, stdin_remote) = if stdin {
            let (local, remote) = duplex(self.pipe_capacity);
            (Some(local), Some(remote))
        } else {
            (None, None)
        };

        let (status_tx, status_rx) = oneshot::channel();
        self.running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningGuard(self.running.clone());
        let cluster = self.clone();
        let argv = argv.to_vec();

        tokio::spawn(async move {
            let _guard = guard;
            let result = cluster
                .execute(argv, stdin_remote, stdout_remote, stderr_remote)
                .await;
            let _ = status_tx.send(result);
        });

        let completion = async move {
            status_rx.await.unwrap_or_else(|_| {
                Err(SniffError::StreamInterrupted(
                    "remote process vanished".to_string(),
                ))
            })
        };

        Ok(RemoteProcess::new(
            stdin_local.map(|s| Box::new(s) as RemoteWriter),
            Box::new(stdout_local) as RemoteReader,
            Box::new(stderr_local) as RemoteReader,
            completion,
        ))
    }
}

fn unpack(archive: &[u8]) -> std::io::Result<Vec<(String, RemoteFile)>> {
    let mut entries = Vec::new();
    let mut reader = tar::Archive::new(archive);

    for entry in reader.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mode = entry.header().mode()?;
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.push((name, RemoteFile { data, mode }));
    }

    Ok(entries)
}

/// Parses a single `sh` word with quotes and backslash escapes. `None` when
/// the input is more than one word or is unterminated.
fn shell_word(raw: &str) -> Option<String> {
    let mut word = String::new();
    let mut chars = raw.trim().chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next()? {
                    '\'' => break,
                    quoted => word.push(quoted),
                }
            },
            '\\' => word.push(chars.next()?),
            c if c.is_whitespace() => return None,
            c => word.push(c),
        }
    }

    Some(word)
}

fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn mode_string(mode: u32) -> String {
    let mut out = String::from("-");
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}
