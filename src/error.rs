use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Orchestrator phase an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PresenceProbe,
    Upload,
    Capture,
}

impl Phase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::PresenceProbe => "presence probe",
            Phase::Upload => "upload",
            Phase::Capture => "capture",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SniffError {
    #[error("Failed to open remote command channel: {0}")]
    Connection(String),

    #[error("Remote stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Presence probe was inconclusive: {0}")]
    Probe(String),

    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Remote write failed with exit code {exit_code}: {stderr}")]
    RemoteWrite { exit_code: i32, stderr: String },

    #[error("Cannot read local file {}: {}", .path.display(), .source)]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote command could not be started: {0}")]
    CommandNotStarted(String),

    #[error("Remote command exited with status {0}")]
    RemoteExit(i32),

    #[error("Pod not found: {name} in namespace {namespace}")]
    PodNotFound { name: String, namespace: String },

    #[error("Cannot sniff on a container in a completed pod {name}; current phase is {phase}")]
    PodTerminated { name: String, phase: String },

    #[error("No containers in pod {name}")]
    NoContainers { name: String },

    #[error("Container {container} not found in pod {pod}")]
    ContainerNotFound { container: String, pod: String },

    #[error("Kubernetes error: {0}")]
    Kubernetes(String),

    #[error("Viewer error: {0}")]
    Viewer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{phase}: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<SniffError>,
    },
}

impl SniffError {
    /// Tag the error with the phase it happened in. Already tagged errors keep
    /// their original phase.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            tagged @ SniffError::Phase { .. } => tagged,
            other => SniffError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            SniffError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn root_cause(&self) -> &SniffError {
        match self {
            SniffError::Phase { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SniffError>;
