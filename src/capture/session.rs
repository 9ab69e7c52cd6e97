use std::fmt;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    BinaryChecked,
    BinaryReady,
    Capturing,
    Done,
}

impl SessionState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::BinaryChecked => "binary-checked",
            SessionState::BinaryReady => "binary-ready",
            SessionState::Capturing => "capturing",
            SessionState::Done => "done",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryPresence {
    Unknown,
    Present,
    Absent,
}

/// Where the live capture stream goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Created or truncated, then written with the raw pcap stream.
    File(PathBuf),
    /// Spawned process (program followed by arguments) fed on stdin.
    Viewer(Vec<String>),
}

impl Destination {
    pub fn kind(&self) -> SinkKind {
        match self {
            Destination::File(_) => SinkKind::File,
            Destination::Viewer(_) => SinkKind::Viewer,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::File(path) => write!(f, "file {}", path.display()),
            Destination::Viewer(argv) => write!(f, "viewer '{}'", argv.join(" ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    File,
    Viewer,
}

/// Invocation-local progress of a capture. Never persisted: every run
/// re-probes the container.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    state: SessionState,
    presence: BinaryPresence,
    upload_attempted: bool,
    filter: String,
    destination: Option<Destination>,
}

impl CaptureSession {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            state: SessionState::Idle,
            presence: BinaryPresence::Unknown,
            upload_attempted: false,
            filter: filter.into(),
            destination: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn presence(&self) -> BinaryPresence {
        self.presence
    }

    pub fn upload_attempted(&self) -> bool {
        self.upload_attempted
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn sink_kind(&self) -> Option<SinkKind> {
        self.destination.as_ref().map(Destination::kind)
    }

    pub(crate) fn binary_checked(&mut self, presence: BinaryPresence) {
        self.presence = presence;
        self.advance(SessionState::BinaryChecked);
    }

    pub(crate) fn upload_started(&mut self) {
        self.upload_attempted = true;
    }

    pub(crate) fn binary_ready(&mut self) {
        self.presence = BinaryPresence::Present;
        self.advance(SessionState::BinaryReady);
    }

    pub(crate) fn capturing(&mut self, destination: Destination) {
        self.destination = Some(destination);
        self.advance(SessionState::Capturing);
    }

    pub(crate) fn done(&mut self) {
        self.advance(SessionState::Done);
    }

    /// States only move forward; a backwards request is ignored.
    fn advance(&mut self, next: SessionState) {
        if next > self.state {
            debug!("capture session: {} -> {}", self.state, next);
            self.state = next;
        }
    }
}
