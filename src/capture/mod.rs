pub mod session;
pub mod sniffer;

pub use session::{BinaryPresence, CaptureSession, Destination, SessionState, SinkKind};
pub use sniffer::Sniffer;
