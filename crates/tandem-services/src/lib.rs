//! tandem-services — the streaming transport core.
//!
//! Reassembly, multiplexing over UDP, toggle replication and the overlay
//! state machine, wired together by `PeerSession`.

pub mod frame;
pub mod mux;
pub mod outbox;
pub mod overlay;
pub mod reassembly;
pub mod session;
pub mod sink;
pub mod stats;
pub mod toggle;
pub mod transport;

pub use frame::Frame;
pub use mux::{InboundRoutes, StreamMultiplexer, StreamStatus};
pub use outbox::Outbox;
pub use overlay::{blend, OverlaySession, RenderDecision, RenderMode};
pub use reassembly::{FrameReassembler, ReassemblyError};
pub use session::PeerSession;
pub use sink::{MediaSink, NullSink};
pub use stats::{StatsRegistry, StatsSnapshot, StreamStats};
pub use toggle::{StateSynchronizer, ToggleState};
pub use transport::{SendError, TransportChannel, TransportError};
