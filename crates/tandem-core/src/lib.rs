//! tandem-core — wire format, chunk codec, and configuration.
//! All other Tandem crates depend on this one.

pub mod codec;
pub mod config;
pub mod wire;

pub use codec::{is_newer, join, split, Chunk};
pub use config::{StreamEndpoint, TandemConfig, TransportMode};
pub use wire::{StreamId, WireError};
