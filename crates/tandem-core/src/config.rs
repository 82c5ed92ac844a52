//! Configuration system for Tandem.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TANDEM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tandem/config.toml
//!   3. ~/.config/tandem/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{StreamId, DEFAULT_CHUNK_SIZE, MAX_CHUNK_PAYLOAD};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    pub peer: PeerConfig,
    pub transport: TransportConfig,
    pub state: StateConfig,
    pub overlay: OverlayConfig,
    pub capture: CaptureConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Address of the other peer.
    pub remote_address: IpAddr,
    /// Base port on the remote side.
    pub remote_port: u16,
    /// Base port to bind locally.
    pub local_port: u16,
}

/// How logical streams map onto UDP sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// One socket per stream on `base + offset`.
    Dedicated,
    /// One socket on the base port; datagrams carry a stream tag.
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// Payload bytes per chunk, excluding the header.
    pub max_chunk_size: usize,
    /// Incomplete frames older than this are purged.
    pub frame_timeout_ms: u64,
    /// SO_SNDBUF / SO_RCVBUF for every transport socket. 0 = OS default.
    pub socket_buffer_bytes: usize,
    /// Frames queued per outbound stream before the oldest is dropped.
    pub outbox_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Periodic resend of the local toggle.
    pub resend_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Weight of the secondary (remote back) frame when blending.
    pub alpha_weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Frames per second produced by the daemon's synthetic source. 0 = off.
    pub synthetic_fps: u32,
    pub synthetic_frame_bytes: usize,
    pub synthetic_audio_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    /// Local HTTP port, bound on 127.0.0.1.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            remote_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_port: 12345,
            local_port: 12345,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Dedicated,
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            frame_timeout_ms: 500,
            socket_buffer_bytes: 65535,
            outbox_depth: 4,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            resend_interval_ms: 200,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self { alpha_weight: 0.3 }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            synthetic_fps: 15,
            synthetic_frame_bytes: 4000,
            synthetic_audio_bytes: 2048,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7700,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl TransportConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl StateConfig {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }
}

/// One logical stream's addressing, fixed for the session lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub stream_id: StreamId,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,
}

impl StreamEndpoint {
    pub fn local_addr(&self) -> SocketAddr {
        let unspecified = match self.remote_address {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(unspecified, self.local_port)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }
}

impl TandemConfig {
    /// Endpoint for a stream under the configured transport mode.
    ///
    /// Dedicated mode offsets both ports by the stream's port offset; shared
    /// mode puts every stream on the base ports. A base port of 0 stays 0
    /// (OS-assigned) on the local side.
    pub fn endpoint(&self, stream_id: StreamId) -> StreamEndpoint {
        let offset = match self.transport.mode {
            TransportMode::Dedicated => stream_id.port_offset(),
            TransportMode::Shared => 0,
        };
        let local_port = if self.peer.local_port == 0 {
            0
        } else {
            self.peer.local_port.wrapping_add(offset)
        };
        StreamEndpoint {
            stream_id,
            local_port,
            remote_address: self.peer.remote_address,
            remote_port: self.peer.remote_port.wrapping_add(offset),
        }
    }

    /// Reject values the transport cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transport;
        if t.max_chunk_size == 0 || t.max_chunk_size > MAX_CHUNK_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "transport.max_chunk_size must be 1..={MAX_CHUNK_PAYLOAD}, got {}",
                t.max_chunk_size
            )));
        }
        if t.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.frame_timeout_ms must be non-zero".into(),
            ));
        }
        if t.outbox_depth == 0 {
            return Err(ConfigError::Invalid(
                "transport.outbox_depth must be non-zero".into(),
            ));
        }
        if self.state.resend_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "state.resend_interval_ms must be non-zero".into(),
            ));
        }
        let alpha = self.overlay.alpha_weight;
        if !(0.0..=1.0).contains(&alpha) {
            return Err(ConfigError::Invalid(format!(
                "overlay.alpha_weight must be within 0..=1, got {alpha}"
            )));
        }
        if self.transport.mode == TransportMode::Dedicated {
            let top = StreamId::ALL.len() as u16 - 1;
            if self.peer.local_port.checked_add(top).is_none()
                || self.peer.remote_port.checked_add(top).is_none()
            {
                return Err(ConfigError::Invalid(
                    "base ports leave no room for per-stream offsets".into(),
                ));
            }
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tandem")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TandemConfig {
    /// Load config: env vars → file → defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TandemConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TANDEM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TandemConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TANDEM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("TANDEM_PEER__REMOTE_ADDRESS") {
            if let Ok(addr) = v.parse() {
                self.peer.remote_address = addr;
            }
        }
        if let Some(v) = var("TANDEM_PEER__REMOTE_PORT") {
            if let Ok(p) = v.parse() {
                self.peer.remote_port = p;
            }
        }
        if let Some(v) = var("TANDEM_PEER__LOCAL_PORT") {
            if let Ok(p) = v.parse() {
                self.peer.local_port = p;
            }
        }
        if let Some(v) = var("TANDEM_TRANSPORT__MODE") {
            match v.as_str() {
                "dedicated" => self.transport.mode = TransportMode::Dedicated,
                "shared" => self.transport.mode = TransportMode::Shared,
                _ => {}
            }
        }
        if let Some(v) = var("TANDEM_TRANSPORT__MAX_CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transport.max_chunk_size = n;
            }
        }
        if let Some(v) = var("TANDEM_OVERLAY__ALPHA_WEIGHT") {
            if let Ok(a) = v.parse() {
                self.overlay.alpha_weight = a;
            }
        }
        if let Some(v) = var("TANDEM_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
    }
}
