//! Core data model: zones, clients, playlists/tracks, and global state.
//!
//! Value types only — `Clone + Serialize + Deserialize + PartialEq`, no
//! interior mutability. Mutation lives in [`crate::store`]; these types are
//! just the shapes the stores hold and hand out.

use serde::{Deserialize, Serialize};

/// 1-based index of a configured zone. Validated at config-load time, so
/// anywhere one of these appears it is already known to be in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneIndex(pub u16);

/// 1-based index of a configured client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIndex(pub u16);

/// 1-based index of a playlist. Playlist 1 is always the synthetic radio
/// playlist; playlists >= 2 are Subsonic-backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlaylistIndex(pub u16);

pub const RADIO_PLAYLIST: PlaylistIndex = PlaylistIndex(1);

impl std::fmt::Display for ZoneIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for ClientIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    Buffering,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_ms: Option<u64>,
    pub cover_art_url: Option<String>,
    /// URL the Snapcast meta-stream actually reads from (radio stream URL or
    /// a Subsonic `/rest/stream` URL). Internal; never exposed verbatim.
    pub stream_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub index: PlaylistIndex,
    pub name: String,
    pub tracks: Vec<Track>,
}

/// Snapshot of one zone's playback state. Produced by the zone manager,
/// stored in [`crate::store::ZoneStore`], and what every surface (HTTP/MQTT/
/// KNX/WebSocket) renders from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub index: ZoneIndex,
    pub name: String,
    pub state: PlaybackState,
    pub playlist_index: Option<PlaylistIndex>,
    pub track_index: Option<usize>,
    pub shuffle: bool,
    /// The shuffle permutation over track indices, fixed when the current
    /// playlist was loaded and rotated on each wraparound (spec.md §4.2).
    /// Internal cursor bookkeeping, not part of the wire representation.
    #[serde(skip)]
    pub shuffle_order: Vec<usize>,
    pub track_repeat: bool,
    pub playlist_repeat: bool,
    /// Extrapolated playback position at the moment of the snapshot.
    pub position_ms: u64,
    pub track_duration_ms: Option<u64>,
    pub volume: u8,
    pub muted: bool,
    /// Set when `Pause` muted the Snapcast group on the zone's behalf (the
    /// caller hadn't muted it already); cleared, and the group un-muted, on
    /// resume. Never part of the wire representation — `muted` above is the
    /// only mute state external surfaces observe.
    #[serde(skip)]
    pub muted_for_pause: bool,
    pub client_indices: Vec<ClientIndex>,
    pub version: u64,
}

impl Zone {
    pub fn new(index: ZoneIndex, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            state: PlaybackState::Stopped,
            playlist_index: None,
            track_index: None,
            shuffle: false,
            shuffle_order: Vec::new(),
            track_repeat: false,
            playlist_repeat: false,
            position_ms: 0,
            track_duration_ms: None,
            volume: 50,
            muted: false,
            muted_for_pause: false,
            client_indices: Vec::new(),
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub index: ClientIndex,
    pub name: String,
    pub mac: String,
    pub connected: bool,
    pub zone_index: Option<ZoneIndex>,
    pub volume: u8,
    pub muted: bool,
    pub latency_ms: i32,
    pub version: u64,
}

impl Client {
    pub fn new(index: ClientIndex, name: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            mac: mac.into(),
            connected: false,
            zone_index: None,
            volume: 50,
            muted: false,
            latency_ms: 0,
            version: 0,
        }
    }
}

/// Severity of a [`LastError`], carried through to the `SYSTEM_ERROR` fan-out
/// event and the structured log line that accompanies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    Warning,
    Error,
}

/// `GlobalState.last_error`, per spec.md §3: the most recent error from any
/// component, regardless of which entity (if any) it concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub timestamp_ms: i64,
    pub level: ErrorLevel,
    pub code: String,
    pub message: String,
    pub component: String,
}

/// `GlobalState.server_stats`: process-level vitals sampled periodically by
/// the stats poller (see `main::spawn_stats_sampler`), not pushed by any
/// adapter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub cpu_percent: f32,
    pub resident_memory_bytes: u64,
    pub uptime_ms: u64,
}

impl ServerStats {
    pub fn zero() -> Self {
        Self {
            cpu_percent: 0.0,
            resident_memory_bytes: 0,
            uptime_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub software_version: String,
    pub build_git_sha: String,
    pub build_timestamp: String,
    pub online: bool,
    pub zone_count: usize,
    pub client_count: usize,
    pub playlist_count: usize,
    pub snapcast_connected: bool,
    pub mqtt_connected: bool,
    pub last_error: Option<LastError>,
    pub server_stats: ServerStats,
    pub version: u64,
}

impl GlobalState {
    pub fn new(zone_count: usize, client_count: usize, playlist_count: usize) -> Self {
        Self {
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            build_git_sha: option_env!("SNAPDOG_BUILD_GIT_SHA")
                .unwrap_or("unknown")
                .to_string(),
            build_timestamp: option_env!("SNAPDOG_BUILD_TIMESTAMP")
                .unwrap_or("unknown")
                .to_string(),
            online: false,
            zone_count,
            client_count,
            playlist_count,
            snapcast_connected: false,
            mqtt_connected: false,
            last_error: None,
            server_stats: ServerStats::zero(),
            version: 0,
        }
    }
}
