//! Media resolver: radio stations (synthetic, playlist 1) and
//! Subsonic-backed playlists (playlists >= 2), per spec.md §4.8.
//!
//! Grounded on the teacher's `adapters::lms_discovery` for the
//! config-driven-enumeration shape and on its `reqwest`-based HTTP polling
//! clients (`adapters::roon`/`adapters::hqplayer` both build a small
//! `reqwest::Client` and deserialize a JSON envelope) for the Subsonic
//! client.

use crate::config::{RadioStationConfig, SubsonicConfig};
use crate::error::SnapDogError;
use crate::model::{Playlist, PlaylistIndex, Track, RADIO_PLAYLIST};
use serde::Deserialize;

/// Builds the single synthetic radio playlist from configuration. Never
/// talks to the network — radio station URLs are played directly by
/// Snapcast's stream machinery.
pub fn radio_playlist(stations: &[RadioStationConfig]) -> Playlist {
    let tracks = stations
        .iter()
        .filter(|s| s.enabled)
        .map(|s| Track {
            id: format!("radio-{}", s.index),
            title: s.name.clone(),
            artist: None,
            album: s.description.clone(),
            duration_ms: None,
            cover_art_url: None,
            stream_url: s.url.clone(),
        })
        .collect();

    Playlist {
        index: RADIO_PLAYLIST,
        name: "Radio".to_string(),
        tracks,
    }
}

#[derive(Debug, Deserialize)]
struct SubsonicEnvelope<T> {
    #[serde(rename = "subsonic-response")]
    response: SubsonicResponse<T>,
}

#[derive(Debug, Deserialize)]
struct SubsonicResponse<T> {
    status: String,
    error: Option<SubsonicError>,
    #[serde(flatten)]
    payload: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SubsonicError {
    code: u32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct PlaylistsPayload {
    playlists: PlaylistsList,
}

#[derive(Debug, Deserialize)]
struct PlaylistsList {
    #[serde(default)]
    playlist: Vec<PlaylistSummary>,
}

#[derive(Debug, Deserialize)]
struct PlaylistSummary {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlaylistDetailPayload {
    playlist: PlaylistDetail,
}

#[derive(Debug, Deserialize)]
struct PlaylistDetail {
    #[serde(default)]
    entry: Vec<SubsonicSong>,
}

#[derive(Debug, Deserialize)]
struct SubsonicSong {
    id: String,
    title: String,
    artist: Option<String>,
    album: Option<String>,
    #[serde(rename = "duration")]
    duration_secs: Option<u64>,
    #[serde(rename = "coverArt")]
    cover_art: Option<String>,
}

/// Thin REST client for the subset of the Subsonic API the resolver needs.
/// Uses a cleartext password parameter (`p=`) rather than the token/salt
/// scheme — acceptable since SnapDog only ever talks to a Subsonic server on
/// the same trusted network, and it avoids pulling in an MD5 dependency the
/// rest of the stack has no other use for.
pub struct SubsonicClient {
    http: reqwest::Client,
    config: SubsonicConfig,
}

const SUBSONIC_API_VERSION: &str = "1.16.1";
const SUBSONIC_CLIENT_NAME: &str = "snapdog";

impl SubsonicClient {
    pub fn new(config: SubsonicConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn auth_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("u", self.config.username.clone()),
            ("p", self.config.password.clone()),
            ("v", SUBSONIC_API_VERSION.to_string()),
            ("c", SUBSONIC_CLIENT_NAME.to_string()),
            ("f", "json".to_string()),
        ]
    }

    async fn get<T>(&self, endpoint: &str, extra: &[(&str, String)]) -> Result<T, SnapDogError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/rest/{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut params = self.auth_params();
        params.extend(extra.iter().map(|(k, v)| (*k, v.clone())));

        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| SnapDogError::upstream_unavailable(format!("subsonic: {e}")))?;

        let envelope: SubsonicEnvelope<T> = response
            .json()
            .await
            .map_err(|e| SnapDogError::upstream_unavailable(format!("subsonic: bad response: {e}")))?;

        if envelope.response.status != "ok" {
            let err = envelope.response.error;
            return Err(SnapDogError::upstream_unavailable(format!(
                "subsonic error {}: {}",
                err.as_ref().map(|e| e.code).unwrap_or(0),
                err.map(|e| e.message).unwrap_or_default()
            )));
        }

        envelope
            .response
            .payload
            .ok_or_else(|| SnapDogError::upstream_unavailable("subsonic: empty payload"))
    }

    pub async fn list_playlists(&self) -> Result<Vec<PlaylistIndex>, SnapDogError> {
        let payload: PlaylistsPayload = self.get("getPlaylists.view", &[]).await?;
        Ok((0..payload.playlists.playlist.len())
            .map(|i| PlaylistIndex(i as u16 + 2))
            .collect())
    }

    /// Resolves playlist `index` (>= 2) to its Subsonic-backed tracks.
    /// `index - 2` is the position in the server's playlist list, matching
    /// spec.md §4.8's "numbered starting at 2 in server order" rule.
    pub async fn resolve_playlist(&self, index: PlaylistIndex) -> Result<Playlist, SnapDogError> {
        if index.0 < 2 {
            return Err(SnapDogError::not_found(format!(
                "playlist {index} is the radio playlist, not Subsonic-backed"
            )));
        }
        let summaries: PlaylistsPayload = self.get("getPlaylists.view", &[]).await?;
        let position = (index.0 - 2) as usize;
        let summary = summaries
            .playlists
            .playlist
            .get(position)
            .ok_or_else(|| SnapDogError::not_found(format!("playlist {index} not found")))?;

        let detail: PlaylistDetailPayload = self
            .get("getPlaylist.view", &[("id", summary.id.clone())])
            .await?;

        let tracks = detail
            .playlist
            .entry
            .into_iter()
            .map(|song| Track {
                id: song.id.clone(),
                title: song.title,
                artist: song.artist,
                album: song.album,
                duration_ms: song.duration_secs.map(|s| s * 1000),
                cover_art_url: song.cover_art.map(|id| format!("/api/v1/cover/{id}")),
                stream_url: self.stream_url(&song.id),
            })
            .collect();

        Ok(Playlist {
            index,
            name: summary.name.clone(),
            tracks,
        })
    }

    fn stream_url(&self, song_id: &str) -> String {
        let params = self.auth_params();
        let query: String = params
            .iter()
            .chain(std::iter::once(&("id", song_id.to_string())))
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!(
            "{}/rest/stream.view?{query}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Resolves an internal `/api/v1/cover/{id}` path back to the real
    /// Subsonic cover-art URL, so the credentials never leave the server.
    pub fn cover_art_url(&self, cover_id: &str) -> String {
        let params = self.auth_params();
        let query: String = params
            .iter()
            .chain(std::iter::once(&("id", cover_id.to_string())))
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!(
            "{}/rest/getCoverArt.view?{query}",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

/// Owns the radio playlist plus an optional Subsonic client and caches
/// resolved playlists so repeated track/playlist navigation within a zone
/// doesn't re-fetch the whole playlist from Subsonic on every `Next`.
///
/// Shared behind an `Arc` between the HTTP surface and [`crate::command::Router`].
pub struct MediaCatalog {
    radio: Playlist,
    subsonic: Option<SubsonicClient>,
    cache: tokio::sync::RwLock<std::collections::HashMap<PlaylistIndex, Playlist>>,
}

impl MediaCatalog {
    pub fn new(radio: Playlist, subsonic: Option<SubsonicClient>) -> Self {
        Self {
            radio,
            subsonic,
            cache: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// All known playlist indices: the radio playlist first, then whatever
    /// Subsonic currently reports (no caching — the playlist *list* can
    /// change independently of any one playlist's contents).
    pub async fn list_playlists(&self) -> Result<Vec<PlaylistIndex>, SnapDogError> {
        let mut indices = vec![RADIO_PLAYLIST];
        if let Some(subsonic) = &self.subsonic {
            indices.extend(subsonic.list_playlists().await?);
        }
        Ok(indices)
    }

    pub async fn get_playlist(&self, index: PlaylistIndex) -> Result<Playlist, SnapDogError> {
        if index == RADIO_PLAYLIST {
            return Ok(self.radio.clone());
        }
        if let Some(cached) = self.cache.read().await.get(&index) {
            return Ok(cached.clone());
        }
        let subsonic = self
            .subsonic
            .as_ref()
            .ok_or_else(|| SnapDogError::not_found(format!("playlist {index} not found")))?;
        let playlist = subsonic.resolve_playlist(index).await?;
        self.cache.write().await.insert(index, playlist.clone());
        Ok(playlist)
    }

    /// Invalidates a cached playlist, e.g. after an external library change
    /// is reported. Nothing currently calls this automatically — Subsonic
    /// library changes are picked up the next time a zone navigates away
    /// from and back onto the playlist.
    pub async fn invalidate(&self, index: PlaylistIndex) {
        self.cache.write().await.remove(&index);
    }

    pub fn cover_art_url(&self, cover_id: &str) -> Option<String> {
        self.subsonic.as_ref().map(|s| s.cover_art_url(cover_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn media_catalog_serves_the_radio_playlist_without_subsonic() {
        let stations = vec![RadioStationConfig {
            index: 1,
            name: "Jazz FM".to_string(),
            url: "http://example.com/jazz.mp3".to_string(),
            description: None,
            enabled: true,
        }];
        let catalog = MediaCatalog::new(radio_playlist(&stations), None);
        let playlist = catalog.get_playlist(RADIO_PLAYLIST).await.unwrap();
        assert_eq!(playlist.tracks.len(), 1);
        assert_eq!(catalog.list_playlists().await.unwrap(), vec![RADIO_PLAYLIST]);
    }

    #[tokio::test]
    async fn media_catalog_rejects_subsonic_playlists_when_unconfigured() {
        let catalog = MediaCatalog::new(radio_playlist(&[]), None);
        assert!(catalog.get_playlist(PlaylistIndex(2)).await.is_err());
    }

    #[test]
    fn radio_playlist_has_no_duration_and_carries_the_configured_url() {
        let stations = vec![RadioStationConfig {
            index: 1,
            name: "Jazz FM".to_string(),
            url: "http://example.com/jazz.mp3".to_string(),
            description: None,
            enabled: true,
        }];
        let playlist = radio_playlist(&stations);
        assert_eq!(playlist.index, RADIO_PLAYLIST);
        assert_eq!(playlist.tracks.len(), 1);
        assert!(playlist.tracks[0].duration_ms.is_none());
        assert_eq!(playlist.tracks[0].stream_url, "http://example.com/jazz.mp3");
    }

    #[test]
    fn cover_art_url_embeds_the_cover_id_and_credentials() {
        let client = SubsonicClient::new(SubsonicConfig {
            base_url: "http://music.local".to_string(),
            username: "snapdog".to_string(),
            password: "secret".to_string(),
        });
        let url = client.cover_art_url("al-123");
        assert!(url.starts_with("http://music.local/rest/getCoverArt.view?"));
        assert!(url.contains("id=al-123"));
    }
}
