//! Per-zone playback state machine and position timer.
//!
//! One [`ZoneManager`] task per configured zone, supervised the way the
//! teacher's `adapters::handle::AdapterHandle` supervises an adapter: a
//! `tokio::select!` over a command queue, a Snapcast-notification queue, and
//! a position tick, torn down via a `CancellationToken` child of the
//! process-wide shutdown token.
//!
//! Position is never read off the wall clock directly in handlers — the
//! manager stores an `(anchor_millis, anchor_position_ms)` pair and
//! extrapolates through the injected [`Clock`], per spec.md §4.4.

use crate::bus::{BusEvent, SharedBus};
use crate::clock::SharedClock;
use crate::media::MediaCatalog;
use crate::model::{PlaybackState, Zone, ZoneIndex};
use crate::store::Stores;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Builds a fresh random permutation of `0..len`, the shuffle order spec.md
/// §4.2 fixes at playlist-load time. Shared with the command router, which
/// builds the same shape of permutation when a playlist is (re)loaded.
pub fn shuffled_order(len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut rand::thread_rng());
    order
}

#[derive(Debug, Clone)]
pub enum ZoneManagerCommand {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    SetVolume(u8),
    SetMute(bool),
    SetShuffle(bool),
    /// Replaces the zone's cached shuffle permutation — sent by the command
    /// router whenever it builds or rotates one, never constructed here.
    SetShuffleOrder(Vec<usize>),
    SetTrackRepeat(bool),
    SetPlaylistRepeat(bool),
    SetPlaylist(u16),
    /// Resolved by the router against the media catalog before being sent
    /// here: points the zone at a concrete track within its current (or a
    /// newly selected) playlist and reanchors position to zero.
    LoadTrack {
        playlist: u16,
        track_index: usize,
        duration_ms: Option<u64>,
    },
    Seek(u64),
    /// Raised by the zone manager's own tick; also used by tests to force a
    /// deterministic step without waiting on real time.
    Tick,
    /// The Snapcast adapter observed the stream underrun/resume.
    SnapcastBuffering(bool),
}

/// Pure transition function: given the current state and an input, what is
/// the next state? Kept free of I/O so the state table in spec.md §4.2 is
/// directly testable.
pub fn transition(current: PlaybackState, cmd: &ZoneManagerCommand) -> PlaybackState {
    use PlaybackState::*;
    use ZoneManagerCommand::*;
    match (current, cmd) {
        (_, Stop) => Stopped,
        (Stopped, Play) | (Paused, Play) => Buffering,
        (Buffering, Play) => Playing,
        (Playing, Pause) => Paused,
        (Buffering, Pause) => Paused,
        (_, SnapcastBuffering(true)) if current == Playing => Buffering,
        (Buffering, SnapcastBuffering(false)) => Playing,
        (s, Tick) => s,
        (s, _) => s,
    }
}

pub struct ZoneManager {
    index: ZoneIndex,
    stores: Stores,
    bus: SharedBus,
    clock: SharedClock,
    media: Arc<MediaCatalog>,
    anchor_millis: i64,
    anchor_position_ms: u64,
}

impl ZoneManager {
    pub fn new(
        index: ZoneIndex,
        stores: Stores,
        bus: SharedBus,
        clock: SharedClock,
        media: Arc<MediaCatalog>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            index,
            stores,
            bus,
            clock,
            media,
            anchor_millis: now,
            anchor_position_ms: 0,
        }
    }

    /// Unclamped wall-clock extrapolation — used to detect that playback has
    /// run past the track's known duration, which `extrapolated_position_ms`
    /// (clamped for display) can never observe.
    fn raw_position_ms(&self, zone: &Zone) -> u64 {
        if zone.state != PlaybackState::Playing {
            return self.anchor_position_ms;
        }
        let elapsed = (self.clock.now_millis() - self.anchor_millis).max(0) as u64;
        self.anchor_position_ms + elapsed
    }

    fn extrapolated_position_ms(&self, zone: &Zone) -> u64 {
        let position = self.raw_position_ms(zone);
        match zone.track_duration_ms {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn reanchor(&mut self, position_ms: u64) {
        self.anchor_millis = self.clock.now_millis();
        self.anchor_position_ms = position_ms;
    }

    pub async fn apply(&mut self, cmd: ZoneManagerCommand) -> Option<Zone> {
        let zone = self.stores.zones.get(&self.index).await?;
        let position_ms = self.extrapolated_position_ms(&zone);
        let next_state = transition(zone.state, &cmd);
        let next_version = self.stores.versions.next();

        let (_, new_zone) = self
            .stores
            .zones
            .mutate(&self.index, |z| {
                let mut z = z.clone();
                z.state = next_state;
                z.position_ms = position_ms;
                match &cmd {
                    ZoneManagerCommand::SetVolume(v) => z.volume = *v,
                    ZoneManagerCommand::SetMute(m) => z.muted = *m,
                    ZoneManagerCommand::SetShuffle(s) => z.shuffle = *s,
                    ZoneManagerCommand::SetShuffleOrder(order) => z.shuffle_order = order.clone(),
                    ZoneManagerCommand::SetTrackRepeat(r) => z.track_repeat = *r,
                    ZoneManagerCommand::SetPlaylistRepeat(r) => z.playlist_repeat = *r,
                    ZoneManagerCommand::Seek(pos) => z.position_ms = *pos,
                    ZoneManagerCommand::LoadTrack { playlist, track_index, duration_ms } => {
                        let new_playlist = crate::model::PlaylistIndex(*playlist);
                        if z.playlist_index != Some(new_playlist) {
                            z.shuffle_order.clear();
                        }
                        z.playlist_index = Some(new_playlist);
                        z.track_index = Some(*track_index);
                        z.track_duration_ms = *duration_ms;
                        z.position_ms = 0;
                    }
                    _ => {}
                }
                z.version = next_version;
                z
            })
            .await?;

        match &cmd {
            ZoneManagerCommand::Seek(pos) => self.reanchor(*pos),
            ZoneManagerCommand::LoadTrack { .. } => self.reanchor(0),
            _ if next_state != zone.state => self.reanchor(position_ms),
            _ => {}
        }

        self.bus.publish(BusEvent::ZoneChanged {
            zone: new_zone.clone(),
        });
        Some(new_zone)
    }

    /// The 1000ms ticker: re-publishes `ZoneChanged` only when the integer
    /// second of the extrapolated position actually changed, per spec.md
    /// §4.5's seed/equality rule for `TRACK_PROGRESS_STATUS`. When the
    /// unclamped position has run past the track's known duration, this
    /// synthesizes the track-ended event spec.md §4.2 requires instead of
    /// just freezing at the clamped position.
    pub async fn tick(&mut self) -> Option<Zone> {
        let zone = self.stores.zones.get(&self.index).await?;
        if zone.state != PlaybackState::Playing {
            return None;
        }
        if let Some(duration) = zone.track_duration_ms {
            if self.raw_position_ms(&zone) >= duration {
                return self.handle_track_ended(zone).await;
            }
        }
        let new_position = self.extrapolated_position_ms(&zone);
        if new_position / 1000 == zone.position_ms / 1000 {
            return None;
        }
        let next_version = self.stores.versions.next();
        let (_, new_zone) = self
            .stores
            .zones
            .mutate(&self.index, |z| {
                let mut z = z.clone();
                z.position_ms = new_position;
                z.version = next_version;
                z
            })
            .await?;
        self.bus.publish(BusEvent::ZoneChanged {
            zone: new_zone.clone(),
        });
        Some(new_zone)
    }

    /// Advances the cursor per spec.md §4.2's end-of-track rules: replay the
    /// same track if `track_repeat` is set, otherwise step to the next track
    /// (drawing from the shuffle permutation if `shuffle` is set), wrapping
    /// to the start when `playlist_repeat` is set and stopping otherwise.
    async fn handle_track_ended(&mut self, zone: Zone) -> Option<Zone> {
        let Some(playlist_index) = zone.playlist_index else {
            return self.force_stop().await;
        };
        let Ok(playlist) = self.media.get_playlist(playlist_index).await else {
            return self.force_stop().await;
        };
        if playlist.tracks.is_empty() {
            return self.force_stop().await;
        }

        let len = playlist.tracks.len();
        let current = zone.track_index.unwrap_or(0).min(len - 1);

        let next_track_index = if zone.track_repeat {
            current
        } else if zone.shuffle {
            let mut order = if zone.shuffle_order.len() == len {
                zone.shuffle_order.clone()
            } else {
                shuffled_order(len)
            };
            let pos = order.iter().position(|&t| t == current).unwrap_or(0) as i64;
            let mut next_pos = pos + 1;
            if next_pos >= len as i64 {
                if !zone.playlist_repeat {
                    return self.force_stop().await;
                }
                next_pos = 0;
                order.rotate_left(1);
            }
            let next_track = order[next_pos as usize];
            self.set_shuffle_order(order).await;
            next_track
        } else {
            let next = current + 1;
            if next >= len {
                if !zone.playlist_repeat {
                    return self.force_stop().await;
                }
                0
            } else {
                next
            }
        };

        let duration_ms = playlist.tracks[next_track_index].duration_ms;
        let next_version = self.stores.versions.next();
        let (_, new_zone) = self
            .stores
            .zones
            .mutate(&self.index, |z| {
                let mut z = z.clone();
                z.track_index = Some(next_track_index);
                z.track_duration_ms = duration_ms;
                z.position_ms = 0;
                z.state = PlaybackState::Playing;
                z.version = next_version;
                z
            })
            .await?;
        self.reanchor(0);
        self.bus.publish(BusEvent::ZoneChanged {
            zone: new_zone.clone(),
        });
        Some(new_zone)
    }

    async fn set_shuffle_order(&self, order: Vec<usize>) {
        let next_version = self.stores.versions.next();
        let _ = self
            .stores
            .zones
            .mutate(&self.index, move |z| {
                let mut z = z.clone();
                z.shuffle_order = order.clone();
                z.version = next_version;
                z
            })
            .await;
    }

    async fn force_stop(&mut self) -> Option<Zone> {
        let next_version = self.stores.versions.next();
        let (_, new_zone) = self
            .stores
            .zones
            .mutate(&self.index, |z| {
                let mut z = z.clone();
                z.state = PlaybackState::Stopped;
                z.position_ms = 0;
                z.version = next_version;
                z
            })
            .await?;
        self.reanchor(0);
        self.bus.publish(BusEvent::ZoneChanged {
            zone: new_zone.clone(),
        });
        Some(new_zone)
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ZoneManagerCommand>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_millis(1000));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(zone = %self.index, "zone manager shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => { self.apply(cmd).await; }
                        None => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_from_stopped_goes_through_buffering() {
        assert_eq!(
            transition(PlaybackState::Stopped, &ZoneManagerCommand::Play),
            PlaybackState::Buffering
        );
        assert_eq!(
            transition(PlaybackState::Buffering, &ZoneManagerCommand::Play),
            PlaybackState::Playing
        );
    }

    #[test]
    fn stop_is_reachable_from_any_state() {
        for state in [
            PlaybackState::Stopped,
            PlaybackState::Playing,
            PlaybackState::Paused,
            PlaybackState::Buffering,
        ] {
            assert_eq!(transition(state, &ZoneManagerCommand::Stop), PlaybackState::Stopped);
        }
    }

    #[test]
    fn snapcast_underrun_only_affects_playing() {
        assert_eq!(
            transition(PlaybackState::Playing, &ZoneManagerCommand::SnapcastBuffering(true)),
            PlaybackState::Buffering
        );
        assert_eq!(
            transition(PlaybackState::Paused, &ZoneManagerCommand::SnapcastBuffering(true)),
            PlaybackState::Paused
        );
    }

    #[tokio::test]
    async fn position_extrapolates_while_playing_and_freezes_on_pause() {
        let clock = std::sync::Arc::new(crate::clock::ManualClock::new(0));
        let bus = crate::bus::create_bus();
        let stores = Stores::new(vec![ZoneIndex(1)], vec![]);
        let mut zone = Zone::new(ZoneIndex(1), "Test");
        zone.track_duration_ms = Some(60_000);
        stores.zones.insert(ZoneIndex(1), zone).await;

        let media = std::sync::Arc::new(crate::media::MediaCatalog::new(
            crate::media::radio_playlist(&[]),
            None,
        ));
        let mut mgr = ZoneManager::new(ZoneIndex(1), stores.clone(), bus, clock.clone(), media);
        mgr.apply(ZoneManagerCommand::Play).await;
        mgr.apply(ZoneManagerCommand::Play).await; // Buffering -> Playing

        clock.advance(Duration::from_millis(2500));
        let snapshot = mgr.tick().await.unwrap();
        assert_eq!(snapshot.position_ms / 1000, 2);

        mgr.apply(ZoneManagerCommand::Pause).await;
        clock.advance(Duration::from_millis(5000));
        let after_pause = stores.zones.get(&ZoneIndex(1)).await.unwrap();
        assert_eq!(after_pause.state, PlaybackState::Paused);
    }

    fn three_track_playlist() -> crate::model::Playlist {
        use crate::model::{Track, RADIO_PLAYLIST};
        crate::model::Playlist {
            index: RADIO_PLAYLIST,
            name: "Test".to_string(),
            tracks: vec![
                Track {
                    id: "t0".into(),
                    title: "T0".into(),
                    artist: None,
                    album: None,
                    duration_ms: Some(1000),
                    cover_art_url: None,
                    stream_url: "u0".into(),
                },
                Track {
                    id: "t1".into(),
                    title: "T1".into(),
                    artist: None,
                    album: None,
                    duration_ms: Some(2000),
                    cover_art_url: None,
                    stream_url: "u1".into(),
                },
                Track {
                    id: "t2".into(),
                    title: "T2".into(),
                    artist: None,
                    album: None,
                    duration_ms: Some(1500),
                    cover_art_url: None,
                    stream_url: "u2".into(),
                },
            ],
        }
    }

    async fn playing_zone_at_track(
        stores: &Stores,
        track_index: usize,
        duration_ms: u64,
        f: impl FnOnce(&mut Zone),
    ) {
        let mut zone = Zone::new(ZoneIndex(1), "Test");
        zone.playlist_index = Some(crate::model::RADIO_PLAYLIST);
        zone.track_index = Some(track_index);
        zone.track_duration_ms = Some(duration_ms);
        zone.state = PlaybackState::Playing;
        f(&mut zone);
        stores.zones.insert(ZoneIndex(1), zone).await;
    }

    #[tokio::test]
    async fn track_ended_advances_to_next_track() {
        let clock = std::sync::Arc::new(crate::clock::ManualClock::new(0));
        let bus = crate::bus::create_bus();
        let stores = Stores::new(vec![ZoneIndex(1)], vec![]);
        playing_zone_at_track(&stores, 0, 1000, |_| {}).await;

        let media = std::sync::Arc::new(crate::media::MediaCatalog::new(three_track_playlist(), None));
        let mut mgr = ZoneManager::new(ZoneIndex(1), stores.clone(), bus, clock.clone(), media);

        clock.advance(Duration::from_millis(1500));
        let snapshot = mgr.tick().await.unwrap();
        assert_eq!(snapshot.track_index, Some(1));
        assert_eq!(snapshot.track_duration_ms, Some(2000));
        assert_eq!(snapshot.position_ms, 0);
        assert_eq!(snapshot.state, PlaybackState::Playing);
    }

    #[tokio::test]
    async fn track_ended_stops_at_last_track_without_playlist_repeat() {
        let clock = std::sync::Arc::new(crate::clock::ManualClock::new(0));
        let bus = crate::bus::create_bus();
        let stores = Stores::new(vec![ZoneIndex(1)], vec![]);
        playing_zone_at_track(&stores, 2, 1500, |_| {}).await;

        let media = std::sync::Arc::new(crate::media::MediaCatalog::new(three_track_playlist(), None));
        let mut mgr = ZoneManager::new(ZoneIndex(1), stores.clone(), bus, clock.clone(), media);

        clock.advance(Duration::from_millis(2000));
        let snapshot = mgr.tick().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Stopped);
        assert_eq!(snapshot.position_ms, 0);
    }

    #[tokio::test]
    async fn track_ended_wraps_when_playlist_repeat_is_on() {
        let clock = std::sync::Arc::new(crate::clock::ManualClock::new(0));
        let bus = crate::bus::create_bus();
        let stores = Stores::new(vec![ZoneIndex(1)], vec![]);
        playing_zone_at_track(&stores, 2, 1500, |z| z.playlist_repeat = true).await;

        let media = std::sync::Arc::new(crate::media::MediaCatalog::new(three_track_playlist(), None));
        let mut mgr = ZoneManager::new(ZoneIndex(1), stores.clone(), bus, clock.clone(), media);

        clock.advance(Duration::from_millis(2000));
        let snapshot = mgr.tick().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert_eq!(snapshot.track_index, Some(0));
        assert_eq!(snapshot.track_duration_ms, Some(1000));
    }

    #[tokio::test]
    async fn track_repeat_replays_the_same_track() {
        let clock = std::sync::Arc::new(crate::clock::ManualClock::new(0));
        let bus = crate::bus::create_bus();
        let stores = Stores::new(vec![ZoneIndex(1)], vec![]);
        playing_zone_at_track(&stores, 1, 2000, |z| z.track_repeat = true).await;

        let media = std::sync::Arc::new(crate::media::MediaCatalog::new(three_track_playlist(), None));
        let mut mgr = ZoneManager::new(ZoneIndex(1), stores.clone(), bus, clock.clone(), media);

        clock.advance(Duration::from_millis(2500));
        let snapshot = mgr.tick().await.unwrap();
        assert_eq!(snapshot.track_index, Some(1));
        assert_eq!(snapshot.track_duration_ms, Some(2000));
        assert_eq!(snapshot.position_ms, 0);
        assert_eq!(snapshot.state, PlaybackState::Playing);
    }

    #[tokio::test]
    async fn track_ended_with_shuffle_draws_from_the_permutation_and_rotates_on_wrap() {
        let clock = std::sync::Arc::new(crate::clock::ManualClock::new(0));
        let bus = crate::bus::create_bus();
        let stores = Stores::new(vec![ZoneIndex(1)], vec![]);
        // Order [2, 0, 1]: track 1 sits last, so ending it wraps the order.
        playing_zone_at_track(&stores, 1, 2000, |z| {
            z.shuffle = true;
            z.playlist_repeat = true;
            z.shuffle_order = vec![2, 0, 1];
        })
        .await;

        let media = std::sync::Arc::new(crate::media::MediaCatalog::new(three_track_playlist(), None));
        let mut mgr = ZoneManager::new(ZoneIndex(1), stores.clone(), bus, clock.clone(), media);

        clock.advance(Duration::from_millis(2500));
        let snapshot = mgr.tick().await.unwrap();
        assert_eq!(snapshot.track_index, Some(0));
        assert_eq!(snapshot.shuffle_order, vec![0, 1, 2]);
    }
}
