//! KNX/IP adapter (spec.md §4.7).
//!
//! No teacher module speaks KNX; grounded on the teacher's general
//! "long-lived adapter task owning its own socket, bridging to `BusEvent`s"
//! shape, applied here to a raw `tokio::net::UdpSocket` tunnel instead of an
//! HTTP/TCP client — the closest analogue in the pack for "talk to a raw
//! socket, not an HTTP client" is the teacher's own `socket2`-based
//! discovery sockets.
//!
//! DPT encodings implemented: 1.001 (bool), 5.001 (0-100 % as a scaled
//! byte), 5.010 (byte index), 9.xxx (KNX 2-byte float, used for latency).
//!
//! Inbound frames carry one leading APCI byte ahead of the 3 GA bytes:
//! `0` = `GroupValueWrite`, `1` = `GroupValueRead`, `2` = `GroupValueResponse`.
//! Reads on a status GA are answered from the cache (§4.7: "a read on a
//! status GA must be answered from the last known value, without going
//! through the command router") rather than treated as a write.

use crate::adapters::traits::{AdapterContext, AdapterLogic};
use crate::bus::fanout::{spawn_fanout, StatusEvent};
use crate::clock::SharedClock;
use crate::command::{Command, Source};
use crate::config::{ClientConfig, GroupAddress, KnxConfig, ZoneConfig};
use crate::model::{ClientIndex, ZoneIndex};
use crate::store::Stores;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const APCI_WRITE: u8 = 0;
const APCI_READ: u8 = 1;
const APCI_RESPONSE: u8 = 2;

pub mod dpt {
    //! Encode/decode for the DPT subset spec.md §4.7 requires.

    /// DPT 1.001 — boolean as a single bit in one byte.
    pub fn encode_bool(value: bool) -> Vec<u8> {
        vec![if value { 0x01 } else { 0x00 }]
    }

    pub fn decode_bool(data: &[u8]) -> Option<bool> {
        data.first().map(|b| *b & 0x01 != 0)
    }

    /// DPT 5.001 — percentage 0-100 scaled to a byte 0-255.
    pub fn encode_percent(value: u8) -> Vec<u8> {
        let clamped = value.min(100) as u16;
        vec![((clamped * 255 + 50) / 100) as u8]
    }

    pub fn decode_percent(data: &[u8]) -> Option<u8> {
        data.first()
            .map(|b| (((*b as u16) * 100 + 127) / 255) as u8)
    }

    /// DPT 5.010 — unscaled byte index (e.g. playlist number).
    pub fn encode_byte_index(value: u8) -> Vec<u8> {
        vec![value]
    }

    pub fn decode_byte_index(data: &[u8]) -> Option<u8> {
        data.first().copied()
    }

    /// DPT 9.xxx — KNX 2-byte float: sign(1) exponent(4) mantissa(11),
    /// value = 0.01 * mantissa * 2^exponent. Used here for latency in ms.
    pub fn encode_float16(value: f32) -> Vec<u8> {
        let scaled = (value * 100.0).round();
        let mut mantissa = scaled as i32;
        let mut exponent: i32 = 0;
        while !(-2048..=2047).contains(&mantissa) {
            mantissa /= 2;
            exponent += 1;
        }
        let sign: u16 = if mantissa < 0 { 0x8000 } else { 0 };
        let mantissa_bits = (mantissa & 0x07FF) as u16;
        let word = sign | ((exponent as u16 & 0x0F) << 11) | mantissa_bits;
        vec![(word >> 8) as u8, (word & 0xFF) as u8]
    }

    pub fn decode_float16(data: &[u8]) -> Option<f32> {
        if data.len() < 2 {
            return None;
        }
        let word = ((data[0] as u16) << 8) | data[1] as u16;
        let sign = (word & 0x8000) != 0;
        let exponent = ((word >> 11) & 0x0F) as i32;
        let raw_mantissa = (word & 0x07FF) as i32;
        let mantissa = if sign { raw_mantissa - 2048 } else { raw_mantissa };
        Some((mantissa as f32) * 0.01 * 2f32.powi(exponent))
    }
}

/// Which direction a group address routes and what it means.
#[derive(Debug, Clone)]
enum GroupBinding {
    ZonePlay(ZoneIndex),
    ZoneVolume(ZoneIndex),
    ZoneMute(ZoneIndex),
    ZoneShuffle(ZoneIndex),
    ZoneTrackRepeat(ZoneIndex),
    ZonePlaylistRepeat(ZoneIndex),
    ZonePlaylist(ZoneIndex),
    ZoneTrack(ZoneIndex),
    ClientVolume(ClientIndex),
    ClientMute(ClientIndex),
    ClientLatency(ClientIndex),
    ClientZone(ClientIndex),
}

pub struct KnxAdapter {
    config: KnxConfig,
    bindings: HashMap<GroupAddress, GroupBinding>,
    /// Reverse index so a status write can find the GA(s) to publish on and
    /// cache, without scanning `bindings`.
    zone_gas: HashMap<ZoneIndex, ZoneKnxGas>,
    client_gas: HashMap<ClientIndex, ClientKnxGas>,
    cache: Arc<Mutex<HashMap<GroupAddress, Vec<u8>>>>,
    command_tx: mpsc::Sender<(Command, Source)>,
    stores: Stores,
    clock: SharedClock,
}

#[derive(Debug, Clone, Default)]
struct ZoneKnxGas {
    play: Option<GroupAddress>,
    volume: Option<GroupAddress>,
    mute: Option<GroupAddress>,
    shuffle: Option<GroupAddress>,
    track_repeat: Option<GroupAddress>,
    playlist_repeat: Option<GroupAddress>,
    playlist: Option<GroupAddress>,
    track: Option<GroupAddress>,
}

#[derive(Debug, Clone, Default)]
struct ClientKnxGas {
    volume: Option<GroupAddress>,
    mute: Option<GroupAddress>,
    latency: Option<GroupAddress>,
    zone: Option<GroupAddress>,
}

impl KnxAdapter {
    pub fn new(
        config: KnxConfig,
        zones: &[ZoneConfig],
        clients: &[ClientConfig],
        command_tx: mpsc::Sender<(Command, Source)>,
        stores: Stores,
        clock: SharedClock,
    ) -> Self {
        let mut bindings = HashMap::new();
        let mut zone_gas = HashMap::new();
        let mut client_gas = HashMap::new();

        for zone in zones {
            let idx = ZoneIndex(zone.index);
            let mut gas = ZoneKnxGas::default();
            let knx = &zone.knx;
            if let Some(ga) = knx.play {
                bindings.insert(ga, GroupBinding::ZonePlay(idx));
                gas.play = Some(ga);
            }
            if let Some(ga) = knx.volume {
                bindings.insert(ga, GroupBinding::ZoneVolume(idx));
                gas.volume = Some(ga);
            }
            if let Some(ga) = knx.mute {
                bindings.insert(ga, GroupBinding::ZoneMute(idx));
                gas.mute = Some(ga);
            }
            if let Some(ga) = knx.shuffle {
                bindings.insert(ga, GroupBinding::ZoneShuffle(idx));
                gas.shuffle = Some(ga);
            }
            if let Some(ga) = knx.track_repeat {
                bindings.insert(ga, GroupBinding::ZoneTrackRepeat(idx));
                gas.track_repeat = Some(ga);
            }
            if let Some(ga) = knx.playlist_repeat {
                bindings.insert(ga, GroupBinding::ZonePlaylistRepeat(idx));
                gas.playlist_repeat = Some(ga);
            }
            if let Some(ga) = knx.playlist {
                bindings.insert(ga, GroupBinding::ZonePlaylist(idx));
                gas.playlist = Some(ga);
            }
            if let Some(ga) = knx.track {
                bindings.insert(ga, GroupBinding::ZoneTrack(idx));
                gas.track = Some(ga);
            }
            zone_gas.insert(idx, gas);
        }

        for client in clients {
            if !client.knx_enabled {
                continue;
            }
            let idx = ClientIndex(client.index);
            let mut gas = ClientKnxGas::default();
            let knx = &client.knx;
            if let Some(ga) = knx.volume {
                bindings.insert(ga, GroupBinding::ClientVolume(idx));
                gas.volume = Some(ga);
            }
            if let Some(ga) = knx.mute {
                bindings.insert(ga, GroupBinding::ClientMute(idx));
                gas.mute = Some(ga);
            }
            if let Some(ga) = knx.latency {
                bindings.insert(ga, GroupBinding::ClientLatency(idx));
                gas.latency = Some(ga);
            }
            if let Some(ga) = knx.zone {
                bindings.insert(ga, GroupBinding::ClientZone(idx));
                gas.zone = Some(ga);
            }
            client_gas.insert(idx, gas);
        }

        Self {
            config,
            bindings,
            zone_gas,
            client_gas,
            cache: Arc::new(Mutex::new(HashMap::new())),
            command_tx,
            stores,
            clock,
        }
    }

    async fn record_error(&self, ctx: &AdapterContext, code: &'static str, message: String) {
        crate::store::record_error(
            &self.stores,
            &ctx.bus,
            self.clock.as_ref(),
            "knx",
            crate::model::ErrorLevel::Warning,
            code,
            message,
        )
        .await;
    }

    fn decode_inbound(&self, ga: GroupAddress, data: &[u8]) -> Option<(Command, Source)> {
        match self.bindings.get(&ga)? {
            GroupBinding::ZonePlay(zone) => {
                let playing = dpt::decode_bool(data)?;
                let cmd = if playing {
                    Command::ZonePlay { zone: *zone }
                } else {
                    Command::ZonePause { zone: *zone }
                };
                Some((cmd, Source::Knx))
            }
            GroupBinding::ZoneVolume(zone) => {
                let percent = dpt::decode_percent(data)?;
                Some((Command::ZoneSetVolume { zone: *zone, volume: percent }, Source::Knx))
            }
            GroupBinding::ZoneMute(zone) => {
                let muted = dpt::decode_bool(data)?;
                Some((Command::ZoneSetMute { zone: *zone, muted }, Source::Knx))
            }
            GroupBinding::ZoneShuffle(zone) => {
                let enabled = dpt::decode_bool(data)?;
                Some((Command::ZoneSetShuffle { zone: *zone, enabled }, Source::Knx))
            }
            GroupBinding::ZoneTrackRepeat(zone) => {
                let enabled = dpt::decode_bool(data)?;
                Some((Command::ZoneSetTrackRepeat { zone: *zone, enabled }, Source::Knx))
            }
            GroupBinding::ZonePlaylistRepeat(zone) => {
                let enabled = dpt::decode_bool(data)?;
                Some((Command::ZoneSetPlaylistRepeat { zone: *zone, enabled }, Source::Knx))
            }
            GroupBinding::ZonePlaylist(zone) => {
                let playlist = dpt::decode_byte_index(data)? as u16;
                Some((Command::ZoneSetPlaylist { zone: *zone, playlist }, Source::Knx))
            }
            GroupBinding::ZoneTrack(zone) => {
                let track_index = dpt::decode_byte_index(data)? as u16;
                Some((Command::ZoneSetTrack { zone: *zone, track_index }, Source::Knx))
            }
            GroupBinding::ClientVolume(client) => {
                let percent = dpt::decode_percent(data)?;
                Some((Command::ClientSetVolume { client: *client, volume: percent }, Source::Knx))
            }
            GroupBinding::ClientMute(client) => {
                let muted = dpt::decode_bool(data)?;
                Some((Command::ClientSetMute { client: *client, muted }, Source::Knx))
            }
            GroupBinding::ClientLatency(client) => {
                let latency_ms = dpt::decode_float16(data)? as i32;
                Some((Command::ClientSetLatency { client: *client, latency_ms }, Source::Knx))
            }
            GroupBinding::ClientZone(client) => {
                let zone = dpt::decode_byte_index(data)? as u16;
                Some((
                    Command::ZoneAssignClient { zone: ZoneIndex(zone), client: *client },
                    Source::Knx,
                ))
            }
        }
    }

    /// Encodes every bound GA for one zone's new status and caches the
    /// encoded payload so a later `GroupValueRead` can be answered without
    /// recomputing it.
    fn zone_status_frames(&self, zone: &crate::model::Zone) -> Vec<(GroupAddress, Vec<u8>)> {
        let Some(gas) = self.zone_gas.get(&zone.index) else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        if let Some(ga) = gas.volume {
            frames.push((ga, dpt::encode_percent(zone.volume)));
        }
        if let Some(ga) = gas.mute {
            frames.push((ga, dpt::encode_bool(zone.muted)));
        }
        if let Some(ga) = gas.play {
            frames.push((ga, dpt::encode_bool(zone.state == crate::model::PlaybackState::Playing)));
        }
        if let Some(ga) = gas.shuffle {
            frames.push((ga, dpt::encode_bool(zone.shuffle)));
        }
        if let Some(ga) = gas.track_repeat {
            frames.push((ga, dpt::encode_bool(zone.track_repeat)));
        }
        if let Some(ga) = gas.playlist_repeat {
            frames.push((ga, dpt::encode_bool(zone.playlist_repeat)));
        }
        if let (Some(ga), Some(playlist)) = (gas.playlist, zone.playlist_index) {
            frames.push((ga, dpt::encode_byte_index(playlist.0.min(255) as u8)));
        }
        if let (Some(ga), Some(track)) = (gas.track, zone.track_index) {
            frames.push((ga, dpt::encode_byte_index(track.min(255) as u8)));
        }
        frames
    }

    fn client_status_frames(&self, client: &crate::model::Client) -> Vec<(GroupAddress, Vec<u8>)> {
        let Some(gas) = self.client_gas.get(&client.index) else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        if let Some(ga) = gas.volume {
            frames.push((ga, dpt::encode_percent(client.volume)));
        }
        if let Some(ga) = gas.mute {
            frames.push((ga, dpt::encode_bool(client.muted)));
        }
        if let Some(ga) = gas.latency {
            frames.push((ga, dpt::encode_float16(client.latency_ms as f32)));
        }
        if let (Some(ga), Some(zone)) = (gas.zone, client.zone_index) {
            frames.push((ga, dpt::encode_byte_index(zone.0.min(255) as u8)));
        }
        frames
    }
}

#[async_trait]
impl AdapterLogic for KnxAdapter {
    fn name(&self) -> &'static str {
        "knx"
    }

    async fn run(&self, ctx: AdapterContext) -> Result<()> {
        let gateway: SocketAddr =
            format!("{}:{}", self.config.gateway_host, self.config.gateway_port).parse()?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(gateway).await?;

        let mut fanout = spawn_fanout(ctx.bus.clone(), self.stores.clone(), "knx");
        let mut buf = [0u8; 512];

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => return Ok(()),
                status = fanout.receiver.recv() => {
                    match status {
                        Some(StatusEvent::ZoneStatus(zone)) => {
                            for (ga, data) in self.zone_status_frames(&zone) {
                                self.cache.lock().insert(ga, data.clone());
                                let _ = send_frame(&socket, APCI_WRITE, ga, &data).await;
                            }
                        }
                        Some(StatusEvent::ClientStatus(client)) => {
                            for (ga, data) in self.client_status_frames(&client) {
                                self.cache.lock().insert(ga, data.clone());
                                let _ = send_frame(&socket, APCI_WRITE, ga, &data).await;
                            }
                        }
                        Some(_) => {}
                        None => return Ok(()),
                    }
                }
                received = socket.recv(&mut buf) => {
                    match received {
                        Ok(n) if n >= 4 => {
                            let apci = buf[0];
                            let ga = GroupAddress(buf[1], buf[2], buf[3]);
                            let data = &buf[4..n];
                            match apci {
                                APCI_READ => {
                                    if let Some(cached) = self.cache.lock().get(&ga).cloned() {
                                        let _ = send_frame(&socket, APCI_RESPONSE, ga, &cached).await;
                                    }
                                }
                                APCI_WRITE | APCI_RESPONSE => {
                                    if let Some((command, source)) = self.decode_inbound(ga, data) {
                                        let _ = self.command_tx.send((command, source)).await;
                                    }
                                }
                                _ => {}
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("knx: udp recv error: {e}");
                            self.record_error(&ctx, "UPSTREAM_UNAVAILABLE", format!("knx udp recv error: {e}")).await;
                        }
                    }
                }
            }
        }
    }
}

async fn send_frame(socket: &UdpSocket, apci: u8, ga: GroupAddress, data: &[u8]) -> std::io::Result<usize> {
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.push(apci);
    frame.push(ga.0);
    frame.push(ga.1);
    frame.push(ga.2);
    frame.extend_from_slice(data);
    socket.send(&frame).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_round_trips() {
        assert_eq!(dpt::decode_bool(&dpt::encode_bool(true)), Some(true));
        assert_eq!(dpt::decode_bool(&dpt::encode_bool(false)), Some(false));
    }

    #[test]
    fn percent_round_trips_within_rounding_tolerance() {
        for v in [0u8, 1, 50, 99, 100] {
            let encoded = dpt::encode_percent(v);
            let decoded = dpt::decode_percent(&encoded).unwrap();
            assert!((decoded as i16 - v as i16).abs() <= 1, "{v} -> {decoded}");
        }
    }

    #[test]
    fn byte_index_round_trips() {
        assert_eq!(dpt::decode_byte_index(&dpt::encode_byte_index(7)), Some(7));
    }

    #[test]
    fn float16_round_trips_latency_values() {
        for v in [0.0f32, 12.5, -40.0, 500.0, -999.0] {
            let encoded = dpt::encode_float16(v);
            let decoded = dpt::decode_float16(&encoded).unwrap();
            assert!((decoded - v).abs() < 1.0, "{v} -> {decoded}");
        }
    }

    fn test_zone(knx: crate::config::ZoneKnxConfig) -> ZoneConfig {
        ZoneConfig {
            index: 1,
            name: "Kitchen".into(),
            description: None,
            enabled: true,
            snapcast_group_id: None,
            knx,
        }
    }

    #[test]
    fn binding_table_only_covers_configured_group_addresses() {
        let knx = crate::config::ZoneKnxConfig {
            volume: Some(GroupAddress(2, 1, 1)),
            ..Default::default()
        };
        let (tx, _rx) = mpsc::channel(1);
        let adapter = KnxAdapter::new(
            KnxConfig { enabled: true, gateway_host: "localhost".into(), gateway_port: 3671 },
            &[test_zone(knx)],
            &[],
            tx,
            Stores::new(vec![ZoneIndex(1)], vec![]),
            crate::clock::system_clock(),
        );
        assert!(adapter.bindings.contains_key(&GroupAddress(2, 1, 1)));
        assert_eq!(adapter.bindings.len(), 1);
    }

    #[test]
    fn group_value_read_is_answered_from_cache_not_the_router() {
        let knx = crate::config::ZoneKnxConfig {
            volume: Some(GroupAddress(2, 1, 1)),
            ..Default::default()
        };
        let (tx, _rx) = mpsc::channel(1);
        let adapter = KnxAdapter::new(
            KnxConfig { enabled: true, gateway_host: "localhost".into(), gateway_port: 3671 },
            &[test_zone(knx)],
            &[],
            tx,
            Stores::new(vec![ZoneIndex(1)], vec![]),
            crate::clock::system_clock(),
        );
        let mut zone = crate::model::Zone::new(ZoneIndex(1), "Kitchen");
        zone.volume = 80;
        let frames = adapter.zone_status_frames(&zone);
        assert_eq!(frames, vec![(GroupAddress(2, 1, 1), dpt::encode_percent(80))]);
    }
}
