//! MQTT adapter: bridges the internal bus to MQTT (spec.md §4.6).
//!
//! Grounded directly on the teacher's `adapters::mqtt::MqttAdapter`: same
//! `rumqttc::AsyncClient`/`EventLoop` split into a poll task and a
//! bus-forwarder task. Extended with `set_last_will` (the teacher has none)
//! and config-driven topic templates (the teacher hardcodes a `match` per
//! `BusEvent` kind; here the shape lives in [`crate::config::MqttConfig`]).

use crate::adapters::traits::{AdapterContext, AdapterLogic};
use crate::bus::fanout::{spawn_fanout, StatusEvent};
use crate::clock::SharedClock;
use crate::command::{Command, Source};
use crate::config::MqttConfig;
use crate::model::{ClientIndex, ErrorLevel, ZoneIndex};
use crate::store::Stores;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttStatus {
    pub connected: bool,
    pub host: String,
    pub port: u16,
}

/// Inbound payload accepted on a zone's command topic.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ZoneCommandPayload {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    SetVolume { volume: u8 },
    SetMute { muted: bool },
    SetShuffle { enabled: bool },
    SetTrackRepeat { enabled: bool },
    SetPlaylistRepeat { enabled: bool },
}

fn payload_to_command(zone: ZoneIndex, payload: ZoneCommandPayload) -> Command {
    match payload {
        ZoneCommandPayload::Play => Command::ZonePlay { zone },
        ZoneCommandPayload::Pause => Command::ZonePause { zone },
        ZoneCommandPayload::Stop => Command::ZoneStop { zone },
        ZoneCommandPayload::Next => Command::ZoneNext { zone },
        ZoneCommandPayload::Previous => Command::ZonePrevious { zone },
        ZoneCommandPayload::SetVolume { volume } => Command::ZoneSetVolume { zone, volume },
        ZoneCommandPayload::SetMute { muted } => Command::ZoneSetMute { zone, muted },
        ZoneCommandPayload::SetShuffle { enabled } => Command::ZoneSetShuffle { zone, enabled },
        ZoneCommandPayload::SetTrackRepeat { enabled } => Command::ZoneSetTrackRepeat { zone, enabled },
        ZoneCommandPayload::SetPlaylistRepeat { enabled } => {
            Command::ZoneSetPlaylistRepeat { zone, enabled }
        }
    }
}

/// Inbound payload accepted on a client's command topic.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientCommandPayload {
    SetVolume { volume: u8 },
    SetMute { muted: bool },
    SetLatency { latency_ms: i32 },
    SetZone { zone: u16 },
}

fn payload_to_client_command(client: ClientIndex, payload: ClientCommandPayload) -> Command {
    match payload {
        ClientCommandPayload::SetVolume { volume } => Command::ClientSetVolume { client, volume },
        ClientCommandPayload::SetMute { muted } => Command::ClientSetMute { client, muted },
        ClientCommandPayload::SetLatency { latency_ms } => {
            Command::ClientSetLatency { client, latency_ms }
        }
        ClientCommandPayload::SetZone { zone } => Command::ZoneAssignClient {
            zone: ZoneIndex(zone),
            client,
        },
    }
}

pub struct MqttAdapter {
    config: MqttConfig,
    command_tx: mpsc::Sender<(Command, Source)>,
    stores: Stores,
    clock: SharedClock,
}

impl MqttAdapter {
    pub fn new(
        config: MqttConfig,
        command_tx: mpsc::Sender<(Command, Source)>,
        stores: Stores,
        clock: SharedClock,
    ) -> Self {
        Self { config, command_tx, stores, clock }
    }

    async fn record_error(&self, ctx: &AdapterContext, code: &'static str, message: String) {
        crate::store::record_error(
            &self.stores,
            &ctx.bus,
            self.clock.as_ref(),
            "mqtt",
            ErrorLevel::Warning,
            code,
            message,
        )
        .await;
    }

    /// Extracts the numeric index out of a concrete topic given the
    /// `{placeholder}`-bearing template it was subscribed under. Shared by
    /// zone (`{zone}`) and client (`{client}`) command topics.
    fn parse_index(topic: &str, template: &str, placeholder: &str) -> Option<u16> {
        let prefix = template.split(placeholder).next()?;
        let suffix = template.split(placeholder).nth(1)?;
        let rest = topic.strip_prefix(prefix)?;
        let digits = rest.strip_suffix(suffix)?;
        digits.parse().ok()
    }

    fn parse_zone_index(topic: &str, template: &str) -> Option<ZoneIndex> {
        Self::parse_index(topic, template, "{zone}").map(ZoneIndex)
    }

    fn parse_client_index(topic: &str, template: &str) -> Option<ClientIndex> {
        Self::parse_index(topic, template, "{client}").map(ClientIndex)
    }

    fn status_event_to_mqtt(&self, event: &StatusEvent) -> Option<(String, bool, serde_json::Value)> {
        match event {
            StatusEvent::ZoneStatus(zone) => Some((
                self.config.zone_state_topic(zone.index.0),
                true,
                serde_json::json!({
                    "index": zone.index.0,
                    "name": zone.name,
                    "state": zone.state,
                    "volume": zone.volume,
                    "muted": zone.muted,
                    "shuffle": zone.shuffle,
                    "track_repeat": zone.track_repeat,
                    "playlist_repeat": zone.playlist_repeat,
                    "position_ms": zone.position_ms,
                    "playlist_index": zone.playlist_index.map(|p| p.0),
                }),
            )),
            StatusEvent::ClientStatus(client) => Some((
                self.config.client_state_topic(client.index.0),
                true,
                serde_json::json!({
                    "index": client.index.0,
                    "name": client.name,
                    "connected": client.connected,
                    "volume": client.volume,
                    "muted": client.muted,
                    "latency_ms": client.latency_ms,
                    "zone_index": client.zone_index.map(|z| z.0),
                }),
            )),
            StatusEvent::GlobalStatus(state) => Some((
                self.config.system_status_topic(),
                true,
                serde_json::json!({
                    "status": "online",
                    "software_version": state.software_version,
                    "snapcast_connected": state.snapcast_connected,
                    "last_error": state.last_error,
                    "server_stats": state.server_stats,
                }),
            )),
            StatusEvent::AdapterLag { .. } => None,
            StatusEvent::SystemError { level, code, message, component } => Some((
                format!("{}/system/error", self.config.topic_prefix),
                false,
                serde_json::json!({
                    "level": level,
                    "code": code,
                    "message": message,
                    "component": component,
                }),
            )),
        }
    }
}

#[async_trait]
impl AdapterLogic for MqttAdapter {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn run(&self, ctx: AdapterContext) -> Result<()> {
        let mut options = MqttOptions::new(self.config.client_id.clone(), &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user, pass);
        }
        options.set_last_will(LastWill::new(
            self.config.system_status_topic(),
            serde_json::json!({"status": "offline"}).to_string(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        client
            .subscribe(self.config.zone_command_subscription(), QoS::AtMostOnce)
            .await
            .map_err(|e| anyhow!("mqtt subscribe failed: {e}"))?;
        client
            .subscribe(self.config.client_command_subscription(), QoS::AtMostOnce)
            .await
            .map_err(|e| anyhow!("mqtt subscribe failed: {e}"))?;
        client
            .publish(
                self.config.system_status_topic(),
                QoS::AtLeastOnce,
                true,
                serde_json::json!({"status": "online"}).to_string(),
            )
            .await
            .map_err(|e| anyhow!("mqtt publish failed: {e}"))?;

        let mut fanout = spawn_fanout(ctx.bus.clone(), self.stores.clone(), "mqtt");
        let command_tx = self.command_tx.clone();
        let zone_command_template = self.config.zone_command_topic.clone();
        let client_command_template = self.config.client_command_topic.clone();

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {
                    let _ = client.publish(
                        self.config.system_status_topic(),
                        QoS::AtLeastOnce,
                        true,
                        serde_json::json!({"status": "offline"}).to_string(),
                    ).await;
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                status = fanout.receiver.recv() => {
                    match status {
                        Some(event) => {
                            if let Some((topic, retain, payload)) = self.status_event_to_mqtt(&event) {
                                let body = serde_json::to_vec(&payload).unwrap_or_default();
                                if let Err(e) = client.publish(topic, QoS::AtMostOnce, retain, body).await {
                                    tracing::warn!("mqtt publish failed: {e}");
                                }
                            }
                        }
                        None => return Ok(()),
                    }
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            if let Some(zone) = Self::parse_zone_index(&publish.topic, &zone_command_template) {
                                match serde_json::from_slice::<ZoneCommandPayload>(&publish.payload) {
                                    Ok(payload) => {
                                        let command = payload_to_command(zone, payload);
                                        let _ = command_tx.send((command, Source::Mqtt)).await;
                                    }
                                    Err(e) => {
                                        tracing::warn!("mqtt: bad zone command payload: {e}");
                                        self.record_error(
                                            &ctx,
                                            "MQTT_PARSE",
                                            format!("bad zone command payload on {}: {e}", publish.topic),
                                        )
                                        .await;
                                    }
                                }
                            } else if let Some(client_idx) =
                                Self::parse_client_index(&publish.topic, &client_command_template)
                            {
                                match serde_json::from_slice::<ClientCommandPayload>(&publish.payload) {
                                    Ok(payload) => {
                                        let command = payload_to_client_command(client_idx, payload);
                                        let _ = command_tx.send((command, Source::Mqtt)).await;
                                    }
                                    Err(e) => {
                                        tracing::warn!("mqtt: bad client command payload: {e}");
                                        self.record_error(
                                            &ctx,
                                            "MQTT_PARSE",
                                            format!("bad client command payload on {}: {e}", publish.topic),
                                        )
                                        .await;
                                    }
                                }
                            }
                        }
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            tracing::info!("mqtt connected to {}:{}", self.config.host, self.config.port);
                        }
                        Ok(Event::Incoming(Incoming::Disconnect)) => {
                            tracing::warn!("mqtt disconnected");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow!("mqtt event loop error: {e}"));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MqttConfig {
        MqttConfig {
            enabled: true,
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            client_id: "snapdog".into(),
            topic_prefix: "snapdog".into(),
            zone_state_topic: "zone/{zone}/state".into(),
            zone_command_topic: "zone/{zone}/command".into(),
            client_state_topic: "client/{client}/state".into(),
            client_command_topic: "client/{client}/command".into(),
            system_status_topic: "system/status".into(),
        }
    }

    #[test]
    fn topic_templates_expand_with_the_zone_index() {
        let config = test_config();
        assert_eq!(config.zone_state_topic(3), "snapdog/zone/3/state");
        assert_eq!(config.zone_command_subscription(), "snapdog/zone/+/command");
    }

    #[test]
    fn parses_zone_index_back_out_of_a_concrete_command_topic() {
        let config = test_config();
        let topic = format!("zone/{}/command", 7);
        let parsed = MqttAdapter::parse_zone_index(&topic, &config.zone_command_topic);
        assert_eq!(parsed, Some(ZoneIndex(7)));
    }

    #[test]
    fn parses_client_index_back_out_of_a_concrete_command_topic() {
        let config = test_config();
        let topic = format!("client/{}/command", 3);
        let parsed = MqttAdapter::parse_client_index(&topic, &config.client_command_topic);
        assert_eq!(parsed, Some(ClientIndex(3)));
    }

    #[test]
    fn command_payload_deserializes_tagged_action() {
        let json = r#"{"action":"set_volume","volume":42}"#;
        let payload: ZoneCommandPayload = serde_json::from_str(json).unwrap();
        let cmd = payload_to_command(ZoneIndex(1), payload);
        assert_eq!(
            cmd,
            Command::ZoneSetVolume {
                zone: ZoneIndex(1),
                volume: 42
            }
        );
    }

    #[test]
    fn client_command_payload_deserializes_tagged_action() {
        let json = r#"{"action":"set_zone","zone":2}"#;
        let payload: ClientCommandPayload = serde_json::from_str(json).unwrap();
        let cmd = payload_to_client_command(ClientIndex(4), payload);
        assert_eq!(
            cmd,
            Command::ZoneAssignClient {
                zone: ZoneIndex(2),
                client: ClientIndex(4),
            }
        );
    }
}
