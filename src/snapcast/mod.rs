//! Snapcast adapter: the upstream source of truth for playback state.
//!
//! Grounded on the teacher's `adapters::lms::LmsAdapter` dual-path design
//! (a persistent connection with a dedicated reader loop feeding a
//! notification channel, and a request/response path serialized through a
//! pending-calls table) and its `adapters::handle::RetryConfig` for
//! reconnects, applied here to Snapcast's JSON-RPC-over-line-delimited-TCP
//! control protocol (spec.md §4.3) instead of LMS's CLI protocol.

mod rpc;

use crate::adapters::traits::{AdapterContext, AdapterLogic};
use crate::bus::{BusEvent, SharedBus};
use crate::config::{ClientConfig, SnapcastConfig, ZoneConfig};
use crate::model::{ClientIndex, ZoneIndex};
use crate::store::Stores;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rpc::RpcConnection;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::RwLock;

/// Bidirectional Snapcast-id <-> SnapDog-index bindings, rebuilt on every
/// reconnect from `Server.GetStatus` and the configured entity universe.
#[derive(Default)]
struct IdMaps {
    mac_to_client: HashMap<String, ClientIndex>,
    client_to_snapcast_id: HashMap<ClientIndex, String>,
    group_to_zone: HashMap<String, ZoneIndex>,
    zone_to_group: HashMap<ZoneIndex, String>,
}

/// The live `RpcConnection`, shared between the adapter's own run loop and
/// any [`SnapcastHandle`] clones the router holds, so outbound control calls
/// don't have to go through the adapter task itself.
type SharedConnection = Arc<RwLock<Option<Arc<RpcConnection>>>>;

pub struct SnapcastAdapter {
    config: SnapcastConfig,
    stores: Stores,
    bus: SharedBus,
    zones: Vec<ZoneConfig>,
    clients: Vec<ClientConfig>,
    maps: Arc<RwLock<IdMaps>>,
    connection: SharedConnection,
    call_timeout: Duration,
}

impl SnapcastAdapter {
    pub fn new(
        config: SnapcastConfig,
        stores: Stores,
        bus: SharedBus,
        zones: Vec<ZoneConfig>,
        clients: Vec<ClientConfig>,
    ) -> Self {
        let call_timeout = Duration::from_secs(config.timeout_seconds);
        Self {
            config,
            stores,
            bus,
            zones,
            clients,
            maps: Arc::new(RwLock::new(IdMaps::default())),
            connection: Arc::new(RwLock::new(None)),
            call_timeout,
        }
    }

    /// A cheap, cloneable handle the command router uses to issue outbound
    /// Snapcast calls without going through the adapter's own task.
    pub fn handle(&self) -> SnapcastHandle {
        SnapcastHandle {
            maps: self.maps.clone(),
            connection: self.connection.clone(),
            call_timeout: self.call_timeout,
        }
    }

    /// `Server.GetStatus` seed: populate the id maps and the stores from the
    /// current Snapcast server snapshot. Groups whose member MAC set doesn't
    /// match any configured zone are left unbound and ignored, per spec.md
    /// §4.3's "no auto-registration" rule.
    async fn reconcile(&self, rpc: &RpcConnection) -> Result<()> {
        let status = rpc.call("Server.GetStatus", json!({}), self.call_timeout).await?;
        let server = status
            .get("server")
            .ok_or_else(|| anyhow!("Server.GetStatus missing `server`"))?;

        let mut maps = IdMaps::default();

        let groups = server
            .get("groups")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for group in &groups {
            let group_id = group.get("id").and_then(Value::as_str).unwrap_or_default();
            for client in group.get("clients").and_then(Value::as_array).into_iter().flatten() {
                let mac = client
                    .get("host")
                    .and_then(|h| h.get("mac"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_lowercase();
                let snapcast_id = client.get("id").and_then(Value::as_str).unwrap_or_default();
                if let Some(known) = self.clients.iter().find(|c| c.mac == mac) {
                    let index = ClientIndex(known.index);
                    maps.mac_to_client.insert(mac.clone(), index);
                    maps.client_to_snapcast_id
                        .insert(index, snapcast_id.to_string());
                    self.apply_client_snapshot(index, client).await;
                } else if !mac.is_empty() {
                    tracing::info!(mac = %mac, "snapcast: unknown client MAC, ignoring");
                }
            }

            // Groups are bound only via an explicit `snapcast_group_id` in
            // configuration (spec.md §4.3's "reuse an existing group"
            // establishment policy is a startup-provisioning concern handled
            // outside SnapDog, by the Snapcast server config); an unbound
            // group is simply not reflected into any zone.
            if let Some(zone) = self
                .zones
                .iter()
                .find(|z| z.snapcast_group_id.as_deref() == Some(group_id))
            {
                let index = ZoneIndex(zone.index);
                maps.group_to_zone.insert(group_id.to_string(), index);
                maps.zone_to_group.insert(index, group_id.to_string());
                self.apply_group_snapshot(index, group).await;
            }
        }

        *self.maps.write().await = maps;

        let next_version = self.stores.versions.next();
        let state = {
            let mut global = self.stores.global.write().await;
            global.snapcast_connected = true;
            global.version = next_version;
            global.clone()
        };
        self.bus.publish(BusEvent::GlobalStateChanged { state });

        Ok(())
    }

    async fn apply_client_snapshot(&self, index: ClientIndex, snapshot: &Value) {
        let connected = snapshot
            .get("connected")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let volume = snapshot
            .get("config")
            .and_then(|c| c.get("volume"))
            .and_then(|v| v.get("percent"))
            .and_then(Value::as_u64)
            .unwrap_or(50) as u8;
        let muted = snapshot
            .get("config")
            .and_then(|c| c.get("volume"))
            .and_then(|v| v.get("muted"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let latency_ms = snapshot
            .get("config")
            .and_then(|c| c.get("latency"))
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        let name = snapshot
            .get("config")
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let next_version = self.stores.versions.next();
        let name_for_mutate = name.clone();
        let mutated = self
            .stores
            .clients
            .mutate(&index, move |c| {
                let mut c = c.clone();
                c.connected = connected;
                c.volume = volume;
                c.muted = muted;
                c.latency_ms = latency_ms;
                if let Some(name) = &name_for_mutate {
                    c.name = name.clone();
                }
                c.version = next_version;
                c
            })
            .await;

        let client = match mutated {
            Some((_, new_client)) => Some(new_client),
            None => {
                let config = self.clients.iter().find(|c| ClientIndex(c.index) == index);
                match config {
                    Some(config) => {
                        let mut client = crate::model::Client::new(index, &config.name, &config.mac);
                        client.connected = connected;
                        client.volume = volume;
                        client.muted = muted;
                        client.latency_ms = latency_ms;
                        client.version = next_version;
                        self.stores.clients.insert(index, client.clone()).await;
                        Some(client)
                    }
                    None => None,
                }
            }
        };

        if let Some(client) = client {
            self.bus.publish(BusEvent::ClientChanged { client });
        }
    }

    async fn apply_group_snapshot(&self, index: ZoneIndex, snapshot: &Value) {
        let muted = snapshot
            .get("mute")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let next_version = self.stores.versions.next();
        if let Some((_, zone)) = self
            .stores
            .zones
            .mutate(&index, move |z| {
                let mut z = z.clone();
                z.muted = muted;
                z.version = next_version;
                z
            })
            .await
        {
            self.bus.publish(BusEvent::ZoneChanged { zone });
        }
    }

    async fn handle_notification(&self, method: &str, params: &Value) {
        match method {
            "Client.OnVolumeChanged" | "Client.OnLatencyChanged" | "Client.OnNameChanged"
            | "Client.OnConnect" | "Client.OnDisconnect" => {
                let snapcast_id = params.get("id").and_then(Value::as_str).unwrap_or_default();
                let client = params.get("client").cloned().or_else(|| Some(params.clone()));
                let mac = client
                    .as_ref()
                    .and_then(|c| c.get("host"))
                    .and_then(|h| h.get("mac"))
                    .and_then(Value::as_str)
                    .map(|m| m.to_lowercase());

                let maps = self.maps.read().await;
                let mut index = maps
                    .client_to_snapcast_id
                    .iter()
                    .find(|(_, v)| *v == snapcast_id)
                    .map(|(k, _)| *k);
                // The snapcast id can change across a server restart; fall
                // back to the stable MAC binding when the id is unrecognized.
                if index.is_none() {
                    if let Some(mac) = &mac {
                        index = maps.mac_to_client.get(mac).copied();
                    }
                }
                drop(maps);

                if let (Some(index), Some(client)) = (index, client) {
                    if let Some(mac) = mac {
                        let mut maps = self.maps.write().await;
                        maps.client_to_snapcast_id.insert(index, snapcast_id.to_string());
                        maps.mac_to_client.insert(mac, index);
                    }
                    self.apply_client_snapshot(index, &client).await;
                }
            }
            "Group.OnMute" | "Group.OnStreamChanged" | "Group.OnNameChanged" => {
                let group_id = params.get("id").and_then(Value::as_str).unwrap_or_default();
                let maps = self.maps.read().await;
                let index = maps.group_to_zone.get(group_id).copied();
                drop(maps);
                if let Some(index) = index {
                    self.apply_group_snapshot(index, params).await;
                }
            }
            "Server.OnUpdate" => {
                tracing::info!("snapcast: server update notification received");
            }
            other => {
                tracing::debug!(method = other, "snapcast: unhandled notification");
            }
        }
    }

}

/// Outbound control surface for the command router: resolves a zone/client
/// index to its live Snapcast id and issues the matching RPC. Separate from
/// `SnapcastAdapter` itself so the router can hold a clone without owning
/// the adapter's run loop.
#[derive(Clone)]
pub struct SnapcastHandle {
    maps: Arc<RwLock<IdMaps>>,
    connection: SharedConnection,
    call_timeout: Duration,
}

impl SnapcastHandle {
    async fn rpc(&self) -> Result<Arc<RpcConnection>> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("snapcast is not connected"))
    }

    async fn group_id(&self, zone: ZoneIndex) -> Result<String> {
        self.maps
            .read()
            .await
            .zone_to_group
            .get(&zone)
            .cloned()
            .ok_or_else(|| anyhow!("zone {zone} has no bound snapcast group"))
    }

    async fn snapcast_client_id(&self, client: ClientIndex) -> Result<String> {
        self.maps
            .read()
            .await
            .client_to_snapcast_id
            .get(&client)
            .cloned()
            .ok_or_else(|| anyhow!("client {client} has no bound snapcast id"))
    }

    pub async fn set_group_mute(&self, zone: ZoneIndex, muted: bool) -> Result<()> {
        let group_id = self.group_id(zone).await?;
        self.rpc()
            .await?
            .call("Group.SetMute", json!({"id": group_id, "mute": muted}), self.call_timeout)
            .await?;
        Ok(())
    }

    /// SnapDog has no independent "group volume" concept in the Snapcast
    /// protocol itself (only clients carry a volume); a zone's volume is
    /// realized by applying the same percent to every member client.
    pub async fn set_zone_volume(&self, zone: ZoneIndex, clients: &[ClientIndex], percent: u8) -> Result<()> {
        for client in clients {
            self.set_client_volume(*client, percent).await?;
        }
        let _ = zone;
        Ok(())
    }

    pub async fn set_client_volume(&self, client: ClientIndex, percent: u8) -> Result<()> {
        let snapcast_id = self.snapcast_client_id(client).await?;
        self.rpc()
            .await?
            .call(
                "Client.SetVolume",
                json!({"id": snapcast_id, "volume": {"percent": percent, "muted": false}}),
                self.call_timeout,
            )
            .await?;
        Ok(())
    }

    pub async fn set_client_mute(&self, client: ClientIndex, muted: bool) -> Result<()> {
        let snapcast_id = self.snapcast_client_id(client).await?;
        self.rpc()
            .await?
            .call(
                "Client.SetVolume",
                json!({"id": snapcast_id, "volume": {"percent": 0, "muted": muted}}),
                self.call_timeout,
            )
            .await?;
        Ok(())
    }

    pub async fn set_client_latency(&self, client: ClientIndex, latency_ms: i32) -> Result<()> {
        let snapcast_id = self.snapcast_client_id(client).await?;
        self.rpc()
            .await?
            .call(
                "Client.SetLatency",
                json!({"id": snapcast_id, "latency": latency_ms}),
                self.call_timeout,
            )
            .await?;
        Ok(())
    }

    /// Points a zone's group at the pre-provisioned Snapcast stream matching
    /// `stream_id` (SnapDog never creates streams at runtime, per spec.md
    /// §4.3/§9 — streams are provisioned in the Snapcast server config and
    /// selected, not synthesized).
    pub async fn set_zone_stream(&self, zone: ZoneIndex, stream_id: &str) -> Result<()> {
        let group_id = self.group_id(zone).await?;
        self.rpc()
            .await?
            .call(
                "Group.SetStream",
                json!({"id": group_id, "stream_id": stream_id}),
                self.call_timeout,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AdapterLogic for SnapcastAdapter {
    fn name(&self) -> &'static str {
        "snapcast"
    }

    async fn run(&self, ctx: AdapterContext) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = TcpStream::connect(&addr).await?;
        let mut rpc = RpcConnection::spawn(stream);

        self.reconcile(&rpc.connection).await?;
        *self.connection.write().await = Some(rpc.connection.clone());
        ctx.bus.publish(BusEvent::SnapcastConnected);
        ctx.bus.publish(BusEvent::SnapcastReconciled {
            zone_count: self.zones.len(),
            client_count: self.clients.len(),
        });

        let result = loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => {
                    break Ok(());
                }
                notification = rpc.notifications.recv() => {
                    match notification {
                        Some((method, params)) => self.handle_notification(&method, &params).await,
                        None => break Err(anyhow!("snapcast connection closed")),
                    }
                }
            }
        };

        *self.connection.write().await = None;
        ctx.bus.publish(BusEvent::SnapcastDisconnected);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> SnapcastAdapter {
        SnapcastAdapter::new(
            SnapcastConfig {
                host: "localhost".into(),
                port: 1705,
                timeout_seconds: 5,
            },
            Stores::new(vec![ZoneIndex(1)], vec![ClientIndex(1)]),
            crate::bus::create_bus(),
            vec![ZoneConfig {
                index: 1,
                name: "Kitchen".into(),
                description: None,
                enabled: true,
                snapcast_group_id: Some("group-1".into()),
                knx: Default::default(),
            }],
            vec![ClientConfig {
                index: 1,
                name: "Speaker".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
                default_zone: 1,
                mqtt_base_topic: None,
                knx_enabled: false,
                knx: Default::default(),
            }],
        )
    }

    #[tokio::test]
    async fn apply_client_snapshot_inserts_an_unseen_client_from_configuration() {
        let adapter = adapter();
        let snapshot = json!({
            "connected": true,
            "config": {
                "volume": {"percent": 77, "muted": false},
                "latency": 5,
                "name": "Speaker"
            }
        });
        adapter.apply_client_snapshot(ClientIndex(1), &snapshot).await;
        let client = adapter.stores.clients.get(&ClientIndex(1)).await.unwrap();
        assert_eq!(client.volume, 77);
        assert!(client.connected);
    }

    #[tokio::test]
    async fn apply_group_snapshot_updates_zone_mute() {
        let adapter = adapter();
        adapter
            .stores
            .zones
            .insert(ZoneIndex(1), crate::model::Zone::new(ZoneIndex(1), "Kitchen"))
            .await;
        adapter
            .apply_group_snapshot(ZoneIndex(1), &json!({"mute": true}))
            .await;
        let zone = adapter.stores.zones.get(&ZoneIndex(1)).await.unwrap();
        assert!(zone.muted);
    }
}
