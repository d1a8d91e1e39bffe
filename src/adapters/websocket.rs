//! WebSocket push adapter — `/hubs/snapdog` (spec.md §4.8/§6).
//!
//! Grounded on the teacher's SSE handler (`api::events_handler`: subscribe
//! to the bus, map updates to outbound frames, one task per connection) but
//! upgraded to a full duplex `axum::extract::ws` socket so a client can send
//! subscription-group messages back, which SSE cannot do. Groups are
//! `zone_{idx}`, `client_{idx}`, `system`, matching spec.md §6.

use crate::bus::fanout::{spawn_fanout, StatusEvent};
use crate::bus::SharedBus;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Clone)]
pub struct WebSocketState {
    pub bus: SharedBus,
    pub stores: crate::store::Stores,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { groups: Vec<String> },
    Unsubscribe { groups: Vec<String> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    Zone { group: String, data: &'a crate::model::Zone },
    Client { group: String, data: &'a crate::model::Client },
    System { group: &'static str, data: &'a crate::model::GlobalState },
    Error { group: &'static str, data: ErrorFrame<'a> },
}

#[derive(Debug, Serialize)]
struct ErrorFrame<'a> {
    level: crate::model::ErrorLevel,
    code: &'a str,
    message: &'a str,
    component: &'a str,
}

fn groups_for(event: &StatusEvent) -> Vec<String> {
    match event {
        StatusEvent::ZoneStatus(zone) => vec![format!("zone_{}", zone.index.0)],
        StatusEvent::ClientStatus(client) => vec![format!("client_{}", client.index.0)],
        StatusEvent::GlobalStatus(_) => vec!["system".to_string()],
        StatusEvent::AdapterLag { .. } => vec!["system".to_string()],
        StatusEvent::SystemError { .. } => vec!["system".to_string()],
    }
}

pub async fn ws_handler(
    State(state): State<WebSocketState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WebSocketState) {
    let (mut sender, mut receiver) = socket.split();
    let mut fanout = spawn_fanout(state.bus.clone(), state.stores.clone(), "websocket");
    // Every connection starts subscribed to `system`; zone/client groups are
    // opt-in, matching spec.md §6's "clients subscribe to the groups they
    // care about" contract.
    let mut subscribed: HashSet<String> = HashSet::from(["system".to_string()]);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(msg) = serde_json::from_str::<ClientMessage>(&text) {
                            match msg {
                                ClientMessage::Subscribe { groups } => {
                                    subscribed.extend(groups);
                                }
                                ClientMessage::Unsubscribe { groups } => {
                                    for g in groups {
                                        subscribed.remove(&g);
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
            status = fanout.receiver.recv() => {
                let Some(event) = status else { return };
                if !groups_for(&event).iter().any(|g| subscribed.contains(g)) {
                    continue;
                }
                let frame = match &event {
                    StatusEvent::ZoneStatus(zone) => OutboundFrame::Zone {
                        group: format!("zone_{}", zone.index.0),
                        data: zone,
                    },
                    StatusEvent::ClientStatus(client) => OutboundFrame::Client {
                        group: format!("client_{}", client.index.0),
                        data: client,
                    },
                    StatusEvent::GlobalStatus(global) => OutboundFrame::System {
                        group: "system",
                        data: global,
                    },
                    StatusEvent::SystemError { level, code, message, component } => OutboundFrame::Error {
                        group: "system",
                        data: ErrorFrame { level: *level, code, message, component },
                    },
                    StatusEvent::AdapterLag { .. } => continue,
                };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientIndex, ZoneIndex};

    #[test]
    fn zone_events_map_to_a_single_zone_group() {
        let zone = crate::model::Zone::new(ZoneIndex(4), "Office");
        let groups = groups_for(&StatusEvent::ZoneStatus(zone));
        assert_eq!(groups, vec!["zone_4".to_string()]);
    }

    #[test]
    fn client_events_map_to_a_single_client_group() {
        let client = crate::model::Client::new(ClientIndex(2), "Speaker", "aa:bb:cc:dd:ee:ff");
        let groups = groups_for(&StatusEvent::ClientStatus(client));
        assert_eq!(groups, vec!["client_2".to_string()]);
    }
}
