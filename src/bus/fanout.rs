//! Status fan-out: turns store-mutation [`BusEvent`]s into per-adapter,
//! change-detected, coalesced status notifications.
//!
//! Grounded on the teacher's `bus::EventBus` broadcast backbone, but the
//! teacher's `broadcast::Receiver` shares one global capacity and silently
//! skips ahead on `Lagged` (§4.5 in SPEC_FULL.md). spec.md requires each
//! adapter get its own *bounded* queue with an explicit `ADAPTER_LAG` signal
//! and a forced reseed, so each adapter subscribes via [`FanoutHandle`],
//! which pairs the shared broadcast receiver with a dedicated per-adapter
//! `mpsc` queue (capacity 256) and a forwarder task — the same "one
//! dedicated receiver loop per concern" shape as the teacher's
//! `coordinator::AdapterCoordinator::wait_for_acks`.

use crate::bus::{BusEvent, SharedBus};
use crate::model::{Client, ErrorLevel, GlobalState, Zone};
use crate::store::Stores;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const ADAPTER_QUEUE_CAPACITY: usize = 256;
const COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Closed set of status notification kinds. Every adapter renders these the
/// same way regardless of transport (MQTT topic, WebSocket frame, KNX GA).
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    ZoneStatus(Zone),
    ClientStatus(Client),
    GlobalStatus(GlobalState),
    AdapterLag { adapter: &'static str, skipped: u64 },
    SystemError {
        level: ErrorLevel,
        code: &'static str,
        message: String,
        component: &'static str,
    },
}

/// Per-(kind, target) equality gate: only emit if the new snapshot actually
/// differs from the last one sent to this adapter, per spec.md §4.5.
#[derive(Default)]
struct LastSent {
    zones: HashMap<u16, Zone>,
    clients: HashMap<u16, Client>,
    global: Option<GlobalState>,
}

impl LastSent {
    fn changed(&mut self, event: &StatusEvent) -> bool {
        match event {
            StatusEvent::ZoneStatus(zone) => {
                let changed = self.zones.get(&zone.index.0) != Some(zone);
                if changed {
                    self.zones.insert(zone.index.0, zone.clone());
                }
                changed
            }
            StatusEvent::ClientStatus(client) => {
                let changed = self.clients.get(&client.index.0) != Some(client);
                if changed {
                    self.clients.insert(client.index.0, client.clone());
                }
                changed
            }
            StatusEvent::GlobalStatus(state) => {
                let changed = self.global.as_ref() != Some(state);
                if changed {
                    self.global = Some(state.clone());
                }
                changed
            }
            StatusEvent::AdapterLag { .. } | StatusEvent::SystemError { .. } => true,
        }
    }
}

/// Coalescing key: events sharing a key collapse to the latest value within
/// the window. `None` means "never collapse" — adapter lag and system errors
/// are each surfaced individually rather than folded into one another.
fn pending_key(event: &StatusEvent) -> Option<(u8, u16)> {
    match event {
        StatusEvent::ZoneStatus(zone) => Some((0, zone.index.0)),
        StatusEvent::ClientStatus(client) => Some((1, client.index.0)),
        StatusEvent::GlobalStatus(_) => Some((2, 0)),
        StatusEvent::AdapterLag { .. } | StatusEvent::SystemError { .. } => None,
    }
}

fn bus_event_to_status(event: BusEvent) -> Option<StatusEvent> {
    match event {
        BusEvent::ZoneChanged { zone } => Some(StatusEvent::ZoneStatus(zone)),
        BusEvent::ClientChanged { client } => Some(StatusEvent::ClientStatus(client)),
        BusEvent::GlobalStateChanged { state } => Some(StatusEvent::GlobalStatus(state)),
        BusEvent::SystemError { level, code, message, component } => {
            Some(StatusEvent::SystemError { level, code, message, component })
        }
        _ => None,
    }
}

/// One per adapter. Owns a bounded `mpsc` the adapter reads from; the
/// forwarder task handles broadcast subscription, change detection, the
/// 50ms coalescing window, and lag recovery.
pub struct FanoutHandle {
    pub receiver: mpsc::Receiver<StatusEvent>,
}

/// Unconditional full re-emission of every entity's current snapshot, per
/// spec.md §4.5's "seed emit" rule. Used both for the initial send on
/// adapter startup and for the forced reseed after lag recovery — the same
/// walk either way, just triggered at a different moment.
async fn build_seed(stores: &Stores) -> Vec<StatusEvent> {
    let mut seed = Vec::new();
    for zone in stores.zones.get_all().await {
        seed.push(StatusEvent::ZoneStatus(zone));
    }
    for client in stores.clients.get_all().await {
        seed.push(StatusEvent::ClientStatus(client));
    }
    seed.push(StatusEvent::GlobalStatus(stores.global.read().await.clone()));
    seed
}

pub fn spawn_fanout(bus: SharedBus, stores: Stores, adapter: &'static str) -> FanoutHandle {
    let (tx, rx) = mpsc::channel(ADAPTER_QUEUE_CAPACITY);
    let mut bus_rx = bus.subscribe();

    tokio::spawn(async move {
        let mut last = LastSent::default();
        for event in build_seed(&stores).await {
            last.changed(&event);
            if tx.send(event).await.is_err() {
                return;
            }
        }

        let mut pending: Vec<(Option<(u8, u16)>, StatusEvent)> = Vec::new();
        loop {
            let recv = bus_rx.recv();
            tokio::pin!(recv);
            let flush = tokio::time::sleep(COALESCE_WINDOW);
            tokio::pin!(flush);

            tokio::select! {
                result = &mut recv => {
                    match result {
                        Ok(event) => {
                            if let Some(status) = bus_event_to_status(event) {
                                if last.changed(&status) {
                                    let key = pending_key(&status);
                                    match pending.iter_mut().find(|(k, _)| key.is_some() && *k == key) {
                                        Some(slot) => slot.1 = status,
                                        None => pending.push((key, status)),
                                    }
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            pending.clear();
                            let lag = StatusEvent::AdapterLag { adapter, skipped };
                            if tx.send(lag).await.is_err() {
                                return;
                            }
                            // Lag recovery (spec.md §4.5): the adapter's queue was
                            // dropped mid-stream, so any equality-gated diff against
                            // what it last saw is unreliable. Reset the gate and
                            // re-walk every store unconditionally.
                            last = LastSent::default();
                            for event in build_seed(&stores).await {
                                last.changed(&event);
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = &mut flush, if !pending.is_empty() => {
                    for (_, event) in pending.drain(..) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    FanoutHandle { receiver: rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ZoneIndex};

    #[test]
    fn equality_gate_suppresses_unchanged_snapshots() {
        let mut last = LastSent::default();
        let zone = Zone::new(ZoneIndex(1), "Kitchen");
        assert!(last.changed(&StatusEvent::ZoneStatus(zone.clone())));
        assert!(!last.changed(&StatusEvent::ZoneStatus(zone.clone())));
        let mut changed_zone = zone;
        changed_zone.volume = 10;
        assert!(last.changed(&StatusEvent::ZoneStatus(changed_zone)));
    }

    #[tokio::test]
    async fn seed_events_are_delivered_before_live_updates() {
        let bus = crate::bus::create_bus();
        let stores = Stores::new(vec![ZoneIndex(1)], vec![]);
        stores.zones.insert(ZoneIndex(1), Zone::new(ZoneIndex(1), "Kitchen")).await;
        let mut handle = spawn_fanout(bus.clone(), stores, "test");
        let first = handle.receiver.recv().await.unwrap();
        assert!(matches!(first, StatusEvent::ZoneStatus(_)));
    }

    #[tokio::test]
    async fn lag_recovery_reseeds_every_entity() {
        let bus = crate::bus::EventBus::new(2);
        let bus = std::sync::Arc::new(bus);
        let stores = Stores::new(vec![ZoneIndex(1)], vec![]);
        stores.zones.insert(ZoneIndex(1), Zone::new(ZoneIndex(1), "Kitchen")).await;

        let mut handle = spawn_fanout(bus.clone(), stores.clone(), "test");
        // Drain the initial seed (zone + global).
        let _ = handle.receiver.recv().await.unwrap();
        let _ = handle.receiver.recv().await.unwrap();

        // Overflow the broadcast channel's capacity (2) without the forwarder
        // task draining in between, forcing the next recv to see `Lagged`.
        for i in 0..5u16 {
            let mut z = Zone::new(ZoneIndex(1), "Kitchen");
            z.volume = i as u8;
            bus.publish(BusEvent::ZoneChanged { zone: z });
        }

        let mut saw_lag = false;
        let mut saw_reseed_zone = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_millis(200), handle.receiver.recv()).await {
                Ok(Some(StatusEvent::AdapterLag { .. })) => saw_lag = true,
                Ok(Some(StatusEvent::ZoneStatus(_))) if saw_lag => {
                    saw_reseed_zone = true;
                    break;
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert!(saw_lag, "expected an AdapterLag event after overflowing the channel");
        assert!(saw_reseed_zone, "expected a reseed ZoneStatus after the lag event");
    }
}
