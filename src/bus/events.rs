//! The canonical bus event type.
//!
//! Grounded on the teacher's `bus::events::BusEvent` — a closed,
//! `#[serde(tag = "type", content = "payload")]` enum spanning zone
//! lifecycle, now-playing/volume changes, command request/response, adapter
//! lifecycle, and system events. Generalized from the teacher's
//! Roon/LMS/HQPlayer-specific variants to SnapDog's Zone/Client/GlobalState
//! model and its closed [`crate::command::Command`] set.

use crate::command::{Command, Source};
use crate::model::{Client, ClientIndex, ErrorLevel, GlobalState, Zone, ZoneIndex};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[allow(clippy::large_enum_variant)]
pub enum BusEvent {
    ZoneChanged {
        zone: Zone,
    },
    ClientChanged {
        client: Client,
    },
    GlobalStateChanged {
        state: GlobalState,
    },

    CommandReceived {
        command: Command,
        source: Source,
    },
    CommandResult {
        source: Source,
        success: bool,
        error_code: Option<String>,
        error_message: Option<String>,
    },

    SnapcastConnected,
    SnapcastDisconnected,
    SnapcastReconciled {
        zone_count: usize,
        client_count: usize,
    },

    AdapterConnected {
        adapter: &'static str,
    },
    AdapterDisconnected {
        adapter: &'static str,
    },
    AdapterLag {
        adapter: &'static str,
        skipped: u64,
    },
    AdapterStopped {
        adapter: &'static str,
    },

    SystemShuttingDown {
        reason: Option<String>,
    },

    /// Mirrors `GlobalStore.LastError` (spec.md §7): every error, from a
    /// rejected command or an adapter failure, produces exactly one of
    /// these alongside whatever typed `Result` the originating call site
    /// also returns.
    SystemError {
        level: ErrorLevel,
        code: &'static str,
        message: String,
        component: &'static str,
    },
}

impl BusEvent {
    pub fn zone_index(&self) -> Option<ZoneIndex> {
        match self {
            BusEvent::ZoneChanged { zone } => Some(zone.index),
            _ => None,
        }
    }

    pub fn client_index(&self) -> Option<ClientIndex> {
        match self {
            BusEvent::ClientChanged { client } => Some(client.index),
            _ => None,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, BusEvent::SystemShuttingDown { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlaybackState;

    #[test]
    fn zone_index_extraction() {
        let zone = Zone::new(ZoneIndex(3), "Kitchen");
        let event = BusEvent::ZoneChanged { zone: zone.clone() };
        assert_eq!(event.zone_index(), Some(ZoneIndex(3)));
        assert_eq!(zone.state, PlaybackState::Stopped);
    }

    #[test]
    fn shutdown_event_is_recognized() {
        let event = BusEvent::SystemShuttingDown { reason: None };
        assert!(event.is_shutdown());
    }
}
