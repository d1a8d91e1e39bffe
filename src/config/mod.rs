//! Configuration loading.
//!
//! `spec.md §6` requires an enumerated `SNAPDOG_`-prefixed schema with
//! contiguous 1-based numeric indices (`SNAPDOG_ZONE_1_NAME`,
//! `SNAPDOG_ZONE_2_NAME`, ... stopping at the first gap). That shape doesn't
//! fit a generic deserializer, so unlike the teacher's `config`-crate-backed
//! loader this one walks `std::env::vars()` directly and assembles a typed
//! [`Config`].

use crate::error::SnapDogError;
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

/// A KNX group address, `main/middle/sub`. Lives here (not in `adapters::knx`)
/// because it's a config value parsed straight out of `SNAPDOG_*_KNX_*`
/// strings, same as every other `ClientConfig`/`ZoneConfig` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupAddress(pub u8, pub u8, pub u8);

impl GroupAddress {
    pub fn to_u16(self) -> u16 {
        ((self.0 as u16 & 0x1F) << 11) | ((self.1 as u16 & 0x07) << 8) | self.2 as u16
    }
}

impl FromStr for GroupAddress {
    type Err = SnapDogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let [a, b, c] = parts[..] else {
            return Err(SnapDogError::config(format!("invalid KNX group address {s:?}")));
        };
        let parse = |v: &str| {
            v.parse::<u8>()
                .map_err(|_| SnapDogError::config(format!("invalid KNX group address {s:?}")))
        };
        Ok(GroupAddress(parse(a)?, parse(b)?, parse(c)?))
    }
}

/// Group addresses a zone may expose on KNX. Not part of spec.md §6's literal
/// `ZONE_N_{NAME,DESCRIPTION,ENABLED}` list (only clients are named there),
/// but §4.7 says "each zone *and client* ... may declare GAs" — resolved by
/// extending the zone schema the same additive way `SNAPCAST_GROUP_ID`
/// already does (see DESIGN.md).
#[derive(Debug, Clone, Default)]
pub struct ZoneKnxConfig {
    pub play: Option<GroupAddress>,
    pub volume: Option<GroupAddress>,
    pub mute: Option<GroupAddress>,
    pub shuffle: Option<GroupAddress>,
    pub track_repeat: Option<GroupAddress>,
    pub playlist_repeat: Option<GroupAddress>,
    pub playlist: Option<GroupAddress>,
    pub track: Option<GroupAddress>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientKnxConfig {
    pub volume: Option<GroupAddress>,
    pub mute: Option<GroupAddress>,
    pub latency: Option<GroupAddress>,
    pub zone: Option<GroupAddress>,
}

#[derive(Debug, Clone)]
pub struct ZoneConfig {
    pub index: u16,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub snapcast_group_id: Option<String>,
    pub knx: ZoneKnxConfig,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub index: u16,
    pub name: String,
    pub mac: String,
    /// Zone the client is assigned to at startup, before any
    /// `ZoneAssignClient` command has ever run.
    pub default_zone: u16,
    pub mqtt_base_topic: Option<String>,
    pub knx_enabled: bool,
    pub knx: ClientKnxConfig,
}

#[derive(Debug, Clone)]
pub struct RadioStationConfig {
    pub index: u16,
    pub name: String,
    pub url: String,
    pub description: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SnapcastConfig {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
    /// `{zone}`/`{client}` placeholder templates, config-driven rather than
    /// hardcoded per-kind `match` arms (spec.md §9 redesign note: topic shape
    /// must not be baked into the adapter).
    pub zone_state_topic: String,
    pub zone_command_topic: String,
    pub client_state_topic: String,
    pub client_command_topic: String,
    pub system_status_topic: String,
}

impl MqttConfig {
    pub fn zone_state_topic(&self, zone: u16) -> String {
        format!(
            "{}/{}",
            self.topic_prefix,
            self.zone_state_topic.replace("{zone}", &zone.to_string())
        )
    }

    pub fn zone_command_topic(&self, zone: u16) -> String {
        format!(
            "{}/{}",
            self.topic_prefix,
            self.zone_command_topic.replace("{zone}", &zone.to_string())
        )
    }

    pub fn zone_command_subscription(&self) -> String {
        format!(
            "{}/{}",
            self.topic_prefix,
            self.zone_command_topic.replace("{zone}", "+")
        )
    }

    pub fn client_state_topic(&self, client: u16) -> String {
        format!(
            "{}/{}",
            self.topic_prefix,
            self.client_state_topic.replace("{client}", &client.to_string())
        )
    }

    pub fn client_command_topic(&self, client: u16) -> String {
        format!(
            "{}/{}",
            self.topic_prefix,
            self.client_command_topic.replace("{client}", &client.to_string())
        )
    }

    pub fn client_command_subscription(&self) -> String {
        format!(
            "{}/{}",
            self.topic_prefix,
            self.client_command_topic.replace("{client}", "+")
        )
    }

    pub fn system_status_topic(&self) -> String {
        format!("{}/{}", self.topic_prefix, self.system_status_topic)
    }
}

#[derive(Debug, Clone)]
pub struct KnxConfig {
    pub enabled: bool,
    pub gateway_host: String,
    pub gateway_port: u16,
}

#[derive(Debug, Clone)]
pub struct SubsonicConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub otlp_endpoint: Option<String>,
    pub otlp_protocol: Option<String>,
    pub otlp_headers: Option<String>,
    pub otlp_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub application_name: String,
    pub log_level: String,
    pub http_port: u16,
    pub https_enabled: bool,
    /// Accepted `X-API-Key` values. Empty means auth is disabled and every
    /// request is accepted.
    pub api_keys: Vec<String>,
    pub snapcast: SnapcastConfig,
    pub mqtt: Option<MqttConfig>,
    pub knx: Option<KnxConfig>,
    pub subsonic: Option<SubsonicConfig>,
    pub telemetry: TelemetryConfig,
    pub zones: Vec<ZoneConfig>,
    pub clients: Vec<ClientConfig>,
    pub radio_stations: Vec<RadioStationConfig>,
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|| default.to_string())
}

fn parse_u16(key: &str, default: u16) -> Result<u16, SnapDogError> {
    match var(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| SnapDogError::config(format!("{key} must be a u16, got {v:?}"))),
    }
}

fn parse_u64(key: &str, default: u64) -> Result<u64, SnapDogError> {
    match var(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| SnapDogError::config(format!("{key} must be a u64, got {v:?}"))),
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match var(key).as_deref() {
        None => default,
        Some("1") | Some("true") | Some("TRUE") | Some("True") => true,
        Some("0") | Some("false") | Some("FALSE") | Some("False") => false,
        Some(_) => default,
    }
}

fn parse_ga(key: &str) -> Result<Option<GroupAddress>, SnapDogError> {
    match var(key) {
        None => Ok(None),
        Some(v) => v.parse().map(Some),
    }
}

/// Enumerates `{prefix}_{N}_{suffix}` style keys for N = 1, 2, 3, ... until
/// the first missing index, matching spec.md's "contiguous, gap-terminated"
/// rule.
fn enumerate_indices(prefix: &str, required_suffix: &str) -> Vec<u16> {
    let mut indices = Vec::new();
    let mut n: u16 = 1;
    loop {
        let key = format!("{prefix}_{n}_{required_suffix}");
        if var(&key).is_some() {
            indices.push(n);
            n += 1;
        } else {
            break;
        }
    }
    indices
}

fn load_zones() -> Result<Vec<ZoneConfig>, SnapDogError> {
    let mut zones = Vec::new();
    for idx in enumerate_indices("SNAPDOG_ZONE", "NAME") {
        let name = var(&format!("SNAPDOG_ZONE_{idx}_NAME"))
            .ok_or_else(|| SnapDogError::config(format!("SNAPDOG_ZONE_{idx}_NAME missing")))?;
        let description = var(&format!("SNAPDOG_ZONE_{idx}_DESCRIPTION"));
        let enabled = parse_bool(&format!("SNAPDOG_ZONE_{idx}_ENABLED"), true);
        let snapcast_group_id = var(&format!("SNAPDOG_ZONE_{idx}_SNAPCAST_GROUP_ID"));
        let knx = ZoneKnxConfig {
            play: parse_ga(&format!("SNAPDOG_ZONE_{idx}_KNX_PLAY"))?,
            volume: parse_ga(&format!("SNAPDOG_ZONE_{idx}_KNX_VOLUME"))?,
            mute: parse_ga(&format!("SNAPDOG_ZONE_{idx}_KNX_MUTE"))?,
            shuffle: parse_ga(&format!("SNAPDOG_ZONE_{idx}_KNX_SHUFFLE"))?,
            track_repeat: parse_ga(&format!("SNAPDOG_ZONE_{idx}_KNX_TRACK_REPEAT"))?,
            playlist_repeat: parse_ga(&format!("SNAPDOG_ZONE_{idx}_KNX_PLAYLIST_REPEAT"))?,
            playlist: parse_ga(&format!("SNAPDOG_ZONE_{idx}_KNX_PLAYLIST"))?,
            track: parse_ga(&format!("SNAPDOG_ZONE_{idx}_KNX_TRACK"))?,
        };
        zones.push(ZoneConfig {
            index: idx,
            name,
            description,
            enabled,
            snapcast_group_id,
            knx,
        });
    }
    Ok(zones)
}

fn load_clients() -> Result<Vec<ClientConfig>, SnapDogError> {
    let mut clients = Vec::new();
    for idx in enumerate_indices("SNAPDOG_CLIENT", "NAME") {
        let name = var(&format!("SNAPDOG_CLIENT_{idx}_NAME"))
            .ok_or_else(|| SnapDogError::config(format!("SNAPDOG_CLIENT_{idx}_NAME missing")))?;
        let mac = var(&format!("SNAPDOG_CLIENT_{idx}_MAC"))
            .ok_or_else(|| SnapDogError::config(format!("SNAPDOG_CLIENT_{idx}_MAC missing")))?;
        let default_zone = var(&format!("SNAPDOG_CLIENT_{idx}_DEFAULT_ZONE"))
            .ok_or_else(|| SnapDogError::config(format!("SNAPDOG_CLIENT_{idx}_DEFAULT_ZONE missing")))?
            .parse()
            .map_err(|_| SnapDogError::config(format!("SNAPDOG_CLIENT_{idx}_DEFAULT_ZONE must be a u16")))?;
        let mqtt_base_topic = var(&format!("SNAPDOG_CLIENT_{idx}_MQTT_BASETOPIC"));
        let knx_enabled = parse_bool(&format!("SNAPDOG_CLIENT_{idx}_KNX_ENABLED"), false);
        let knx = ClientKnxConfig {
            volume: parse_ga(&format!("SNAPDOG_CLIENT_{idx}_KNX_VOLUME"))?,
            mute: parse_ga(&format!("SNAPDOG_CLIENT_{idx}_KNX_MUTE"))?,
            latency: parse_ga(&format!("SNAPDOG_CLIENT_{idx}_KNX_LATENCY"))?,
            zone: parse_ga(&format!("SNAPDOG_CLIENT_{idx}_KNX_ZONE"))?,
        };
        clients.push(ClientConfig {
            index: idx,
            name,
            mac: mac.to_lowercase(),
            default_zone,
            mqtt_base_topic,
            knx_enabled,
            knx,
        });
    }
    Ok(clients)
}

fn load_radio_stations() -> Result<Vec<RadioStationConfig>, SnapDogError> {
    let mut stations = Vec::new();
    for idx in enumerate_indices("SNAPDOG_RADIO", "NAME") {
        let name = var(&format!("SNAPDOG_RADIO_{idx}_NAME"))
            .ok_or_else(|| SnapDogError::config(format!("SNAPDOG_RADIO_{idx}_NAME missing")))?;
        let url = var(&format!("SNAPDOG_RADIO_{idx}_URL"))
            .ok_or_else(|| SnapDogError::config(format!("SNAPDOG_RADIO_{idx}_URL missing")))?;
        let description = var(&format!("SNAPDOG_RADIO_{idx}_DESCRIPTION"));
        let enabled = parse_bool(&format!("SNAPDOG_RADIO_{idx}_ENABLED"), true);
        stations.push(RadioStationConfig {
            index: idx,
            name,
            url,
            description,
            enabled,
        });
    }
    Ok(stations)
}

/// Collects every configured API key: the single `SNAPDOG_API_APIKEY` plus
/// the enumerated `SNAPDOG_API_APIKEY_{N}` form (1..10 per spec.md §6), so
/// multiple keys (e.g. one per integration) can be valid at once. Empty when
/// auth is disabled.
fn load_api_keys() -> Vec<String> {
    if !parse_bool("SNAPDOG_API_AUTH_ENABLED", false) {
        return Vec::new();
    }
    let mut keys: Vec<String> = var("SNAPDOG_API_APIKEY").into_iter().collect();
    for n in 1..=10u16 {
        if let Some(key) = var(&format!("SNAPDOG_API_APIKEY_{n}")) {
            keys.push(key);
        }
    }
    keys
}

pub fn load() -> Result<Config, SnapDogError> {
    let snapcast = SnapcastConfig {
        host: var_or("SNAPDOG_SERVICES_SNAPCAST_HOST", "localhost"),
        port: parse_u16("SNAPDOG_SERVICES_SNAPCAST_PORT", 1705)?,
        timeout_seconds: parse_u64("SNAPDOG_SERVICES_SNAPCAST_TIMEOUT_SECONDS", 5)?,
    };

    let mqtt = if var("SNAPDOG_SERVICES_MQTT_BROKER").is_some() {
        Some(MqttConfig {
            enabled: true,
            host: var_or("SNAPDOG_SERVICES_MQTT_BROKER", "localhost"),
            port: parse_u16("SNAPDOG_SERVICES_MQTT_PORT", 1883)?,
            username: var("SNAPDOG_SERVICES_MQTT_USERNAME"),
            password: var("SNAPDOG_SERVICES_MQTT_PASSWORD"),
            client_id: var_or("SNAPDOG_SERVICES_MQTT_CLIENT_ID", "snapdog"),
            topic_prefix: var_or("SNAPDOG_SERVICES_MQTT_BASE_TOPIC", "snapdog"),
            zone_state_topic: var_or("SNAPDOG_MQTT_ZONE_STATE_TOPIC", "zone/{zone}/state"),
            zone_command_topic: var_or("SNAPDOG_MQTT_ZONE_COMMAND_TOPIC", "zone/{zone}/command"),
            client_state_topic: var_or("SNAPDOG_MQTT_CLIENT_STATE_TOPIC", "client/{client}/state"),
            client_command_topic: var_or(
                "SNAPDOG_MQTT_CLIENT_COMMAND_TOPIC",
                "client/{client}/command",
            ),
            system_status_topic: var_or("SNAPDOG_MQTT_SYSTEM_STATUS_TOPIC", "system/status"),
        })
    } else {
        None
    };

    let knx = if parse_bool("SNAPDOG_SERVICES_KNX_ENABLED", false) {
        Some(KnxConfig {
            enabled: true,
            gateway_host: var_or("SNAPDOG_SERVICES_KNX_GATEWAY", "localhost"),
            gateway_port: parse_u16("SNAPDOG_SERVICES_KNX_PORT", 3671)?,
        })
    } else {
        None
    };

    let subsonic = if var("SNAPDOG_SERVICES_SUBSONIC_URL").is_some() {
        Some(SubsonicConfig {
            base_url: var("SNAPDOG_SERVICES_SUBSONIC_URL")
                .ok_or_else(|| SnapDogError::config("SNAPDOG_SERVICES_SUBSONIC_URL missing"))?,
            username: var("SNAPDOG_SERVICES_SUBSONIC_USERNAME")
                .ok_or_else(|| SnapDogError::config("SNAPDOG_SERVICES_SUBSONIC_USERNAME missing"))?,
            password: var("SNAPDOG_SERVICES_SUBSONIC_PASSWORD")
                .ok_or_else(|| SnapDogError::config("SNAPDOG_SERVICES_SUBSONIC_PASSWORD missing"))?,
        })
    } else {
        None
    };

    let telemetry = TelemetryConfig {
        enabled: parse_bool("SNAPDOG_TELEMETRY_ENABLED", false),
        otlp_endpoint: var("SNAPDOG_TELEMETRY_OTLP_ENDPOINT"),
        otlp_protocol: var("SNAPDOG_TELEMETRY_OTLP_PROTOCOL"),
        otlp_headers: var("SNAPDOG_TELEMETRY_OTLP_HEADERS"),
        otlp_timeout_seconds: match var("SNAPDOG_TELEMETRY_OTLP_TIMEOUT") {
            None => None,
            Some(v) => Some(
                v.parse()
                    .map_err(|_| SnapDogError::config("SNAPDOG_TELEMETRY_OTLP_TIMEOUT must be a u64"))?,
            ),
        },
    };

    Ok(Config {
        environment: var_or("SNAPDOG_SYSTEM_ENVIRONMENT", "production"),
        application_name: var_or("SNAPDOG_SYSTEM_APPLICATION_NAME", "snapdog"),
        log_level: var_or("SNAPDOG_SYSTEM_LOG_LEVEL", "info"),
        http_port: parse_u16("SNAPDOG_API_PORT", 8080)?,
        https_enabled: parse_bool("SNAPDOG_API_HTTPS_ENABLED", false),
        api_keys: load_api_keys(),
        snapcast,
        mqtt,
        knx,
        subsonic,
        telemetry,
        zones: load_zones()?,
        clients: load_clients()?,
        radio_stations: load_radio_stations()?,
    })
}

/// Flat, secret-scrubbed view of every `SNAPDOG_*` variable actually set, for
/// the `/api/v1/system/state` diagnostic endpoint.
pub fn snapshot_env() -> BTreeMap<String, String> {
    env::vars()
        .filter(|(k, _)| k.starts_with("SNAPDOG_"))
        .filter(|(k, _)| !k.contains("PASSWORD") && !k.contains("API_KEY") && !k.contains("APIKEY"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_snapdog_env() {
        let keys: Vec<String> = env::vars()
            .filter(|(k, _)| k.starts_with("SNAPDOG_"))
            .map(|(k, _)| k)
            .collect();
        for k in keys {
            env::remove_var(k);
        }
    }

    #[test]
    #[serial]
    fn enumerates_contiguous_zones_and_stops_at_gap() {
        clear_snapdog_env();
        env::set_var("SNAPDOG_ZONE_1_NAME", "Living Room");
        env::set_var("SNAPDOG_ZONE_2_NAME", "Kitchen");
        // Gap at 3, then a stray 4 which must NOT be picked up.
        env::set_var("SNAPDOG_ZONE_4_NAME", "Office");

        let zones = load_zones().unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].name, "Living Room");
        assert_eq!(zones[1].name, "Kitchen");
        clear_snapdog_env();
    }

    #[test]
    #[serial]
    fn missing_required_client_mac_is_a_config_error() {
        clear_snapdog_env();
        env::set_var("SNAPDOG_CLIENT_1_NAME", "Speaker");
        let err = load_clients().unwrap_err();
        assert_eq!(err.kind.code(), "CONFIG");
        clear_snapdog_env();
    }

    #[test]
    #[serial]
    fn api_keys_are_empty_when_auth_disabled_and_enumerated_when_enabled() {
        clear_snapdog_env();
        env::set_var("SNAPDOG_API_APIKEY", "legacy-key");
        assert!(load_api_keys().is_empty());

        env::set_var("SNAPDOG_API_AUTH_ENABLED", "true");
        env::set_var("SNAPDOG_API_APIKEY_1", "key-one");
        env::set_var("SNAPDOG_API_APIKEY_2", "key-two");
        let keys = load_api_keys();
        assert_eq!(keys, vec!["legacy-key", "key-one", "key-two"]);
        clear_snapdog_env();
    }

    #[test]
    fn group_address_parses_slash_separated_triples() {
        let ga: GroupAddress = "1/2/3".parse().unwrap();
        assert_eq!(ga, GroupAddress(1, 2, 3));
        assert!("1/2".parse::<GroupAddress>().is_err());
    }

    #[test]
    #[serial]
    fn client_knx_group_addresses_are_parsed_when_present() {
        clear_snapdog_env();
        env::set_var("SNAPDOG_CLIENT_1_NAME", "Speaker");
        env::set_var("SNAPDOG_CLIENT_1_MAC", "aa:bb:cc:dd:ee:ff");
        env::set_var("SNAPDOG_CLIENT_1_DEFAULT_ZONE", "1");
        env::set_var("SNAPDOG_CLIENT_1_KNX_ENABLED", "true");
        env::set_var("SNAPDOG_CLIENT_1_KNX_VOLUME", "2/1/1");
        let clients = load_clients().unwrap();
        assert!(clients[0].knx_enabled);
        assert_eq!(clients[0].knx.volume, Some(GroupAddress(2, 1, 1)));
        assert_eq!(clients[0].knx.mute, None);
        clear_snapdog_env();
    }
}
