//! SnapDog — command/status mediation engine for a multi-room,
//! Snapcast-based audio controller.
//!
//! Wiring order: config -> tracing -> bus -> stores (seeded from config) ->
//! per-zone `ZoneManager` tasks -> media catalog -> `Router` -> adapter
//! command queue -> Snapcast/MQTT/KNX adapters (via the coordinator) -> HTTP
//! surface -> graceful shutdown.

use anyhow::{Context, Result};
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router as AxumRouter;
use snapdog::adapters::handle::{AdapterHandle, RetryConfig};
use snapdog::adapters::knx::KnxAdapter;
use snapdog::adapters::mqtt::MqttAdapter;
use snapdog::adapters::websocket::{ws_handler, WebSocketState};
use snapdog::clock::system_clock;
use snapdog::command::{Command, Router, Source};
use snapdog::config::{self, Config};
use snapdog::coordinator::AdapterCoordinator;
use snapdog::media::{radio_playlist, MediaCatalog, SubsonicClient};
use snapdog::model::{Client, ClientIndex, Zone, ZoneIndex};
use snapdog::snapcast::SnapcastAdapter;
use snapdog::store::Stores;
use snapdog::zone_manager::{ZoneManager, ZoneManagerCommand};
use snapdog::{api, bus};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ZONE_COMMAND_QUEUE: usize = 32;
const ADAPTER_COMMAND_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!(
            "snapdog {} ({})",
            env!("CARGO_PKG_VERSION"),
            env!("SNAPDOG_BUILD_GIT_SHA")
        );
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!(
            "snapdog {} ({})",
            env!("CARGO_PKG_VERSION"),
            env!("SNAPDOG_BUILD_GIT_SHA")
        );
        println!();
        println!("Command/status mediation engine for a multi-room, Snapcast-based");
        println!("audio controller. Configuration is entirely environment-driven —");
        println!("see spec.md §6 for the full `SNAPDOG_*` variable reference.");
        return Ok(());
    }

    run().await
}

async fn run() -> Result<()> {
    let config = config::load().context("loading configuration")?;

    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("snapdog={},tower_http=info", config.log_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("SNAPDOG_BUILD_GIT_SHA"),
        "starting snapdog"
    );

    let bus = bus::create_bus();
    let shutdown = CancellationToken::new();

    let stores = seed_stores(&config).await;

    let subsonic = config.subsonic.clone().map(SubsonicClient::new);
    let media = Arc::new(MediaCatalog::new(radio_playlist(&config.radio_stations), subsonic));

    let enabled_zones: Vec<ZoneIndex> = config
        .zones
        .iter()
        .filter(|z| z.enabled)
        .map(|z| ZoneIndex(z.index))
        .collect();

    let mut zone_commands: HashMap<ZoneIndex, mpsc::Sender<ZoneManagerCommand>> = HashMap::new();
    for &zone in &enabled_zones {
        let (tx, rx) = mpsc::channel(ZONE_COMMAND_QUEUE);
        let manager = ZoneManager::new(zone, stores.clone(), bus.clone(), system_clock(), media.clone());
        let zone_shutdown = shutdown.child_token();
        tokio::spawn(manager.run(rx, zone_shutdown));
        zone_commands.insert(zone, tx);
    }
    tracing::info!("started {} zone manager task(s)", zone_commands.len());

    let enabled_zone_configs: Vec<_> = config.zones.iter().filter(|z| z.enabled).cloned().collect();
    let snapcast_adapter = SnapcastAdapter::new(
        config.snapcast.clone(),
        stores.clone(),
        bus.clone(),
        enabled_zone_configs.clone(),
        config.clients.clone(),
    );
    let snapcast_handle = snapcast_adapter.handle();

    let router = Arc::new(Router::new(
        stores.clone(),
        bus.clone(),
        zone_commands,
        media.clone(),
        snapcast_handle,
        system_clock(),
    ));

    let (command_tx, mut command_rx) = mpsc::channel::<(Command, Source)>(ADAPTER_COMMAND_QUEUE);
    {
        let router = router.clone();
        tokio::spawn(async move {
            while let Some((command, source)) = command_rx.recv().await {
                if let Err(err) = router.dispatch(command, source).await {
                    tracing::warn!(?source, %err, "command dispatch failed");
                }
            }
        });
    }

    let coordinator = Arc::new(AdapterCoordinator::new(bus.clone()));
    coordinator.register("snapcast", true).await;
    coordinator.register("mqtt", config.mqtt.is_some()).await;
    coordinator.register("knx", config.knx.is_some()).await;

    coordinator
        .start_adapter("snapcast", move |bus, cancel| async move {
            let handle = AdapterHandle::new(snapcast_adapter, bus, cancel);
            if let Err(err) = handle.run_with_retry(RetryConfig::default()).await {
                tracing::error!(%err, "snapcast adapter exited");
            }
        })
        .await?;

    if let Some(mqtt_config) = config.mqtt.clone() {
        let command_tx = command_tx.clone();
        let stores = stores.clone();
        coordinator
            .start_adapter("mqtt", move |bus, cancel| async move {
                let adapter = MqttAdapter::new(mqtt_config, command_tx, stores, system_clock());
                let handle = AdapterHandle::new(adapter, bus, cancel);
                if let Err(err) = handle.run_with_retry(RetryConfig::default()).await {
                    tracing::error!(%err, "mqtt adapter exited");
                }
            })
            .await?;
    }

    if let Some(knx_config) = config.knx.clone() {
        let command_tx = command_tx.clone();
        let zones = enabled_zone_configs.clone();
        let clients = config.clients.clone();
        let stores = stores.clone();
        coordinator
            .start_adapter("knx", move |bus, cancel| async move {
                let adapter = KnxAdapter::new(knx_config, &zones, &clients, command_tx, stores, system_clock());
                let handle = AdapterHandle::new(adapter, bus, cancel);
                if let Err(err) = handle.run_with_retry(RetryConfig::default()).await {
                    tracing::error!(%err, "knx adapter exited");
                }
            })
            .await?;
    }

    spawn_stats_sampler(stores.clone(), bus.clone(), shutdown.child_token());

    let state = api::AppState {
        stores: stores.clone(),
        bus: bus.clone(),
        router: router.clone(),
        media: media.clone(),
        coordinator: coordinator.clone(),
        api_keys: Arc::new(config.api_keys.clone()),
        started_at: Instant::now(),
    };

    let app = build_http_router(state, bus.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    shutdown.cancel();
    coordinator.shutdown().await;
    tracing::info!("shutdown complete");

    Ok(())
}

/// Populates the zone/client stores from the loaded configuration. Disabled
/// zones (`SNAPDOG_ZONE_{n}_ENABLED=false`) are left out entirely — they
/// never appear in `Stores::configured_zone_indices`, so commands targeting
/// them are rejected as not-found rather than silently accepted.
async fn seed_stores(config: &Config) -> Stores {
    let zone_indices: Vec<ZoneIndex> = config
        .zones
        .iter()
        .filter(|z| z.enabled)
        .map(|z| ZoneIndex(z.index))
        .collect();
    let client_indices: Vec<ClientIndex> = config.clients.iter().map(|c| ClientIndex(c.index)).collect();

    let stores = Stores::new(zone_indices.clone(), client_indices.clone());

    for zone_cfg in config.zones.iter().filter(|z| z.enabled) {
        stores
            .zones
            .insert(ZoneIndex(zone_cfg.index), Zone::new(ZoneIndex(zone_cfg.index), &zone_cfg.name))
            .await;
    }

    for client_cfg in &config.clients {
        let mut client = Client::new(
            ClientIndex(client_cfg.index),
            &client_cfg.name,
            &client_cfg.mac,
        );
        client.zone_index = Some(ZoneIndex(client_cfg.default_zone));
        stores.clients.insert(ClientIndex(client_cfg.index), client).await;

        if let Some((_, new_zone)) = stores
            .zones
            .mutate(&ZoneIndex(client_cfg.default_zone), {
                let client_index = ClientIndex(client_cfg.index);
                move |z| {
                    let mut z = z.clone();
                    if !z.client_indices.contains(&client_index) {
                        z.client_indices.push(client_index);
                    }
                    z
                }
            })
            .await
        {
            let _ = new_zone;
        }
    }

    stores
}

/// Periodically samples process CPU/memory and publishes them as
/// `GlobalState.server_stats` (spec.md §4.5's `SERVER_STATS` fan-out kind).
/// No adapter pushes these; they're wall-clock-sampled the way the teacher's
/// own health-check task polls its own process, here via `sysinfo` rather
/// than hand-rolled `/proc` parsing.
fn spawn_stats_sampler(stores: Stores, bus: bus::SharedBus, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut system = sysinfo::System::new();
        let pid = sysinfo::Pid::from_u32(std::process::id());
        let started_at = Instant::now();
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {
                    system.refresh_process(pid);
                    let (cpu_percent, resident_memory_bytes) = system
                        .process(pid)
                        .map(|p| (p.cpu_usage(), p.memory()))
                        .unwrap_or((0.0, 0));

                    let stats = snapdog::model::ServerStats {
                        cpu_percent,
                        resident_memory_bytes,
                        uptime_ms: started_at.elapsed().as_millis() as u64,
                    };

                    let next_version = stores.versions.next();
                    let state = {
                        let mut global = stores.global.write().await;
                        global.server_stats = stats;
                        global.version = next_version;
                        global.clone()
                    };
                    bus.publish(bus::BusEvent::GlobalStateChanged { state });
                }
            }
        }
    });
}

fn build_http_router(state: api::AppState, bus: bus::SharedBus) -> AxumRouter {
    let stores = state.stores.clone();
    let public = AxumRouter::new()
        .route("/health", get(api::health_handler))
        .route("/health/ready", get(api::readiness_handler))
        .route("/health/live", get(api::liveness_handler))
        .with_state(state.clone());

    let protected = AxumRouter::new()
        .route("/v1/zones", get(api::list_zones_handler))
        .route("/v1/zones/{idx}", get(api::get_zone_handler))
        .route("/v1/zones/{idx}/track/position", get(api::zone_position_handler))
        .route("/v1/zones/{idx}/track/progress", get(api::zone_progress_handler))
        .route("/v1/zones/{idx}/volume", get(api::zone_volume_handler))
        .route("/v1/zones/{idx}/mute", get(api::zone_mute_handler))
        .route("/v1/zones/{idx}/playlist", get(api::zone_playlist_handler))
        .route("/v1/zones/{idx}/play", post(api::zone_play_handler))
        .route("/v1/zones/{idx}/pause", post(api::zone_pause_handler))
        .route("/v1/zones/{idx}/stop", post(api::zone_stop_handler))
        .route("/v1/zones/{idx}/next", post(api::zone_next_handler))
        .route("/v1/zones/{idx}/previous", post(api::zone_previous_handler))
        .route("/v1/zones/{idx}/volume", put(api::zone_set_volume_handler))
        .route("/v1/zones/{idx}/playlist", put(api::zone_set_playlist_handler))
        .route("/v1/zones/{idx}/track", put(api::zone_set_track_handler))
        .route(
            "/v1/zones/{idx}/play/playlist/{playlist}/track",
            post(api::zone_play_playlist_track_handler),
        )
        .route("/v1/clients", get(api::list_clients_handler))
        .route("/v1/clients/{idx}", get(api::get_client_handler))
        .route("/v1/clients/{idx}/volume", get(api::client_volume_handler))
        .route("/v1/clients/{idx}/mute", get(api::client_mute_handler))
        .route("/v1/clients/{idx}/volume", put(api::client_set_volume_handler))
        .route("/v1/clients/{idx}/latency", put(api::client_set_latency_handler))
        .route("/v1/clients/{idx}/zone", put(api::client_set_zone_handler))
        .route("/v1/clients/{idx}/mute/toggle", post(api::client_mute_toggle_handler))
        .route("/v1/media/playlists", get(api::list_playlists_handler))
        .route("/v1/media/playlists/{idx}", get(api::get_playlist_handler))
        .route("/v1/media/playlists/{idx}/tracks", get(api::playlist_tracks_handler))
        .route("/v1/system/state", get(api::system_state_handler))
        .route("/api/v1/cover/{id}", get(api::cover_art_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), api::require_api_key))
        .with_state(state);

    let ws = AxumRouter::new()
        .route("/hubs/snapdog", get(ws_handler))
        .with_state(WebSocketState { bus, stores });

    AxumRouter::new()
        .merge(public)
        .merge(protected)
        .merge(ws)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received sigterm"),
    }
}
