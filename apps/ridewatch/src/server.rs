#![cfg(feature = "hub")]

//! The hub: hosts the shared store and relays it to clients over WebSockets.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::HubConfig;

pub mod state {
    use crate::store::MemoryStore;

    #[derive(Clone, Default)]
    pub struct HubState {
        pub store: MemoryStore,
    }
}

pub mod services {
    pub mod relay {
        use std::collections::HashMap;

        use axum::extract::ws::{Message, WebSocket};
        use shared::{StorePacket, SubscriptionId};
        use tokio::sync::mpsc;
        use tokio::task::JoinHandle;

        use crate::store::{MemoryStore, SessionStore};

        pub type Relays = HashMap<SubscriptionId, JoinHandle<()>>;

        /// Updates waiting for one client's socket. A full queue stalls the
        /// relays, whose subscriptions then keep only the latest snapshot.
        pub const FORWARD_QUEUE: usize = 64;

        /// Applies one client packet to the store. Subscriptions become relay
        /// tasks that push `Update` packets into `forward`.
        pub fn apply(
            store: &MemoryStore,
            packet: StorePacket,
            relays: &mut Relays,
            forward: &mpsc::Sender<StorePacket>,
        ) {
            match packet {
                StorePacket::Write { path, value } => {
                    if let Err(err) = store.write(&path, value) {
                        tracing::warn!(%path, %err, "rejected write");
                    }
                }
                StorePacket::Append { path, value } => {
                    if let Err(err) = store.append(&path, value) {
                        tracing::warn!(%path, %err, "rejected append");
                    }
                }
                StorePacket::Subscribe { id, path } => {
                    let mut subscription = match store.subscribe(&path) {
                        Ok(subscription) => subscription,
                        Err(err) => {
                            tracing::warn!(%path, %err, "rejected subscription");
                            return;
                        }
                    };
                    let forward = forward.clone();
                    let relay = tokio::spawn(async move {
                        while let Some(snapshot) = subscription.next().await {
                            if forward.send(StorePacket::Update { id, snapshot }).await.is_err() {
                                break;
                            }
                        }
                    });
                    if let Some(previous) = relays.insert(id, relay) {
                        previous.abort();
                    }
                    tracing::debug!(%path, "relay started");
                }
                StorePacket::Unsubscribe { id } => {
                    if let Some(relay) = relays.remove(&id) {
                        relay.abort();
                    }
                }
                StorePacket::Update { .. } => {
                    tracing::debug!("ignoring update sent by a client");
                }
                StorePacket::Heartbeat => {}
            }
        }

        pub async fn connection_loop(mut ws: WebSocket, store: MemoryStore) {
            let (forward, mut outbound) = mpsc::channel::<StorePacket>(FORWARD_QUEUE);
            let mut relays = Relays::new();

            loop {
                tokio::select! {
                    incoming = ws.recv() => {
                        match incoming {
                            Some(Ok(Message::Binary(bin))) => {
                                let Ok(packet) = rmp_serde::from_slice::<StorePacket>(&bin) else {
                                    continue;
                                };
                                apply(&store, packet, &mut relays, &forward);
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            _ => {}
                        }
                    }
                    packet = outbound.recv() => {
                        let Some(packet) = packet else {
                            break;
                        };
                        let Ok(bin) = rmp_serde::to_vec(&packet) else {
                            continue;
                        };
                        if ws.send(Message::Binary(bin.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }

            for (_, relay) in relays.drain() {
                relay.abort();
            }
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<state::HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| async move {
        tracing::info!("client connected");
        services::relay::connection_loop(socket, hub.store).await;
        tracing::info!("client disconnected");
    })
}

pub fn router(hub: state::HubState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

pub async fn serve(listener: tokio::net::TcpListener, hub: state::HubState) -> std::io::Result<()> {
    axum::serve(listener, router(hub)).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

pub async fn run() -> anyhow::Result<()> {
    crate::init_tracing();

    let config = HubConfig::from_env()?;
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = router(state::HubState::default())
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer);

    let addr: SocketAddr = config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "ridewatch hub started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
