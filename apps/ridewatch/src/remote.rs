//! Store client that talks to the hub over a WebSocket.
//!
//! A lost connection is re-established with exponential backoff. Live
//! subscriptions are re-sent on the new socket and writes made while offline
//! are replayed, keeping only the latest write per path.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{Snapshot, StorePacket, StorePath, SubscriptionId};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::store::{Result, SessionStore, StoreError, Subscription};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Route {
    path: StorePath,
    tx: watch::Sender<Snapshot>,
}

type Routes = Arc<Mutex<HashMap<SubscriptionId, Route>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Idle time after which a `Heartbeat` is sent to keep the socket alive.
    pub heartbeat: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            heartbeat: Duration::from_secs(15),
        }
    }
}

/// Hub-backed [`SessionStore`]. Writes are queued and sent in call order.
#[derive(Clone)]
pub struct RemoteStore {
    outbound: mpsc::UnboundedSender<StorePacket>,
    routes: Routes,
    link: watch::Receiver<LinkState>,
}

impl RemoteStore {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, ReconnectPolicy::default()).await
    }

    /// Connects once, failing if the hub is unreachable now. Later drops are
    /// retried according to `policy` for as long as the store is alive.
    pub async fn connect_with(url: &str, policy: ReconnectPolicy) -> Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(url).await?;
        tracing::info!(%url, "connected to hub");

        let (outbound, outbound_rx) = mpsc::unbounded_channel::<StorePacket>();
        let (link_tx, link) = watch::channel(LinkState::Connected);
        let routes: Routes = Arc::default();
        tokio::spawn(drive(
            url.to_string(),
            socket,
            outbound_rx,
            routes.clone(),
            link_tx,
            policy,
        ));

        Ok(Self {
            outbound,
            routes,
            link,
        })
    }

    /// Current connection state; changes as the hub link drops and recovers.
    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    fn send(&self, packet: StorePacket) -> Result<()> {
        self.outbound
            .send(packet)
            .map_err(|_| StoreError::Disconnected)
    }
}

enum Ended {
    /// Every store handle is gone.
    Dropped,
    /// The socket failed; carries the packet that could not be sent, if any.
    Lost(Option<StorePacket>),
}

async fn drive(
    url: String,
    mut socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<StorePacket>,
    routes: Routes,
    link: watch::Sender<LinkState>,
    policy: ReconnectPolicy,
) {
    let mut pending = VecDeque::new();
    loop {
        match pump(&mut socket, &mut outbound, &routes, policy.heartbeat).await {
            Ended::Dropped => break,
            Ended::Lost(unsent) => {
                if let Some(packet) = unsent {
                    hold(&mut pending, packet);
                }
            }
        }
        link.send_replace(LinkState::Reconnecting);
        tracing::warn!(%url, "hub connection lost, reconnecting");

        loop {
            let Some(next) = reconnect(&url, &policy, &mut outbound, &mut pending).await else {
                tracing::info!("hub connection closed");
                return;
            };
            socket = next;
            match replay(&mut socket, &routes, &mut pending).await {
                Ok(()) => break,
                Err(err) => tracing::warn!(?err, "hub connection lost during replay"),
            }
        }
        link.send_replace(LinkState::Connected);
        tracing::info!(%url, "reconnected to hub");
    }
    tracing::info!("hub connection closed");
}

async fn pump(
    socket: &mut Socket,
    outbound: &mut mpsc::UnboundedReceiver<StorePacket>,
    routes: &Routes,
    heartbeat: Duration,
) -> Ended {
    let mut keepalive = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            packet = outbound.recv() => {
                let Some(packet) = packet else {
                    let _ = socket.close(None).await;
                    return Ended::Dropped;
                };
                if let Err(err) = send_packet(socket, &packet).await {
                    tracing::warn!(?err, "hub send failed");
                    return Ended::Lost(Some(packet));
                }
                keepalive.reset();
            }
            _ = keepalive.tick() => {
                if let Err(err) = send_packet(socket, &StorePacket::Heartbeat).await {
                    tracing::warn!(?err, "hub heartbeat failed");
                    return Ended::Lost(None);
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bin))) => {
                        let Ok(packet) = rmp_serde::from_slice::<StorePacket>(&bin) else {
                            tracing::debug!(len = bin.len(), "skipping undecodable frame");
                            continue;
                        };
                        if let StorePacket::Update { id, snapshot } = packet {
                            route(routes, id, snapshot);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ended::Lost(None),
                    Some(Err(err)) => {
                        tracing::warn!(?err, "hub connection failed");
                        return Ended::Lost(None);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Waits out the backoff and dials again until it succeeds. Packets sent in
/// the meantime are held for replay. `None` once every store handle is gone.
async fn reconnect(
    url: &str,
    policy: &ReconnectPolicy,
    outbound: &mut mpsc::UnboundedReceiver<StorePacket>,
    pending: &mut VecDeque<StorePacket>,
) -> Option<Socket> {
    let mut delay = policy.initial_backoff;
    loop {
        let wait = tokio::time::sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                packet = outbound.recv() => match packet {
                    Some(packet) => hold(pending, packet),
                    None => return None,
                },
                () = &mut wait => break,
            }
        }

        match tokio_tungstenite::connect_async(url).await {
            Ok((socket, _)) => return Some(socket),
            Err(err) => {
                tracing::debug!(%err, ?delay, "hub still unreachable");
                delay = (delay * 2).min(policy.max_backoff);
            }
        }
    }
}

/// Keeps a packet for the next connection. Subscriptions are rebuilt from the
/// live routes instead, and only the newest write per path matters.
fn hold(pending: &mut VecDeque<StorePacket>, packet: StorePacket) {
    match &packet {
        StorePacket::Write { path, .. } => {
            let path = path.clone();
            pending.retain(|held| !matches!(held, StorePacket::Write { path: p, .. } if *p == path));
        }
        StorePacket::Append { .. } => {}
        StorePacket::Subscribe { .. }
        | StorePacket::Unsubscribe { .. }
        | StorePacket::Update { .. }
        | StorePacket::Heartbeat => return,
    }
    pending.push_back(packet);
}

async fn replay(
    socket: &mut Socket,
    routes: &Routes,
    pending: &mut VecDeque<StorePacket>,
) -> std::result::Result<(), tungstenite::Error> {
    let subscriptions: Vec<StorePacket> = routes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(id, route)| StorePacket::Subscribe {
            id: *id,
            path: route.path.clone(),
        })
        .collect();
    for packet in &subscriptions {
        send_packet(socket, packet).await?;
    }

    while let Some(packet) = pending.pop_front() {
        if let Err(err) = send_packet(socket, &packet).await {
            pending.push_front(packet);
            return Err(err);
        }
    }
    tracing::debug!(subscriptions = subscriptions.len(), "replayed to hub");
    Ok(())
}

async fn send_packet(
    socket: &mut Socket,
    packet: &StorePacket,
) -> std::result::Result<(), tungstenite::Error> {
    let bin = match rmp_serde::to_vec(packet) {
        Ok(bin) => bin,
        Err(err) => {
            tracing::warn!(?err, "dropping unencodable packet");
            return Ok(());
        }
    };
    socket.send(Message::Binary(bin.into())).await
}

fn route(routes: &Routes, id: SubscriptionId, snapshot: Snapshot) {
    let mut routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
    let delivered = routes
        .get(&id)
        .is_some_and(|route| route.tx.send(snapshot).is_ok());
    if !delivered {
        routes.remove(&id);
    }
}

impl SessionStore for RemoteStore {
    fn write(&self, path: &StorePath, value: Value) -> Result<()> {
        self.send(StorePacket::Write {
            path: path.clone(),
            value,
        })
    }

    fn append(&self, path: &StorePath, value: Value) -> Result<()> {
        self.send(StorePacket::Append {
            path: path.clone(),
            value,
        })
    }

    fn subscribe(&self, path: &StorePath) -> Result<Subscription> {
        let id = SubscriptionId::new();
        // nothing is yielded until the hub's first update arrives
        let (tx, rx) = watch::channel(Snapshot::Empty);
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Route {
                    path: path.clone(),
                    tx,
                },
            );

        if let Err(err) = self.send(StorePacket::Subscribe {
            id,
            path: path.clone(),
        }) {
            self.routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(err);
        }

        let outbound = self.outbound.clone();
        let routes = self.routes.clone();
        Ok(Subscription::new(path.clone(), rx, move || {
            routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            let _ = outbound.send(StorePacket::Unsubscribe { id });
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn write(path: &str, value: Value) -> StorePacket {
        StorePacket::Write {
            path: StorePath::new(path),
            value,
        }
    }

    #[test]
    fn offline_writes_keep_the_latest_per_path() {
        let mut pending = VecDeque::new();
        hold(&mut pending, write("a", json!(1)));
        hold(&mut pending, write("b", json!(1)));
        hold(&mut pending, write("a", json!(2)));

        assert_eq!(
            pending.into_iter().collect::<Vec<_>>(),
            vec![write("b", json!(1)), write("a", json!(2))]
        );
    }

    #[test]
    fn offline_appends_are_all_kept() {
        let mut pending = VecDeque::new();
        let append = |n| StorePacket::Append {
            path: StorePath::new("log"),
            value: json!(n),
        };
        hold(&mut pending, append(1));
        hold(&mut pending, append(2));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn subscription_packets_are_not_held() {
        let mut pending = VecDeque::new();
        let id = SubscriptionId::new();
        hold(
            &mut pending,
            StorePacket::Subscribe {
                id,
                path: StorePath::new("a"),
            },
        );
        hold(&mut pending, StorePacket::Unsubscribe { id });
        hold(&mut pending, StorePacket::Heartbeat);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn idle_link_sends_heartbeats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(bin))) => {
                        return rmp_serde::from_slice::<StorePacket>(&bin).unwrap();
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended: {other:?}"),
                }
            }
        });

        let policy = ReconnectPolicy {
            heartbeat: Duration::from_millis(50),
            ..ReconnectPolicy::default()
        };
        let store = RemoteStore::connect_with(&format!("ws://{addr}"), policy)
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), hub)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, StorePacket::Heartbeat);
        assert_eq!(*store.link().borrow(), LinkState::Connected);
    }
}
