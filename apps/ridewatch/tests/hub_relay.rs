#![cfg(feature = "hub")]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ridewatch::config::SessionConfig;
use ridewatch::geo::{ManualSource, RawSample};
use ridewatch::remote::{LinkState, ReconnectPolicy, RemoteStore};
use ridewatch::server::{self, state::HubState};
use ridewatch::session::SessionController;
use ridewatch::store::SessionStore;
use serde_json::json;
use shared::{Role, Snapshot, StorePath};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

async fn start_hub() -> (String, HubState) {
    let (addr, hub) = start_hub_at().await;
    (format!("ws://{addr}/ws"), hub)
}

async fn start_hub_at() -> (SocketAddr, HubState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = HubState::default();
    tokio::spawn(server::serve(listener, hub.clone()));
    (addr, hub)
}

/// TCP forwarder in front of the hub whose open links can be severed.
struct Relay {
    addr: SocketAddr,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Relay {
    async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let links: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
        let accepted = links.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                accepted.lock().unwrap().push(link);
            }
        });
        Self { addr, links }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn sever(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }
}

async fn next_value(sub: &mut ridewatch::store::Subscription, want: &serde_json::Value) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match sub.next().await {
                Some(Snapshot::Value(value)) if value == *want => return,
                Some(_) => continue,
                None => panic!("subscription closed"),
            }
        }
    })
    .await
    .expect("value never arrived");
}

#[tokio::test]
async fn remote_writes_reach_remote_listeners() {
    let (url, hub) = start_hub().await;
    let writer = RemoteStore::connect(&url).await.unwrap();
    let reader = RemoteStore::connect(&url).await.unwrap();
    let path = StorePath::location("s", Role::Tracker);

    let mut sub = reader.subscribe(&path).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap();
    assert_eq!(first, Some(Snapshot::Empty));

    writer.write(&path, json!({"latitude": 1.0})).unwrap();
    let next = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap();
    assert_eq!(next, Some(Snapshot::Value(json!({"latitude": 1.0}))));
    assert_eq!(hub.store.get(&path), Snapshot::Value(json!({"latitude": 1.0})));
}

#[tokio::test]
async fn sessions_meet_through_the_hub() {
    let (url, _hub) = start_hub().await;
    let config = |role| SessionConfig {
        session_id: "order_9".into(),
        initial_role: Some(role),
        ..SessionConfig::default()
    };

    let rider_gps = ManualSource::new();
    let tracker = SessionController::spawn(
        config(Role::Tracker),
        Arc::new(RemoteStore::connect(&url).await.unwrap()),
        Arc::new(rider_gps.clone()),
    )
    .unwrap();
    let observer = SessionController::spawn(
        config(Role::Observer),
        Arc::new(RemoteStore::connect(&url).await.unwrap()),
        Arc::new(ManualSource::new()),
    )
    .unwrap();

    rider_gps.push(Ok(RawSample::at(24.9142, 67.1245).with_speed(5.0)));
    tracker.send_chat("picked up").await.unwrap();

    let mut views = observer.watch();
    let view = tokio::time::timeout(
        Duration::from_secs(3),
        views.wait_for(|v| v.counterpart.is_some() && !v.chat.is_empty()),
    )
    .await
    .expect("observer never heard from the tracker")
    .unwrap()
    .clone();

    assert!((view.speed_kmh - 18.0).abs() < 1e-9);
    assert_eq!(view.chat[0].message.sender, Role::Tracker);
    assert!(!view.chat[0].own);
}

#[tokio::test]
async fn client_recovers_after_the_hub_link_drops() {
    let (hub_addr, hub) = start_hub_at().await;
    let relay = Relay::start(hub_addr).await;
    let policy = ReconnectPolicy {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(400),
        heartbeat: Duration::from_secs(1),
    };
    let flaky = RemoteStore::connect_with(&relay.url(), policy).await.unwrap();
    let steady = RemoteStore::connect(&format!("ws://{hub_addr}/ws")).await.unwrap();

    let observer_key = StorePath::location("s", Role::Observer);
    let tracker_key = StorePath::location("s", Role::Tracker);
    let mut flaky_sub = flaky.subscribe(&observer_key).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), flaky_sub.next()).await.unwrap();
    assert_eq!(first, Some(Snapshot::Empty));

    let mut link = flaky.link();
    relay.sever();
    tokio::time::timeout(Duration::from_secs(2), link.wait_for(|s| *s == LinkState::Reconnecting))
        .await
        .expect("link loss went unnoticed")
        .unwrap();

    // made while offline, delivered after the link returns
    flaky.write(&tracker_key, json!({"latitude": 2.0})).unwrap();
    steady.write(&observer_key, json!({"latitude": 1.0})).unwrap();

    next_value(&mut flaky_sub, &json!({"latitude": 1.0})).await;
    assert_eq!(*link.borrow(), LinkState::Connected);

    let mut steady_sub = steady.subscribe(&tracker_key).unwrap();
    next_value(&mut steady_sub, &json!({"latitude": 2.0})).await;
    assert_eq!(hub.store.get(&tracker_key), Snapshot::Value(json!({"latitude": 2.0})));
}
