use std::sync::Arc;

use anyhow::Context;
use ridewatch::config::ClientConfig;
use ridewatch::console::ConsoleCommand;
use ridewatch::geo::{ManualSource, PositionSource, SimulatedSource};
use ridewatch::lookup::PlaceLookup;
use ridewatch::map::Framing;
use ridewatch::remote::{LinkState, RemoteStore};
use ridewatch::session::{SessionController, SessionView};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(?err, "client exited with error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    ridewatch::init_tracing();

    let config = ClientConfig::from_env()?;
    let store = RemoteStore::connect(&config.hub_url)
        .await
        .with_context(|| format!("connecting to {}", config.hub_url))?;
    tokio::spawn(report_link(store.link()));

    let manual = ManualSource::new();
    let source: Arc<dyn PositionSource> = if config.simulate {
        Arc::new(SimulatedSource::new(config.origin, config.sample_interval))
    } else {
        Arc::new(manual.clone())
    };
    let session = SessionController::spawn(config.session.clone(), Arc::new(store), source)?;
    let lookup = PlaceLookup::new(config.lookup_url.as_str())?;
    tokio::spawn(report_views(session.watch()));

    tracing::info!(session = %config.session.session_id, "type /role, /at <lat> <lon> [m/s], /find <place>, /quit or a chat line");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Blank => {}
            ConsoleCommand::Quit => break,
            ConsoleCommand::ToggleRole => match session.toggle_role().await {
                Ok(role) => tracing::info!(%role, "role switched"),
                Err(err) => tracing::warn!(%err, "role switch failed"),
            },
            ConsoleCommand::SetRole(role) => {
                if let Err(err) = session.set_role(role).await {
                    tracing::warn!(%err, "role switch failed");
                }
            }
            ConsoleCommand::Fix(sample) => {
                if config.simulate {
                    tracing::warn!("positions are simulated, ignoring /at");
                } else if !manual.push(Ok(sample)) {
                    tracing::warn!("no active position watch");
                }
            }
            ConsoleCommand::Find(place) => match lookup.find(&place).await {
                Ok(Some(found)) => {
                    tracing::info!(%place, lat = found.lat, lon = found.lon, "map recentered")
                }
                Ok(None) => tracing::warn!(%place, "place not found"),
                Err(err) => tracing::warn!(%err, "place lookup failed"),
            },
            ConsoleCommand::Chat(text) => {
                if let Err(err) = session.send_chat(text).await {
                    tracing::warn!(%err, "chat message not sent");
                }
            }
            ConsoleCommand::Invalid(reason) => tracing::warn!("{reason}"),
        }
    }

    session.shutdown().await?;
    Ok(())
}

async fn report_link(mut link: watch::Receiver<LinkState>) {
    while link.changed().await.is_ok() {
        match *link.borrow_and_update() {
            LinkState::Connected => tracing::info!("hub link restored"),
            LinkState::Reconnecting => tracing::warn!("hub link lost, changes are queued until it returns"),
        }
    }
}

async fn report_views(mut views: watch::Receiver<SessionView>) {
    let mut chat_seen = 0;
    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        let role = view.role().map_or("idle", |r| r.as_str());
        let (distance_km, eta_min) = view
            .metrics
            .map_or((None, None), |m| (Some(m.display_distance_km()), Some(m.eta_minutes)));
        let framing = match view.map_scene().framing {
            Some(Framing::FitBounds { .. }) => "both",
            Some(Framing::FlyTo { .. }) => "local",
            None => "none",
        };
        tracing::info!(
            role,
            speed_kmh = view.speed_kmh.round(),
            ?distance_km,
            ?eta_min,
            framing,
            geo_error = ?view.geo_error,
            "session updated"
        );
        for line in view.chat.iter().skip(chat_seen) {
            let who = if line.own { "me" } else { line.message.sender.as_str() };
            tracing::info!(from = who, text = %line.message.text, "chat");
        }
        chat_seen = view.chat.len();
    }
}
