//! Session controller: owns the active role and wires the publisher, the
//! counterpart feed and the chat log together.
//!
//! The controller runs as a single task. Commands, position fixes, counterpart
//! updates and chat snapshots are handled one at a time, to completion, in the
//! order the loop receives them. A role change stops the old watch and listener
//! before starting the new ones, so nothing from the superseded role is
//! processed afterwards.

use std::sync::Arc;

use shared::{ChatMessage, LocationRecord, Role};
use tokio::sync::{mpsc, oneshot, watch};

use crate::chat::{ChatChannel, ChatLog};
use crate::config::SessionConfig;
use crate::geo::{GeoError, GeoEvent, GeoOptions, GeoWatch, PositionSource, RawSample};
use crate::map::MapScene;
use crate::proximity::DerivedMetrics;
use crate::publisher::LocationPublisher;
use crate::store::{SessionStore, StoreError};
use crate::subscriber::CounterpartSubscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Active(Role),
}

impl SessionState {
    pub fn role(self) -> Option<Role> {
        match self {
            SessionState::Idle => None,
            SessionState::Active(role) => Some(role),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    pub message: ChatMessage,
    /// Sent by the local active role.
    pub own: bool,
}

/// Everything a presentation layer needs, recomputed on every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionView {
    pub state: SessionState,
    pub local: Option<LocationRecord>,
    pub counterpart: Option<LocationRecord>,
    /// Present only while both records are known.
    pub metrics: Option<DerivedMetrics>,
    /// The tracker's speed: our own as tracker, the counterpart's as observer.
    pub speed_kmh: f64,
    pub chat: Vec<ChatLine>,
    pub geo_error: Option<GeoError>,
}

impl SessionView {
    pub fn role(&self) -> Option<Role> {
        self.state.role()
    }

    pub fn map_scene(&self) -> MapScene {
        match self.role() {
            Some(role) => MapScene::from_positions(
                role,
                self.local.as_ref().map(LocationRecord::position),
                self.counterpart.as_ref().map(LocationRecord::position),
            ),
            None => MapScene::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session controller has stopped")]
    Closed,
    #[error("no role is active")]
    Idle,
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Command {
    SetRole {
        role: Role,
        done: oneshot::Sender<Result<(), SessionError>>,
    },
    ToggleRole {
        done: oneshot::Sender<Result<Role, SessionError>>,
    },
    SendChat {
        text: String,
        done: oneshot::Sender<Result<Option<ChatMessage>, SessionError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum Event {
    Command(Option<Command>),
    Geo(Option<GeoEvent>),
    Counterpart(Option<Option<LocationRecord>>),
    Chat(Option<Vec<ChatMessage>>),
}

struct ActiveRole {
    publisher: LocationPublisher,
    watch: GeoWatch,
    watch_open: bool,
    counterpart: CounterpartSubscriber,
    counterpart_open: bool,
}

impl ActiveRole {
    fn stop(self) {
        // publisher side first, then the listener
        self.watch.stop();
        self.counterpart.unsubscribe();
    }
}

pub struct SessionController {
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
    source: Arc<dyn PositionSource>,
    chat: ChatChannel,
    chat_log: Option<ChatLog>,
    active: Option<ActiveRole>,
    local: Option<LocationRecord>,
    counterpart: Option<LocationRecord>,
    messages: Vec<ChatMessage>,
    geo_error: Option<GeoError>,
    view: watch::Sender<SessionView>,
}

impl SessionController {
    /// Builds a controller and activates `config.initial_role`, if any.
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn SessionStore>,
        source: Arc<dyn PositionSource>,
    ) -> Result<Self, StoreError> {
        let chat = ChatChannel::new(store.clone(), &config.session_id);
        let chat_log = chat.subscribe()?;
        let (view, _) = watch::channel(SessionView::default());

        let mut controller = Self {
            config,
            store,
            source,
            chat,
            chat_log: Some(chat_log),
            active: None,
            local: None,
            counterpart: None,
            messages: Vec::new(),
            geo_error: None,
            view,
        };
        if let Some(role) = controller.config.initial_role {
            controller.set_role(role)?;
        }
        Ok(controller)
    }

    /// Starts the controller on its own task.
    pub fn spawn(
        config: SessionConfig,
        store: Arc<dyn SessionStore>,
        source: Arc<dyn PositionSource>,
    ) -> Result<SessionHandle, StoreError> {
        let controller = Self::new(config, store, source)?;
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands,
            view: controller.view.subscribe(),
        };
        tokio::spawn(controller.run(rx));
        Ok(handle)
    }

    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map_or(SessionState::Idle, |a| SessionState::Active(a.publisher.role()))
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    /// Switches identity: stops publishing and following as the old role, then
    /// starts both as `role`. Setting the current role again does nothing.
    pub fn set_role(&mut self, role: Role) -> Result<(), StoreError> {
        let previous = self.state();
        if previous == SessionState::Active(role) {
            return Ok(());
        }

        self.stop_active();
        self.local = None;
        self.counterpart = None;
        self.geo_error = None;
        self.refresh();

        let session_id = self.config.session_id.clone();
        let counterpart =
            match CounterpartSubscriber::subscribe(self.store.as_ref(), &session_id, role.counterpart()) {
                Ok(counterpart) => counterpart,
                Err(err) => {
                    tracing::warn!(session = %session_id, %role, %err, "could not follow counterpart");
                    return Err(err);
                }
            };
        let watch = self.source.start_watching(GeoOptions {
            high_accuracy: self.config.high_accuracy,
        });
        self.active = Some(ActiveRole {
            publisher: LocationPublisher::new(self.store.clone(), &session_id, role),
            watch,
            watch_open: true,
            counterpart,
            counterpart_open: true,
        });
        tracing::info!(session = %session_id, ?previous, %role, "role activated");
        self.refresh();
        Ok(())
    }

    fn stop_active(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(role = %active.publisher.role(), "stopping role");
            active.stop();
        }
    }

    pub fn send_chat(&self, text: &str) -> Result<Option<ChatMessage>, SessionError> {
        let role = self.state().role().ok_or(SessionError::Idle)?;
        Ok(self.chat.send(role, text)?)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = self.next_event(&mut commands).await;
            if !self.handle(event) {
                break;
            }
        }
        self.stop_active();
        tracing::info!(session = %self.config.session_id, "session stopped");
    }

    async fn next_event(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Event {
        let chat_open = self.chat_log.is_some();
        match self.active.as_mut() {
            Some(active) => tokio::select! {
                command = commands.recv() => Event::Command(command),
                event = active.watch.next(), if active.watch_open => Event::Geo(event),
                update = active.counterpart.next(), if active.counterpart_open => Event::Counterpart(update),
                log = next_log(&mut self.chat_log), if chat_open => Event::Chat(log),
            },
            None => tokio::select! {
                command = commands.recv() => Event::Command(command),
                log = next_log(&mut self.chat_log), if chat_open => Event::Chat(log),
            },
        }
    }

    /// Returns false once the loop should stop.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Command(None) => return false,
            Event::Command(Some(command)) => return self.on_command(command),
            Event::Geo(Some(Ok(sample))) => self.on_sample(&sample),
            Event::Geo(Some(Err(err))) => self.on_geo_error(err),
            Event::Geo(None) => {
                tracing::warn!("position source ended");
                if let Some(active) = self.active.as_mut() {
                    active.watch_open = false;
                }
            }
            Event::Counterpart(Some(record)) => {
                self.counterpart = record;
                self.refresh();
            }
            Event::Counterpart(None) => {
                tracing::warn!("counterpart listener closed by the store");
                if let Some(active) = self.active.as_mut() {
                    active.counterpart_open = false;
                }
            }
            Event::Chat(Some(messages)) => {
                self.messages = messages;
                self.refresh();
            }
            Event::Chat(None) => {
                tracing::warn!("chat listener closed by the store");
                self.chat_log = None;
            }
        }
        true
    }

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::SetRole { role, done } => {
                let _ = done.send(self.set_role(role).map_err(SessionError::from));
            }
            Command::ToggleRole { done } => {
                let next = self.state().role().map_or(Role::Observer, Role::counterpart);
                let _ = done.send(self.set_role(next).map(|()| next).map_err(SessionError::from));
            }
            Command::SendChat { text, done } => {
                let _ = done.send(self.send_chat(&text));
            }
            Command::Shutdown { done } => {
                self.stop_active();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn on_sample(&mut self, sample: &RawSample) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let record = active.publisher.record(sample);
        if let Err(err) = active.publisher.publish(&record) {
            tracing::warn!(role = %active.publisher.role(), %err, "location write failed");
        }
        self.local = Some(record);
        self.geo_error = None;
        self.refresh();
    }

    fn on_geo_error(&mut self, err: GeoError) {
        tracing::warn!(%err, "position fix failed");
        self.geo_error = Some(err);
        self.refresh();
    }

    fn build_view(&self) -> SessionView {
        let state = self.state();
        let metrics = match (&self.local, &self.counterpart) {
            (Some(local), Some(counterpart)) => {
                Some(DerivedMetrics::between(local, counterpart, self.config.eta_factor))
            }
            _ => None,
        };
        let speed_source = match state.role() {
            Some(Role::Tracker) => self.local.as_ref(),
            Some(Role::Observer) => self.counterpart.as_ref(),
            None => None,
        };
        let chat = self
            .messages
            .iter()
            .map(|message| ChatLine {
                own: state.role() == Some(message.sender),
                message: message.clone(),
            })
            .collect();

        SessionView {
            state,
            local: self.local.clone(),
            counterpart: self.counterpart.clone(),
            metrics,
            speed_kmh: speed_source.map_or(0.0, |r| r.speed_kmh),
            chat,
            geo_error: self.geo_error,
        }
    }

    fn refresh(&self) {
        let next = self.build_view();
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn next_log(log: &mut Option<ChatLog>) -> Option<Vec<ChatMessage>> {
    match log {
        Some(log) => log.next().await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a spawned controller. Dropping every handle stops it.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(make(done))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn set_role(&self, role: Role) -> Result<(), SessionError> {
        self.request(|done| Command::SetRole { role, done }).await?
    }

    /// Flips to the other role; from idle this activates the observer.
    pub async fn toggle_role(&self) -> Result<Role, SessionError> {
        self.request(|done| Command::ToggleRole { done }).await?
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<Option<ChatMessage>, SessionError> {
        let text = text.into();
        self.request(|done| Command::SendChat { text, done }).await?
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|done| Command::Shutdown { done }).await
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Receiver that wakes on every view change.
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }
}
