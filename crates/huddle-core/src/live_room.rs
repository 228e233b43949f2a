use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::base_room::BaseRoom;
use crate::config::EngineConfig;
use crate::delegates::{DatatrackDelegate, JvBusterDelegate};
use crate::errors::RoomError;
use crate::events::{
    DatatrackBridge, EventEmitter, RoomConnectionState, RoomEvent, RoomEventListener,
};
use crate::geometry::{LayoutParams, Viewport};
use crate::jvbuster::{BandwidthLimits, JvbusterApi, JvbusterSession};
use crate::peer::{PeerConnectionManager, PeerConnectionState};
use crate::presence::DeviceState;
use crate::protocol::{
    self, AUDIO_LEVEL_MAX, ClientMessage, DataChannelMessage, DataChannelRequest, HandDownBy,
    MediaState, MuteKind, Register, ServerMessage, SubscriptionType,
};
use crate::sdp;
use crate::session::PresenceSession;
use crate::signaling::{SignalingChannel, SignalingConnector};

/// Everything needed to join a live room.
#[derive(Debug, Clone)]
pub struct LiveRoomParams {
    pub ws_url: String,
    pub room_id: String,
    pub access_token: String,
    pub room_pass: String,
    pub layout: LayoutParams,
    pub jvbuster_address: String,
    pub jvbuster_token: String,
    pub is_speaker: bool,
    pub bandwidth: BandwidthLimits,
}

/// Collaborators of a live room.
pub struct LiveRoomDeps {
    pub datatrack: Option<Arc<dyn DatatrackDelegate>>,
    pub jvbuster: Arc<dyn JvBusterDelegate>,
    pub connector: Arc<dyn SignalingConnector>,
    pub jvbuster_api: Arc<dyn JvbusterApi>,
    pub config: EngineConfig,
}

enum Command {
    SetViewport(Viewport),
    SetSubscriptionType(SubscriptionType),
    UserPath { x: f64, y: f64 },
    Raw(String),
    Send(ClientMessage),
    Reaction(String),
    RemoveReaction(String),
    AudioLevel(u16),
    MediaState(MediaState),
    PeerState {
        id: String,
        state: i64,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    DataChannelIn {
        id: String,
        message: String,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    DataChannelOut {
        id: String,
        message: String,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
}

/// Handle to a connected live room.
///
/// All room state lives in a background task; methods here either enqueue a
/// command or read the shared [`BaseRoom`]. Dropping the handle disconnects.
pub struct LiveRoom {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<RoomConnectionState>,
    base: BaseRoom,
    emitter: EventEmitter,
    local_user_id: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveRoom {
    /// Register in the room and start its task.
    ///
    /// Fails with `Connection` (or `Timeout`) before any peer connection
    /// exists if the signaling handshake does not succeed.
    pub async fn connect(
        params: LiveRoomParams,
        deps: LiveRoomDeps,
    ) -> Result<LiveRoom, RoomError> {
        params.layout.validate()?;

        let emitter = EventEmitter::new();
        if let Some(datatrack) = deps.datatrack.clone() {
            emitter.add_listener(Arc::new(DatatrackBridge::new(datatrack)));
        }
        emitter.emit(RoomEvent::StateChanged(RoomConnectionState::Connecting));

        let client_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("connecting to room {} as client {client_id}", params.room_id);
        let handshake = open_signaling(
            deps.connector.as_ref(),
            &params,
            &client_id,
            deps.config.handshake_timeout(),
        )
        .await;
        let (signaling, user_id, buffered) = match handshake {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!("room {} handshake failed: {e}", params.room_id);
                emitter.emit(RoomEvent::StateChanged(RoomConnectionState::Closed));
                return Err(e);
            }
        };
        tracing::info!("registered in room {} as {user_id}", params.room_id);

        let base = BaseRoom::new();
        let mut session = PresenceSession::new(base.clone(), emitter.clone(), params.layout);
        session.set_local_id(user_id.clone());

        let peers = PeerConnectionManager::new(
            deps.jvbuster.clone(),
            user_id.clone(),
            deps.config.reconnect_grace(),
            deps.config.negotiation_timeout(),
        );
        let jvb_session = JvbusterSession {
            address: params.jvbuster_address.clone(),
            token: params.jvbuster_token.clone(),
            user_id: user_id.clone(),
            is_speaker: params.is_speaker,
            bandwidth: params.bandwidth,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(RoomConnectionState::Connected);
        emitter.emit(RoomEvent::StateChanged(RoomConnectionState::Connected));

        let actor = RoomActor {
            params,
            client_id,
            jvbuster: deps.jvbuster,
            connector: deps.connector,
            api: deps.jvbuster_api,
            config: deps.config,
            session,
            peers,
            signaling: Some(signaling),
            commands: command_rx,
            shutdown: shutdown_rx,
            state: state_tx,
            jvb_session,
            subscription_type: SubscriptionType::default(),
            media: MediaState::default(),
            pending_subscription: false,
            viewport_deadline: None,
            closed: false,
        };
        let task = tokio::spawn(actor.run(buffered));

        Ok(LiveRoom {
            commands: command_tx,
            shutdown: shutdown_tx,
            state: state_rx,
            base,
            emitter,
            local_user_id: user_id,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn RoomEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn state(&self) -> RoomConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every room connection state change.
    pub fn watch_state(&self) -> watch::Receiver<RoomConnectionState> {
        self.state.clone()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn admins(&self) -> Result<Vec<u8>, RoomError> {
        self.base.admins()
    }

    pub fn hands(&self) -> Result<Vec<u8>, RoomError> {
        self.base.hands()
    }

    pub fn is_there_other_admin(&self) -> bool {
        self.base.is_there_other_admin()
    }

    pub fn device_state(&self) -> DeviceState {
        self.base.device_state()
    }

    fn enqueue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("room is closed, dropping command");
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), RoomError>>) -> Command,
    ) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| RoomError::Connection("room is closed".into()))?;
        rx.await
            .map_err(|_| RoomError::Connection("room closed before replying".into()))?
    }

    /// Move the visibility window. Recomputed after the debounce delay.
    pub fn set_viewport(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> Result<(), RoomError> {
        let viewport = Viewport::new(x1, y1, x2, y2)?;
        self.enqueue(Command::SetViewport(viewport));
        Ok(())
    }

    pub fn set_jvbuster_subscription_type(&self, kind: &str) -> Result<(), RoomError> {
        let kind: SubscriptionType = kind.parse()?;
        self.enqueue(Command::SetSubscriptionType(kind));
        Ok(())
    }

    /// Walk the local user to a point given in device coordinates.
    pub fn send_user_path(&self, to_x: f64, to_y: f64) {
        self.enqueue(Command::UserPath { x: to_x, y: to_y });
    }

    /// Send a raw JSON message over signaling.
    pub fn send_message(&self, json: &str) -> Result<(), RoomError> {
        let message = protocol::validate_raw(json)?;
        self.enqueue(Command::Raw(message));
        Ok(())
    }

    pub fn send_reaction(&self, reaction: &str) {
        self.enqueue(Command::Reaction(reaction.to_string()));
    }

    pub fn remove_reaction(&self, id: &str) {
        self.enqueue(Command::RemoveReaction(id.to_string()));
    }

    /// Report the microphone level; clamped to `0..=32767`.
    pub fn update_audio_level(&self, level: i64) {
        let level = level.clamp(0, i64::from(AUDIO_LEVEL_MAX)) as u16;
        self.enqueue(Command::AudioLevel(level));
    }

    pub fn update_video_audio_phone_state(&self, video: bool, audio: bool, phone_call: bool) {
        self.enqueue(Command::MediaState(MediaState {
            video,
            audio,
            phone_call,
        }));
    }

    fn send(&self, message: ClientMessage) {
        self.enqueue(Command::Send(message));
    }

    /// Ask to go on stage.
    pub fn hand_up(&self, user_id: &str) {
        self.send(ClientMessage::HandUp {
            id: user_id.to_string(),
        });
    }

    pub fn hand_down(&self, user_id: &str, by: HandDownBy) {
        self.send(ClientMessage::HandDown {
            id: user_id.to_string(),
            by,
        });
    }

    pub fn move_to_stage(&self, user_id: &str) {
        self.send(ClientMessage::MoveToStage {
            id: user_id.to_string(),
        });
    }

    pub fn move_from_stage(&self, user_id: &str) {
        self.send(ClientMessage::MoveFromStage {
            id: user_id.to_string(),
        });
    }

    /// Invite a listener on stage.
    pub fn call_to_stage(&self, user_id: &str) {
        self.send(ClientMessage::CallToStage {
            id: user_id.to_string(),
        });
    }

    pub fn decline_call_to_stage(&self, inviter_id: &str) {
        self.send(ClientMessage::DeclineCallToStage {
            inviter_id: inviter_id.to_string(),
        });
    }

    pub fn add_admin(&self, user_id: &str) {
        self.send(ClientMessage::AddAdmin {
            id: user_id.to_string(),
        });
    }

    pub fn remove_admin(&self, user_id: &str) {
        self.send(ClientMessage::RemoveAdmin {
            id: user_id.to_string(),
        });
    }

    pub fn set_absolute_speaker(&self, enabled: bool) {
        self.send(ClientMessage::BecomeAbsoluteSpeaker { state: enabled });
    }

    /// Turn off another participant's audio or video.
    pub fn mute_participant(&self, user_id: &str, kind: MuteKind) {
        self.send(ClientMessage::Mute {
            kind,
            id: user_id.to_string(),
        });
    }

    /// Silence the room (`false`) or let listeners raise hands again.
    pub fn set_hands_allowed(&self, allowed: bool) {
        self.send(ClientMessage::SetHandsAllowed { value: allowed });
    }

    /// Start a round timer for everyone; zero seconds stops it.
    pub fn send_timer(&self, seconds: i64, start_user_name: Option<&str>) {
        self.send(ClientMessage::timer(seconds, start_user_name));
    }

    pub fn update_profile(&self) {
        self.send(ClientMessage::UpdateProfile {});
    }

    /// Engine callback: connection `id` changed state (raw engine value).
    pub async fn process_peer_connection_state(&self, id: &str, state: i64) -> Result<(), RoomError> {
        self.request(|reply| Command::PeerState {
            id: id.to_string(),
            state,
            reply,
        })
        .await
    }

    /// Engine callback: a data channel received `message`.
    pub async fn process_data_channel_message(
        &self,
        id: &str,
        message: &str,
    ) -> Result<(), RoomError> {
        self.request(|reply| Command::DataChannelIn {
            id: id.to_string(),
            message: message.to_string(),
            reply,
        })
        .await
    }

    pub async fn send_data_channel_message(&self, id: &str, message: &str) -> Result<(), RoomError> {
        self.request(|reply| Command::DataChannelOut {
            id: id.to_string(),
            message: message.to_string(),
            reply,
        })
        .await
    }

    /// Tear the room down and wait for it. Calling again is a no-op.
    pub async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("room task ended abnormally: {e}");
            }
        }
    }
}

/// Connect, register and wait for `registered`. Messages arriving before it
/// are returned for replay.
async fn open_signaling(
    connector: &dyn SignalingConnector,
    params: &LiveRoomParams,
    client_id: &str,
    timeout: Duration,
) -> Result<(SignalingChannel, String, Vec<String>), RoomError> {
    let handshake = async {
        let mut channel = connector.connect(&params.ws_url).await?;
        let register = ClientMessage::Register(Register {
            room_id: params.room_id.clone(),
            access_token: params.access_token.clone(),
            room_pass: params.room_pass.clone(),
            client_id: client_id.to_string(),
            layout: params.layout,
        });
        channel.send(register.encode()?)?;

        let mut buffered = Vec::new();
        loop {
            let Some(text) = channel.recv().await else {
                return Err(RoomError::Connection("signaling closed during handshake".into()));
            };
            match ServerMessage::parse(&text) {
                Ok(ServerMessage::Registered { user_id, .. }) => {
                    buffered.push(text);
                    return Ok((channel, user_id, buffered));
                }
                Ok(ServerMessage::Error { reason }) => {
                    return Err(RoomError::Connection(reason));
                }
                Ok(_) => buffered.push(text),
                Err(e) => tracing::warn!("ignoring unreadable handshake message: {e}"),
            }
        }
    };
    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| RoomError::Timeout("signaling handshake".into()))?
}

/// Resolves once shutdown is requested or the handle is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run `fut` unless shutdown is requested first.
async fn unless_shutdown<F: Future>(mut shutdown: watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    tokio::select! {
        out = fut => Some(out),
        _ = stopped(&mut shutdown) => None,
    }
}

async fn recv_signal(channel: &mut Option<SignalingChannel>) -> Option<String> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() as u64) / 2;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

enum AnswerRoute {
    /// Initial offers are answered through the media server's REST API.
    Http,
    /// Renegotiation offers are answered on the data channel they came from.
    DataChannel,
}

struct RoomActor {
    params: LiveRoomParams,
    client_id: String,
    jvbuster: Arc<dyn JvBusterDelegate>,
    connector: Arc<dyn SignalingConnector>,
    api: Arc<dyn JvbusterApi>,
    config: EngineConfig,
    session: PresenceSession,
    peers: PeerConnectionManager,
    signaling: Option<SignalingChannel>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<RoomConnectionState>,
    jvb_session: JvbusterSession,
    subscription_type: SubscriptionType,
    /// Media state last sent to the server.
    media: MediaState,
    /// A subscribe message is owed to the main connection.
    pending_subscription: bool,
    viewport_deadline: Option<Instant>,
    closed: bool,
}

impl RoomActor {
    async fn run(mut self, buffered: Vec<String>) {
        let mut open = true;
        for text in buffered {
            open &= self.on_signal(text);
        }

        let shutdown = self.shutdown.clone();
        if open && unless_shutdown(shutdown.clone(), self.start_media()).await.is_some() {
            let mut stop = shutdown;
            loop {
                let deadline = self.viewport_deadline;
                tokio::select! {
                    _ = stopped(&mut stop) => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.on_command(command).await,
                        None => break,
                    },
                    text = recv_signal(&mut self.signaling) => match text {
                        Some(text) => {
                            if !self.on_signal(text) {
                                break;
                            }
                        }
                        None => {
                            if !self.reconnect().await {
                                break;
                            }
                        }
                    },
                    _ = sleep_until(deadline) => {
                        self.viewport_deadline = None;
                        self.refresh_visibility();
                    }
                }
            }
        }
        self.teardown();
        tracing::info!("room {} task ended", self.params.room_id);
    }

    fn set_state(&mut self, state: RoomConnectionState) {
        if *self.state.borrow() == state {
            return;
        }
        self.state.send_replace(state);
        self.session.emit(RoomEvent::StateChanged(state));
    }

    fn report(&self, error: &RoomError) {
        self.session.emit(RoomEvent::Error(error.to_string()));
    }

    fn send_text(&self, text: String) {
        match &self.signaling {
            Some(signaling) if !signaling.is_closed() => {
                if let Err(e) = signaling.send(text) {
                    tracing::warn!("signaling send failed: {e}");
                }
            }
            _ => tracing::debug!("signaling down, dropping outbound message"),
        }
    }

    fn send_signal(&self, message: &ClientMessage) {
        match message.encode() {
            Ok(text) => self.send_text(text),
            Err(e) => tracing::warn!("failed to encode signaling message: {e}"),
        }
    }

    /// Handle one signaling message. Returns false when the room must close.
    fn on_signal(&mut self, text: String) -> bool {
        let message = match ServerMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("dropping unreadable signaling message: {e}");
                return true;
            }
        };
        let banned = matches!(message, ServerMessage::Ban);
        match &message {
            ServerMessage::Error { reason } => self.jvbuster.on_error(reason),
            ServerMessage::MuteRequest(request) => self.mute_local(request.kind),
            _ => {}
        }
        if self.session.handle(message) {
            self.refresh_visibility();
        }
        if banned {
            tracing::warn!("banned from room {}, closing", self.params.room_id);
        }
        !banned
    }

    fn set_media(&mut self, state: MediaState) {
        self.media = state;
        self.send_signal(&ClientMessage::MediaState(state));
        self.session.update_local(|me| {
            me.video = state.video;
            me.audio = state.audio;
            me.phone_call = state.phone_call;
        });
    }

    fn mute_local(&mut self, kind: MuteKind) {
        let mut state = self.media;
        match kind {
            MuteKind::Audio => state.audio = false,
            MuteKind::Video => state.video = false,
        }
        self.set_media(state);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SetViewport(viewport) => {
                self.session.set_viewport(viewport);
                let debounce = self.config.viewport_debounce();
                if debounce.is_zero() {
                    self.viewport_deadline = None;
                    self.refresh_visibility();
                } else {
                    self.viewport_deadline = Some(Instant::now() + debounce);
                }
            }
            Command::SetSubscriptionType(kind) => {
                self.subscription_type = kind;
                self.send_subscription_type();
            }
            Command::UserPath { x, y } => {
                let target = self.session.layout().to_room(x, y);
                self.send_signal(&ClientMessage::UserPath {
                    x: target.x,
                    y: target.y,
                });
            }
            Command::Raw(text) => self.send_text(text),
            Command::Send(message) => self.send_signal(&message),
            Command::Reaction(reaction) => self.send_signal(&ClientMessage::reaction(&reaction)),
            Command::RemoveReaction(id) => {
                if self.session.remove_reaction(&id) {
                    self.send_signal(&ClientMessage::RemoveReaction { id });
                }
            }
            Command::AudioLevel(level) => {
                self.send_signal(&ClientMessage::AudioLevel { level });
                self.session.update_local(|me| me.audio_level = level);
            }
            Command::MediaState(state) => self.set_media(state),
            Command::PeerState { id, state, reply } => {
                let _ = reply.send(self.on_peer_state(&id, state));
            }
            Command::DataChannelIn { id, message, reply } => {
                let shutdown = self.shutdown.clone();
                let result = unless_shutdown(shutdown, self.on_data_channel(&id, &message))
                    .await
                    .unwrap_or_else(|| Err(RoomError::Connection("room is closing".into())));
                let _ = reply.send(result);
            }
            Command::DataChannelOut { id, message, reply } => {
                let _ = reply.send(self.peers.send_message(&id, &message));
            }
        }
    }

    fn on_peer_state(&mut self, id: &str, raw: i64) -> Result<(), RoomError> {
        let state = PeerConnectionState::from_raw(raw)?;
        match self.peers.process_state(id, state) {
            Ok(Some(change)) => {
                self.session.emit(RoomEvent::PeerConnectionStateChanged {
                    id: change.id,
                    state: change.to,
                });
                if change.to == PeerConnectionState::Connected
                    && self.peers.main_connection_id() == Some(id)
                {
                    self.send_subscription_type();
                    self.flush_subscription();
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(RoomError::InvalidTransition { from, to }) => {
                // a reconnect after the grace window leaves the connection failed
                let failed =
                    self.peers.get(id).map(|pc| pc.state) == Some(PeerConnectionState::Failed);
                if failed && from == PeerConnectionState::Disconnected {
                    self.session.emit(RoomEvent::PeerConnectionStateChanged {
                        id: id.to_string(),
                        state: PeerConnectionState::Failed,
                    });
                }
                Err(RoomError::InvalidTransition { from, to })
            }
            Err(e) => Err(e),
        }
    }

    async fn on_data_channel(&mut self, id: &str, message: &str) -> Result<(), RoomError> {
        let parsed = DataChannelMessage::parse(message)
            .map_err(|e| RoomError::Signaling(format!("data channel message from {id}: {e}")))?;
        match parsed {
            DataChannelMessage::Offer { sdp, is_speaker } => {
                let pc = self
                    .peers
                    .get(id)
                    .ok_or_else(|| RoomError::NotFound(format!("peer connection {id}")))?;
                let is_main = pc.is_main;
                let is_speaker = is_speaker.unwrap_or(pc.is_speaker);
                self.negotiate(id, is_main, is_speaker, &sdp, AnswerRoute::DataChannel)
                    .await
            }
            DataChannelMessage::MetaAdd(meta) => {
                self.jvbuster.process_meta_add(&meta.to_string());
                Ok(())
            }
            DataChannelMessage::MetaRemove(meta) => {
                self.jvbuster.process_meta_remove(&meta.to_string());
                Ok(())
            }
            DataChannelMessage::Other(raw) => {
                self.session.emit(RoomEvent::Message(raw));
                Ok(())
            }
        }
    }

    async fn start_media(&mut self) {
        if self.jvb_session.address.is_empty() {
            tracing::info!("no media server configured, presence only");
            return;
        }
        let started = tokio::time::timeout(
            self.config.http_timeout(),
            self.api.start(&self.jvb_session),
        )
        .await;
        let offers = match started {
            Ok(Ok(offers)) => offers,
            Ok(Err(e)) => {
                tracing::error!("media session failed to start: {e}");
                self.report(&e);
                return;
            }
            Err(_) => {
                let e = RoomError::Timeout("media session start".into());
                tracing::error!("{e}");
                self.report(&e);
                return;
            }
        };
        for offer in offers {
            let is_speaker = self.params.is_speaker;
            if let Err(e) = self
                .negotiate(&offer.id, offer.is_main, is_speaker, &offer.sdp, AnswerRoute::Http)
                .await
            {
                tracing::warn!("negotiation of {} failed: {e}", offer.id);
                self.report(&e);
            }
        }
    }

    async fn negotiate(
        &mut self,
        id: &str,
        is_main: bool,
        is_speaker: bool,
        offer: &str,
        route: AnswerRoute,
    ) -> Result<(), RoomError> {
        let answer = self.peers.initialize(id, is_main, is_speaker, offer).await?;
        let answer = sdp::apply_bandwidth(
            &answer,
            self.params.bandwidth.video_kbps,
            self.params.bandwidth.audio_kbps,
        );
        self.peers.set_local_description(id, &answer)?;
        match route {
            AnswerRoute::Http => tokio::time::timeout(
                self.config.http_timeout(),
                self.api.answer(&self.jvb_session, id, &answer),
            )
            .await
            .map_err(|_| RoomError::Timeout(format!("answer for {id}")))?,
            AnswerRoute::DataChannel => {
                let reply = DataChannelRequest::Answer { sdp: answer }.encode()?;
                self.peers.send_message(id, &reply)
            }
        }
    }

    fn refresh_visibility(&mut self) {
        let change = self.session.refresh_visibility();
        if change.is_empty() {
            return;
        }
        for id in &change.hidden {
            if let Some(closed) = self.peers.remove(id) {
                tracing::debug!("closing peer connection {id}, out of view");
                self.session.emit(RoomEvent::PeerConnectionStateChanged {
                    id: closed.id,
                    state: closed.to,
                });
            }
        }
        self.pending_subscription = true;
        self.flush_subscription();
    }

    fn main_channel(&self) -> Option<String> {
        self.peers.main_connection_id().map(str::to_string)
    }

    /// Send the owed subscribe message if the main channel is open.
    fn flush_subscription(&mut self) {
        if !self.pending_subscription {
            return;
        }
        let Some(main) = self.main_channel() else {
            return;
        };
        let request = DataChannelRequest::Subscribe {
            endpoints: self.session.visible_ids(),
            subscription_type: self.subscription_type,
        };
        match request
            .encode()
            .and_then(|text| self.peers.send_message(&main, &text))
        {
            Ok(()) => self.pending_subscription = false,
            Err(RoomError::ChannelNotReady(_)) => {
                tracing::debug!("subscription deferred until {main} is connected");
            }
            Err(e) => tracing::warn!("subscribe on {main} failed: {e}"),
        }
    }

    fn send_subscription_type(&self) {
        let Some(main) = self.main_channel() else {
            return;
        };
        let request = DataChannelRequest::SubscriptionType {
            subscription_type: self.subscription_type,
        };
        match request
            .encode()
            .and_then(|text| self.peers.send_message(&main, &text))
        {
            Ok(()) => {}
            Err(RoomError::ChannelNotReady(_)) => {
                tracing::debug!("subscription type deferred until {main} is connected");
            }
            Err(e) => tracing::warn!("subscription type on {main} failed: {e}"),
        }
    }

    /// Re-establish signaling after the server dropped it. Returns false when
    /// the room should close.
    async fn reconnect(&mut self) -> bool {
        self.signaling = None;
        if self.closed {
            return false;
        }
        tracing::warn!("signaling lost in room {}", self.params.room_id);
        self.set_state(RoomConnectionState::Connecting);

        let attempts = self.config.reconnect_attempts;
        for attempt in 1..=attempts {
            let delay = with_jitter(self.config.reconnect_delay(attempt));
            tracing::info!("reconnect attempt {attempt}/{attempts} in {delay:?}");
            let shutdown = self.shutdown.clone();
            if unless_shutdown(shutdown, tokio::time::sleep(delay)).await.is_none() {
                return false;
            }

            let shutdown = self.shutdown.clone();
            let opened = unless_shutdown(
                shutdown,
                open_signaling(
                    self.connector.as_ref(),
                    &self.params,
                    &self.client_id,
                    self.config.handshake_timeout(),
                ),
            )
            .await;
            match opened {
                None => return false,
                Some(Ok((channel, user_id, buffered))) => {
                    tracing::info!("signaling restored as {user_id}");
                    self.signaling = Some(channel);
                    self.session.set_local_id(user_id.clone());
                    self.peers.set_local_user_id(user_id);
                    self.set_state(RoomConnectionState::Connected);
                    let mut open = true;
                    for text in buffered {
                        open &= self.on_signal(text);
                    }
                    return open;
                }
                Some(Err(e)) => tracing::warn!("reconnect attempt {attempt} failed: {e}"),
            }
        }

        let error = RoomError::Connection(format!(
            "signaling lost after {attempts} reconnect attempts"
        ));
        tracing::error!("{error}");
        self.report(&error);
        false
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for change in self.peers.destroy_all() {
            self.session.emit(RoomEvent::PeerConnectionStateChanged {
                id: change.id,
                state: change.to,
            });
        }
        if let Some(mut signaling) = self.signaling.take() {
            signaling.close();
        }
        self.set_state(RoomConnectionState::Closed);
        tracing::info!("room {} closed", self.params.room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_half_the_delay() {
        let base = Duration::from_millis(400);
        for _ in 0..50 {
            let d = with_jitter(base);
            assert!(d >= base && d <= Duration::from_millis(600));
        }
    }

    #[test]
    fn zero_delay_has_no_jitter() {
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }
}
