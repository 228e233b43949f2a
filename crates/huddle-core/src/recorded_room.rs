use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::base_room::BaseRoom;
use crate::config::EngineConfig;
use crate::delegates::{DatatrackDelegate, MediaDelegate};
use crate::errors::RoomError;
use crate::events::{DatatrackBridge, EventEmitter, RoomConnectionState, RoomEvent, RoomEventListener};
use crate::geometry::{LayoutParams, Viewport};
use crate::http::{HttpClient, HttpRequest};
use crate::live_room::sleep_until;
use crate::presence::DeviceState;
use crate::protocol::{Envelope, ServerMessage};
use crate::session::PresenceSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Started,
    Paused,
    Stopped,
}

/// One entry of a recording, `at` milliseconds after the start.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimelineEvent {
    pub at: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub room_id: String,
    #[serde(default)]
    pub duration_ms: u64,
    pub events: Vec<TimelineEvent>,
}

impl Manifest {
    pub fn parse(json: &str) -> Result<Self, RoomError> {
        let mut manifest: Manifest = serde_json::from_str(json)
            .map_err(|e| RoomError::NotFound(format!("invalid recording manifest: {e}")))?;
        // stable: same-offset events keep file order
        manifest.events.sort_by_key(|e| e.at);
        Ok(manifest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MediaAction {
    Prepare,
    Play,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaCue {
    url: String,
    user_id: String,
    action: MediaAction,
}

enum PlaybackCommand {
    Pause,
    Resume,
    Stop,
    SetViewport(Viewport),
}

/// Handle to a recording being replayed.
pub struct RecordedRoom {
    commands: mpsc::UnboundedSender<PlaybackCommand>,
    state: watch::Receiver<PlaybackState>,
    base: BaseRoom,
    emitter: EventEmitter,
    room_id: String,
    duration: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecordedRoom {
    /// Fetch the manifest at `room_http_url` and start playback.
    ///
    /// A URL that does not resolve, or a manifest that does not parse, is `NotFound`.
    pub async fn open(
        room_http_url: &str,
        layout: LayoutParams,
        datatrack: Option<Arc<dyn DatatrackDelegate>>,
        media: Arc<dyn MediaDelegate>,
        http: Arc<dyn HttpClient>,
        config: &EngineConfig,
    ) -> Result<RecordedRoom, RoomError> {
        layout.validate()?;
        let fetched = tokio::time::timeout(
            config.http_timeout(),
            http.request(HttpRequest::get(room_http_url)),
        )
        .await
        .map_err(|_| RoomError::NotFound(format!("recording {room_http_url}: timed out")))?
        .map_err(|e| RoomError::NotFound(format!("recording {room_http_url}: {e}")))?;
        if !fetched.is_success() {
            return Err(RoomError::NotFound(format!(
                "recording {room_http_url}: status {}",
                fetched.status
            )));
        }
        let manifest = Manifest::parse(&fetched.body)?;
        tracing::info!(
            "replaying room {} ({} events)",
            manifest.room_id,
            manifest.events.len()
        );
        Ok(Self::start(manifest, layout, datatrack, media))
    }

    /// Start playback of an already loaded manifest.
    pub fn start(
        manifest: Manifest,
        layout: LayoutParams,
        datatrack: Option<Arc<dyn DatatrackDelegate>>,
        media: Arc<dyn MediaDelegate>,
    ) -> RecordedRoom {
        let emitter = EventEmitter::new();
        if let Some(datatrack) = datatrack {
            emitter.add_listener(Arc::new(DatatrackBridge::new(datatrack)));
        }
        let base = BaseRoom::new();
        let session = PresenceSession::new(base.clone(), emitter.clone(), layout);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PlaybackState::Started);

        let room_id = manifest.room_id.clone();
        let duration = Duration::from_millis(manifest.duration_ms);
        let player = Player {
            events: manifest.events,
            cursor: 0,
            session,
            media,
            commands: command_rx,
            state: state_tx,
        };
        emitter.emit(RoomEvent::StateChanged(RoomConnectionState::Connected));
        let task = tokio::spawn(player.run());

        RecordedRoom {
            commands: command_tx,
            state: state_rx,
            base,
            emitter,
            room_id,
            duration,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn add_listener(&self, listener: Arc<dyn RoomEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PlaybackState> {
        self.state.clone()
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

    fn enqueue(&self, command: PlaybackCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("playback finished, dropping command");
        }
    }

    pub fn pause(&self) {
        self.enqueue(PlaybackCommand::Pause);
    }

    pub fn resume(&self) {
        self.enqueue(PlaybackCommand::Resume);
    }

    pub fn set_viewport(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> Result<(), RoomError> {
        self.enqueue(PlaybackCommand::SetViewport(Viewport::new(x1, y1, x2, y2)?));
        Ok(())
    }

    /// Stop playback and wait for it. Calling again is a no-op.
    pub async fn stop(&self) {
        self.enqueue(PlaybackCommand::Stop);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("playback task ended abnormally: {e}");
            }
        }
    }
}

struct Player {
    events: Vec<TimelineEvent>,
    cursor: usize,
    session: PresenceSession,
    media: Arc<dyn MediaDelegate>,
    commands: mpsc::UnboundedReceiver<PlaybackCommand>,
    state: watch::Sender<PlaybackState>,
}

impl Player {
    async fn run(mut self) {
        // playback position 0 corresponds to `origin`
        let mut origin = Instant::now();
        let mut paused_at: Option<Instant> = None;

        while self.cursor < self.events.len() {
            let next = paused_at
                .is_none()
                .then(|| origin + Duration::from_millis(self.events[self.cursor].at));
            tokio::select! {
                _ = sleep_until(next) => {
                    let event = self.events[self.cursor].clone();
                    self.cursor += 1;
                    self.dispatch(event);
                }
                command = self.commands.recv() => match command {
                    Some(PlaybackCommand::Pause) => {
                        if paused_at.is_none() {
                            paused_at = Some(Instant::now());
                            self.state.send_replace(PlaybackState::Paused);
                        }
                    }
                    Some(PlaybackCommand::Resume) => {
                        if let Some(at) = paused_at.take() {
                            origin += at.elapsed();
                            self.state.send_replace(PlaybackState::Started);
                        }
                    }
                    Some(PlaybackCommand::SetViewport(viewport)) => {
                        self.session.set_viewport(viewport);
                        self.session.refresh_visibility();
                    }
                    Some(PlaybackCommand::Stop) | None => break,
                },
            }
        }
        tracing::info!("playback stopped at event {}/{}", self.cursor, self.events.len());
        self.state.send_replace(PlaybackState::Stopped);
        self.session
            .emit(RoomEvent::StateChanged(RoomConnectionState::Closed));
    }

    fn dispatch(&mut self, event: TimelineEvent) {
        if event.kind == "media" {
            match serde_json::from_value::<MediaCue>(event.payload) {
                Ok(cue) => match cue.action {
                    MediaAction::Prepare => self.media.on_prepare(cue.url, cue.user_id),
                    MediaAction::Play => self.media.on_play(cue.url, cue.user_id),
                },
                Err(e) => tracing::warn!("skipping bad media cue at {}ms: {e}", event.at),
            }
            return;
        }
        let at = event.at;
        let envelope = Envelope {
            kind: event.kind,
            payload: event.payload,
        };
        let parsed = serde_json::to_string(&envelope)
            .map_err(RoomError::from)
            .and_then(|text| ServerMessage::parse(&text));
        match parsed {
            Ok(message) => {
                if self.session.handle(message) {
                    self.session.refresh_visibility();
                }
            }
            Err(e) => tracing::warn!("skipping bad event at {at}ms: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_events_are_sorted_by_offset() {
        let manifest = Manifest::parse(
            r#"{"roomId":"r","durationMs":30,"events":[
                {"at":20,"type":"path","payload":{}},
                {"at":0,"type":"state","payload":{}},
                {"at":20,"type":"reactions","payload":[]}
            ]}"#,
        )
        .unwrap();
        let kinds: Vec<&str> = manifest.events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, ["state", "path", "reactions"]);
    }

    #[test]
    fn invalid_manifest_is_not_found() {
        assert!(matches!(
            Manifest::parse("<html>404</html>"),
            Err(RoomError::NotFound(_))
        ));
        assert!(matches!(
            Manifest::parse(r#"{"roomId":"r"}"#),
            Err(RoomError::NotFound(_))
        ));
    }
}
