use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::delegates::DatatrackDelegate;
use crate::peer::PeerConnectionState;
use crate::presence::DeviceState;
use crate::protocol::{Envelope, HandNotify, MuteRequest, PopupUsers, RadarVolume, Reaction, Timer};
use crate::radar::VisibilityChange;

/// Events emitted by a room to its listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    StateChanged(RoomConnectionState),
    RoomModeChanged { mode: String, is_first_connection: bool },
    ConnectionState(serde_json::Value),
    /// Signaling message the room does not interpret, passed through verbatim.
    Message(String),
    NativeState(DeviceState),
    ParticipantsVisibilityChanged(VisibilityChange),
    Path { user_id: String, x: f64, y: f64, duration: f64 },
    PopupUsers(PopupUsers),
    RadarVolume(RadarVolume),
    Reaction(Reaction),
    /// Stage request, invitation or refusal addressed to this client.
    HandNotify(HandNotify),
    /// The local user was removed; a live room closes right after.
    Banned,
    /// The local media named in the request was turned off.
    MuteRequested(MuteRequest),
    Timer(Timer),
    PeerConnectionStateChanged { id: String, state: PeerConnectionState },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomConnectionState {
    Connecting = 0,
    Connected = 1,
    Closed = 2,
}

/// Trait for receiving room events.
/// Implementations must be Send + Sync (called from the room task).
pub trait RoomEventListener: Send + Sync {
    fn on_event(&self, event: RoomEvent);
}

/// Dispatches events to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn RoomEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn RoomEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn emit(&self, event: RoomEvent) {
        // Snapshot so a listener may register another listener without deadlocking.
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

/// Forwards room events to a [`DatatrackDelegate`], encoding payloads as JSON.
pub struct DatatrackBridge {
    delegate: Arc<dyn DatatrackDelegate>,
}

impl DatatrackBridge {
    pub fn new(delegate: Arc<dyn DatatrackDelegate>) -> Self {
        Self { delegate }
    }
}

fn to_bytes<T: Serialize>(what: &str, value: &T) -> Option<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| tracing::warn!("failed to encode {what}: {e}"))
        .ok()
}

fn to_text<T: Serialize>(what: &str, value: &T) -> Option<String> {
    serde_json::to_string(value)
        .map_err(|e| tracing::warn!("failed to encode {what}: {e}"))
        .ok()
}

/// Re-encode a typed notification as the `{"type", "payload"}` message it came from.
fn to_message<T: Serialize>(kind: &str, payload: &T) -> Option<String> {
    let payload = serde_json::to_value(payload)
        .map_err(|e| tracing::warn!("failed to encode {kind}: {e}"))
        .ok()?;
    to_text(
        kind,
        &Envelope {
            kind: kind.to_string(),
            payload,
        },
    )
}

#[derive(Serialize)]
struct ReactionEnvelope<'a> {
    payload: &'a Reaction,
}

impl RoomEventListener for DatatrackBridge {
    fn on_event(&self, event: RoomEvent) {
        let d = &self.delegate;
        match event {
            RoomEvent::StateChanged(state) => d.on_state_changed(state as i64),
            RoomEvent::RoomModeChanged {
                mode,
                is_first_connection,
            } => d.on_change_room_mode(mode, is_first_connection),
            RoomEvent::ConnectionState(value) => {
                if let Some(bytes) = to_bytes("connection state", &value) {
                    d.on_connection_state(bytes);
                }
            }
            RoomEvent::Message(message) => d.on_message(message),
            RoomEvent::NativeState(state) => {
                if let Some(bytes) = to_bytes("native state", &state) {
                    d.on_native_state(bytes);
                }
            }
            RoomEvent::ParticipantsVisibilityChanged(change) => {
                if let Some(text) = to_text("visibility change", &change) {
                    d.on_participants_visibility_changed(text);
                }
            }
            RoomEvent::Path {
                user_id,
                x,
                y,
                duration,
            } => d.on_path(user_id, x, y, duration),
            RoomEvent::PopupUsers(users) => {
                if let Some(text) = to_text("popup users", &users) {
                    d.on_popup_users(text);
                }
            }
            RoomEvent::RadarVolume(volume) => {
                if let Some(bytes) = to_bytes("radar volume", &volume) {
                    d.on_radar_volume(bytes);
                }
            }
            RoomEvent::Reaction(reaction) => {
                let envelope = ReactionEnvelope { payload: &reaction };
                if let Some(bytes) = to_bytes("reaction", &envelope) {
                    d.on_reaction(bytes);
                }
            }
            RoomEvent::HandNotify(notify) => {
                if let Some(text) = to_message("serverHandNotify", &notify) {
                    d.on_message(text);
                }
            }
            RoomEvent::Banned => {
                if let Some(text) = to_message("ban", &serde_json::json!({})) {
                    d.on_message(text);
                }
            }
            RoomEvent::MuteRequested(request) => {
                if let Some(text) = to_message("muteRequest", &request) {
                    d.on_message(text);
                }
            }
            RoomEvent::Timer(timer) => {
                if let Some(text) = to_message("timer", &timer) {
                    d.on_message(text);
                }
            }
            RoomEvent::PeerConnectionStateChanged { id, state } => {
                tracing::debug!("peer connection {id} is {state}");
            }
            RoomEvent::Error(message) => d.on_error(message),
        }
    }
}
