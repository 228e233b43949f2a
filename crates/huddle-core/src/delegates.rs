//! Callback contracts implemented by the embedding application.

use crate::errors::RoomError;

/// Receives room events. Byte payloads are UTF-8 JSON.
///
/// For a given room, callbacks come from a single task and never overlap.
pub trait DatatrackDelegate: Send + Sync {
    fn on_change_room_mode(&self, mode: String, is_first_connection: bool);
    fn on_connection_state(&self, state: Vec<u8>);
    fn on_message(&self, message: String);
    fn on_native_state(&self, state: Vec<u8>);
    /// `{"shown": [ids], "hidden": [ids]}`
    fn on_participants_visibility_changed(&self, change: String);
    fn on_path(&self, user_id: String, x: f64, y: f64, duration: f64);
    fn on_popup_users(&self, users: String);
    fn on_radar_volume(&self, volume: Vec<u8>);
    fn on_reaction(&self, reaction: Vec<u8>);
    /// Room connection state: 0 connecting, 1 connected, 2 closed.
    fn on_state_changed(&self, state: i64);
    fn on_error(&self, _message: String) {}
}

/// The embedder's WebRTC engine. Calls may block; the room runs them off
/// its actor task where it waits on them.
pub trait JvBusterDelegate: Send + Sync {
    /// Create (or renegotiate) the connection `id` from `sdp_offer` and
    /// return the local answer.
    fn initialize_rtc_peer_connection(
        &self,
        user_id: &str,
        id: &str,
        is_main: bool,
        is_speaker: bool,
        sdp_offer: &str,
    ) -> Result<String, RoomError>;
    fn set_local_rtc_peer_connection_description(
        &self,
        id: &str,
        description: &str,
    ) -> Result<(), RoomError>;
    fn send_message_to_data_channel(&self, id: &str, message: &str) -> Result<(), RoomError>;
    /// `{"<userId>": {"video": bool, "audio": bool}}`
    fn process_meta_add(&self, meta: &str);
    fn process_meta_remove(&self, meta: &str);
    /// Close one connection, e.g. a participant that left the viewport.
    fn destroy_peer_connection(&self, id: &str);
    fn destroy_peer_connections(&self);
    fn on_error(&self, error: &str);
}

/// Media cues for recorded playback.
pub trait MediaDelegate: Send + Sync {
    fn on_prepare(&self, url: String, user_id: String);
    fn on_play(&self, url: String, user_id: String);
}
