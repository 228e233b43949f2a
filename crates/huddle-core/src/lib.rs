//! Room session and real-time presence engine.
//!
//! Joins live rooms over websocket signaling, keeps the participant roster
//! and radar in sync, drives the embedder's WebRTC engine through
//! [`delegates::JvBusterDelegate`], and replays recorded rooms.

pub mod base_room;
pub mod config;
pub mod delegates;
pub mod errors;
pub mod events;
pub mod geometry;
pub mod http;
pub mod jvbuster;
pub mod live_room;
pub mod logging;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod radar;
pub mod recorded_room;
pub mod sdp;
mod session;
pub mod signaling;
pub mod storage;

use std::sync::Arc;

pub use base_room::BaseRoom;
pub use config::EngineConfig;
pub use delegates::{DatatrackDelegate, JvBusterDelegate, MediaDelegate};
pub use errors::RoomError;
pub use events::{RoomConnectionState, RoomEvent, RoomEventListener};
pub use geometry::{LayoutParams, Point, Viewport};
pub use http::{HttpClient, ReqwestHttpClient};
pub use live_room::{LiveRoom, LiveRoomDeps, LiveRoomParams};
pub use peer::PeerConnectionState;
pub use presence::{DeviceCurrentUser, DeviceRoomUser, DeviceState};
pub use recorded_room::{PlaybackState, RecordedRoom};

use jvbuster::HttpJvbusterApi;
use signaling::WsConnector;

/// Install the process-wide storage, then logging with the stored filter.
pub fn init(store: Arc<dyn storage::KeyValueStorage>) {
    storage::set_storage(store);
    logging::init_logging(current_config().log_filter.as_deref());
    tracing::info!("engine initialized");
}

/// Engine settings from the process-wide storage, or defaults when none is set.
pub fn current_config() -> EngineConfig {
    storage::storage()
        .map(|s| EngineConfig::from_storage(s.as_ref()))
        .unwrap_or_default()
}

/// Join a live room over websocket signaling; media setup goes through
/// jvbuster's REST API on `http`.
pub async fn connect_to_live_room(
    params: LiveRoomParams,
    datatrack: Option<Arc<dyn DatatrackDelegate>>,
    jvbuster: Arc<dyn JvBusterDelegate>,
    http: Arc<dyn HttpClient>,
) -> Result<LiveRoom, RoomError> {
    let deps = LiveRoomDeps {
        datatrack,
        jvbuster,
        connector: Arc::new(WsConnector),
        jvbuster_api: Arc::new(HttpJvbusterApi::new(http)),
        config: current_config(),
    };
    LiveRoom::connect(params, deps).await
}

pub async fn replay_recorded_room(
    room_http_url: &str,
    layout: LayoutParams,
    datatrack: Option<Arc<dyn DatatrackDelegate>>,
    media: Arc<dyn MediaDelegate>,
    http: Arc<dyn HttpClient>,
) -> Result<RecordedRoom, RoomError> {
    RecordedRoom::open(room_http_url, layout, datatrack, media, http, &current_config()).await
}

/// Release process-wide handles set up by the host.
pub fn shutdown() {
    storage::clear_storage();
    tracing::info!("engine shut down");
}
