use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::delegates::JvBusterDelegate;
use crate::errors::RoomError;
use crate::sdp;

/// Connection id used for broadcasting to every open data channel.
pub const BROADCAST_ID: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Decode the engine's numeric state.
    pub fn from_raw(raw: i64) -> Result<Self, RoomError> {
        Ok(match raw {
            0 => Self::New,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnected,
            4 => Self::Failed,
            5 => Self::Closed,
            other => {
                return Err(RoomError::InvalidArgument(format!(
                    "unknown peer connection state {other}"
                )));
            }
        })
    }

    pub fn as_raw(self) -> i64 {
        match self {
            Self::New => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Disconnected => 3,
            Self::Failed => 4,
            Self::Closed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use PeerConnectionState::*;
        match self {
            New => matches!(next, Connecting | Failed | Closed),
            Connecting => matches!(next, Connected | Disconnected | Failed | Closed),
            Connected => matches!(next, Disconnected | Failed | Closed),
            Disconnected => matches!(next, Connecting | Connected | Failed | Closed),
            Failed | Closed => false,
        }
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub id: String,
    pub is_main: bool,
    pub is_speaker: bool,
    pub state: PeerConnectionState,
    pub remote_offer: String,
    pub local_description: Option<String>,
    pub negotiations: u32,
    disconnected_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub id: String,
    pub from: PeerConnectionState,
    pub to: PeerConnectionState,
}

/// Owns every peer connection of one live room, keyed by remote participant id.
pub struct PeerConnectionManager {
    connections: HashMap<String, PeerConnection>,
    engine: Arc<dyn JvBusterDelegate>,
    local_user_id: String,
    reconnect_grace: Duration,
    negotiation_timeout: Duration,
}

impl PeerConnectionManager {
    pub fn new(
        engine: Arc<dyn JvBusterDelegate>,
        local_user_id: String,
        reconnect_grace: Duration,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            engine,
            local_user_id,
            reconnect_grace,
            negotiation_timeout,
        }
    }

    pub fn set_local_user_id(&mut self, id: String) {
        self.local_user_id = id;
    }

    pub fn get(&self, id: &str) -> Option<&PeerConnection> {
        self.connections.get(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn main_connection_id(&self) -> Option<&str> {
        self.connections
            .values()
            .find(|pc| pc.is_main && !pc.state.is_terminal())
            .map(|pc| pc.id.as_str())
    }

    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .values()
            .filter(|pc| pc.state == PeerConnectionState::Connected)
            .map(|pc| pc.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Negotiate connection `id` from a remote offer and return the engine's answer.
    ///
    /// A malformed offer registers nothing. A live connection is renegotiated
    /// in place; a terminal one is replaced.
    pub async fn initialize(
        &mut self,
        id: &str,
        is_main: bool,
        is_speaker: bool,
        sdp_offer: &str,
    ) -> Result<String, RoomError> {
        let summary = sdp::validate_offer(sdp_offer)?;
        // subscriptions travel over the main connection's data channel
        if is_main && !summary.has_data_channel() {
            return Err(RoomError::Signaling(format!(
                "main connection {id} offers no data channel"
            )));
        }

        let engine = self.engine.clone();
        let (user_id, pc_id, offer) = (
            self.local_user_id.clone(),
            id.to_string(),
            sdp_offer.to_string(),
        );
        let call = tokio::task::spawn_blocking(move || {
            engine.initialize_rtc_peer_connection(&user_id, &pc_id, is_main, is_speaker, &offer)
        });
        let answer = match tokio::time::timeout(self.negotiation_timeout, call).await {
            Err(_) => return Err(RoomError::Timeout(format!("negotiation for {id}"))),
            Ok(Err(e)) => return Err(RoomError::Signaling(format!("engine task failed: {e}"))),
            Ok(Ok(result)) => result?,
        };
        if answer.trim().is_empty() {
            return Err(RoomError::Signaling(format!("empty answer for {id}")));
        }

        match self.connections.get_mut(id) {
            Some(pc) if !pc.state.is_terminal() => {
                tracing::debug!("renegotiating peer connection {id} ({})", pc.state);
                pc.remote_offer = sdp_offer.to_string();
                pc.is_speaker = is_speaker;
                pc.negotiations += 1;
            }
            _ => {
                tracing::info!("peer connection {id} registered (main={is_main})");
                self.connections.insert(
                    id.to_string(),
                    PeerConnection {
                        id: id.to_string(),
                        is_main,
                        is_speaker,
                        state: PeerConnectionState::Connecting,
                        remote_offer: sdp_offer.to_string(),
                        local_description: None,
                        negotiations: 1,
                        disconnected_at: None,
                    },
                );
            }
        }
        Ok(answer)
    }

    pub fn set_local_description(&mut self, id: &str, description: &str) -> Result<(), RoomError> {
        let pc = self
            .connections
            .get_mut(id)
            .ok_or_else(|| RoomError::NotFound(format!("peer connection {id}")))?;
        self.engine
            .set_local_rtc_peer_connection_description(id, description)?;
        pc.local_description = Some(description.to_string());
        Ok(())
    }

    /// Apply a state reported by the engine. Returns `None` when the state is
    /// unchanged.
    pub fn process_state(
        &mut self,
        id: &str,
        to: PeerConnectionState,
    ) -> Result<Option<StateChange>, RoomError> {
        let pc = self
            .connections
            .get_mut(id)
            .ok_or_else(|| RoomError::NotFound(format!("peer connection {id}")))?;
        let from = pc.state;
        if from == to {
            return Ok(None);
        }
        if !from.can_transition_to(to) {
            tracing::warn!("peer connection {id}: rejected transition {from} -> {to}");
            return Err(RoomError::InvalidTransition { from, to });
        }
        if from == PeerConnectionState::Disconnected && to != PeerConnectionState::Failed {
            let expired = pc
                .disconnected_at
                .is_some_and(|since| since.elapsed() > self.reconnect_grace);
            if expired && to != PeerConnectionState::Closed {
                tracing::warn!("peer connection {id}: reconnect grace elapsed, marking failed");
                pc.state = PeerConnectionState::Failed;
                pc.disconnected_at = None;
                return Err(RoomError::InvalidTransition { from, to });
            }
        }
        pc.state = to;
        pc.disconnected_at = (to == PeerConnectionState::Disconnected).then(Instant::now);
        tracing::debug!("peer connection {id}: {from} -> {to}");
        Ok(Some(StateChange {
            id: id.to_string(),
            from,
            to,
        }))
    }

    /// Send over a data channel. [`BROADCAST_ID`] targets every connected channel
    /// and skips the rest.
    pub fn send_message(&self, id: &str, message: &str) -> Result<(), RoomError> {
        if id == BROADCAST_ID {
            for target in self.connected_ids() {
                if let Err(e) = self.engine.send_message_to_data_channel(&target, message) {
                    tracing::warn!("broadcast to {target} failed: {e}");
                }
            }
            return Ok(());
        }
        let pc = self
            .connections
            .get(id)
            .ok_or_else(|| RoomError::NotFound(format!("peer connection {id}")))?;
        if pc.state != PeerConnectionState::Connected {
            return Err(RoomError::ChannelNotReady(format!("{id} is {}", pc.state)));
        }
        self.engine.send_message_to_data_channel(id, message)
    }

    /// Close and drop one connection.
    pub fn remove(&mut self, id: &str) -> Option<StateChange> {
        let pc = self.connections.remove(id)?;
        self.engine.destroy_peer_connection(id);
        (pc.state != PeerConnectionState::Closed).then(|| StateChange {
            id: pc.id,
            from: pc.state,
            to: PeerConnectionState::Closed,
        })
    }

    /// Close everything. Each connection reports `Closed` once; calling again
    /// is a no-op.
    pub fn destroy_all(&mut self) -> Vec<StateChange> {
        if self.connections.is_empty() {
            return Vec::new();
        }
        let mut changes: Vec<StateChange> = self
            .connections
            .drain()
            .filter(|(_, pc)| pc.state != PeerConnectionState::Closed)
            .map(|(id, pc)| StateChange {
                id,
                from: pc.state,
                to: PeerConnectionState::Closed,
            })
            .collect();
        changes.sort_by(|a, b| a.id.cmp(&b.id));
        self.engine.destroy_peer_connections();
        tracing::info!("destroyed {} peer connections", changes.len());
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:1\r\n";

    #[derive(Default)]
    struct FakeEngine {
        initialized: AtomicUsize,
        destroyed: AtomicUsize,
        closed: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, String)>>,
        delay: Option<Duration>,
    }

    impl JvBusterDelegate for FakeEngine {
        fn initialize_rtc_peer_connection(
            &self,
            _user_id: &str,
            id: &str,
            _is_main: bool,
            _is_speaker: bool,
            _sdp_offer: &str,
        ) -> Result<String, RoomError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(format!("v=0\r\no=- 9 9 IN IP4 0.0.0.0\r\ns={id}\r\nt=0 0\r\nm=audio 9 X 0\r\n"))
        }
        fn set_local_rtc_peer_connection_description(&self, _: &str, _: &str) -> Result<(), RoomError> {
            Ok(())
        }
        fn send_message_to_data_channel(&self, id: &str, message: &str) -> Result<(), RoomError> {
            self.sent.lock().unwrap().push((id.to_string(), message.to_string()));
            Ok(())
        }
        fn process_meta_add(&self, _: &str) {}
        fn process_meta_remove(&self, _: &str) {}
        fn destroy_peer_connection(&self, id: &str) {
            self.closed.lock().unwrap().push(id.to_string());
        }
        fn destroy_peer_connections(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _: &str) {}
    }

    fn manager(engine: Arc<FakeEngine>) -> PeerConnectionManager {
        PeerConnectionManager::new(
            engine,
            "local".into(),
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn raw_states_round_trip() {
        for raw in 0..=5 {
            assert_eq!(PeerConnectionState::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert!(PeerConnectionState::from_raw(6).is_err());
    }

    #[test]
    fn terminal_states_accept_nothing() {
        use PeerConnectionState::*;
        for terminal in [Failed, Closed] {
            for next in [New, Connecting, Connected, Disconnected, Failed, Closed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!New.can_transition_to(Connected));
    }

    #[tokio::test]
    async fn malformed_offer_registers_nothing() {
        let engine = Arc::new(FakeEngine::default());
        let mut peers = manager(engine.clone());
        let err = peers.initialize("u1", false, false, "not sdp").await.unwrap_err();
        assert!(matches!(err, RoomError::Signaling(_)));
        assert!(peers.get("u1").is_none());
        assert_eq!(engine.initialized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn main_offer_needs_a_data_channel() {
        let engine = Arc::new(FakeEngine::default());
        let mut peers = manager(engine.clone());
        let audio_only = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
        let err = peers.initialize("main", true, false, audio_only).await.unwrap_err();
        assert!(matches!(err, RoomError::Signaling(_)));
        assert!(peers.is_empty());
        assert_eq!(engine.initialized.load(Ordering::SeqCst), 0);

        // secondary connections carry media only
        peers.initialize("b", false, false, audio_only).await.unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[tokio::test]
    async fn reinitialize_renegotiates_in_place() {
        let engine = Arc::new(FakeEngine::default());
        let mut peers = manager(engine.clone());
        peers.initialize("u1", true, false, OFFER).await.unwrap();
        peers.process_state("u1", PeerConnectionState::Connected).unwrap();
        peers.initialize("u1", true, true, OFFER).await.unwrap();

        assert_eq!(peers.len(), 1);
        let pc = peers.get("u1").unwrap();
        assert_eq!(pc.state, PeerConnectionState::Connected);
        assert_eq!(pc.negotiations, 2);
        assert!(pc.is_speaker);
        assert_eq!(peers.main_connection_id(), Some("u1"));
    }

    #[tokio::test]
    async fn terminal_connection_is_replaced() {
        let mut peers = manager(Arc::new(FakeEngine::default()));
        peers.initialize("u1", false, false, OFFER).await.unwrap();
        peers.process_state("u1", PeerConnectionState::Failed).unwrap();
        peers.initialize("u1", false, false, OFFER).await.unwrap();
        let pc = peers.get("u1").unwrap();
        assert_eq!(pc.state, PeerConnectionState::Connecting);
        assert_eq!(pc.negotiations, 1);
    }

    #[tokio::test]
    async fn slow_engine_times_out() {
        let engine = Arc::new(FakeEngine {
            delay: Some(Duration::from_millis(200)),
            ..FakeEngine::default()
        });
        let mut peers = PeerConnectionManager::new(
            engine,
            "local".into(),
            Duration::from_secs(10),
            Duration::from_millis(20),
        );
        let err = peers.initialize("u1", false, false, OFFER).await.unwrap_err();
        assert!(matches!(err, RoomError::Timeout(_)));
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected_and_state_kept() {
        let mut peers = manager(Arc::new(FakeEngine::default()));
        peers.initialize("u1", false, false, OFFER).await.unwrap();
        peers.process_state("u1", PeerConnectionState::Closed).unwrap();
        let err = peers
            .process_state("u1", PeerConnectionState::Connected)
            .unwrap_err();
        assert!(matches!(
            err,
            RoomError::InvalidTransition {
                from: PeerConnectionState::Closed,
                to: PeerConnectionState::Connected
            }
        ));
        assert_eq!(peers.get("u1").unwrap().state, PeerConnectionState::Closed);
    }

    #[tokio::test]
    async fn reconnect_inside_grace_window() {
        let mut peers = manager(Arc::new(FakeEngine::default()));
        peers.initialize("u1", false, false, OFFER).await.unwrap();
        peers.process_state("u1", PeerConnectionState::Connected).unwrap();
        peers.process_state("u1", PeerConnectionState::Disconnected).unwrap();
        let change = peers
            .process_state("u1", PeerConnectionState::Connecting)
            .unwrap()
            .unwrap();
        assert_eq!(change.from, PeerConnectionState::Disconnected);
        assert_eq!(change.to, PeerConnectionState::Connecting);
    }

    #[tokio::test]
    async fn reconnect_after_grace_fails_connection() {
        let mut peers = PeerConnectionManager::new(
            Arc::new(FakeEngine::default()),
            "local".into(),
            Duration::ZERO,
            Duration::from_secs(1),
        );
        peers.initialize("u1", false, false, OFFER).await.unwrap();
        peers.process_state("u1", PeerConnectionState::Connected).unwrap();
        peers.process_state("u1", PeerConnectionState::Disconnected).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(peers.process_state("u1", PeerConnectionState::Connected).is_err());
        assert_eq!(peers.get("u1").unwrap().state, PeerConnectionState::Failed);
    }

    #[tokio::test]
    async fn send_requires_connected_channel() {
        let engine = Arc::new(FakeEngine::default());
        let mut peers = manager(engine.clone());
        peers.initialize("u1", false, false, OFFER).await.unwrap();
        peers.initialize("u2", false, false, OFFER).await.unwrap();

        assert!(matches!(
            peers.send_message("u1", "hi"),
            Err(RoomError::ChannelNotReady(_))
        ));
        assert!(matches!(
            peers.send_message("nobody", "hi"),
            Err(RoomError::NotFound(_))
        ));

        peers.process_state("u1", PeerConnectionState::Connected).unwrap();
        peers.send_message("u1", "hi").unwrap();
        peers.send_message(BROADCAST_ID, "all").unwrap();
        let sent = engine.sent.lock().unwrap();
        assert_eq!(
            *sent,
            [("u1".to_string(), "hi".to_string()), ("u1".to_string(), "all".to_string())]
        );
    }

    #[tokio::test]
    async fn set_local_description_unknown_id() {
        let mut peers = manager(Arc::new(FakeEngine::default()));
        assert!(matches!(
            peers.set_local_description("ghost", "v=0"),
            Err(RoomError::NotFound(_))
        ));
        peers.initialize("u1", false, false, OFFER).await.unwrap();
        peers.set_local_description("u1", "v=0").unwrap();
        assert_eq!(peers.get("u1").unwrap().local_description.as_deref(), Some("v=0"));
    }

    #[tokio::test]
    async fn destroy_all_closes_each_connection_once() {
        let engine = Arc::new(FakeEngine::default());
        let mut peers = manager(engine.clone());
        peers.initialize("a", true, false, OFFER).await.unwrap();
        peers.initialize("b", false, false, OFFER).await.unwrap();

        let first = peers.destroy_all();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|c| c.to == PeerConnectionState::Closed));
        assert!(peers.destroy_all().is_empty());
        assert_eq!(engine.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_closes_the_engine_connection() {
        let engine = Arc::new(FakeEngine::default());
        let mut peers = manager(engine.clone());
        peers.initialize("a", true, false, OFFER).await.unwrap();
        peers.initialize("b", false, false, OFFER).await.unwrap();

        let change = peers.remove("b").unwrap();
        assert_eq!(change.from, PeerConnectionState::Connecting);
        assert_eq!(change.to, PeerConnectionState::Closed);
        assert!(peers.remove("b").is_none());
        assert_eq!(*engine.closed.lock().unwrap(), ["b"]);
        assert_eq!(peers.len(), 1);
        assert_eq!(engine.destroyed.load(Ordering::SeqCst), 0);
    }
}
