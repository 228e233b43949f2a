use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::json;

use huddle_core::errors::RoomError;
use huddle_core::http::{HttpClient, HttpRequest, HttpResponse};
use huddle_core::{EngineConfig, LayoutParams, MediaDelegate, PlaybackState, RecordedRoom};

struct StaticHttp {
    status: u16,
    body: String,
}

impl HttpClient for StaticHttp {
    fn authorize<'a>(&'a self, _query: &'a str) -> BoxFuture<'a, Result<String, RoomError>> {
        Box::pin(async { Ok(String::new()) })
    }

    fn request(&self, _request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RoomError>> {
        let response = HttpResponse {
            status: self.status,
            body: self.body.clone(),
        };
        Box::pin(async move { Ok(response) })
    }

    fn send_log_file<'a>(&'a self, _: &'a Path, _: Vec<u8>) -> BoxFuture<'a, Result<(), RoomError>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Default)]
struct Cues(Mutex<Vec<String>>);

impl MediaDelegate for Cues {
    fn on_prepare(&self, url: String, user_id: String) {
        self.0.lock().unwrap().push(format!("prepare {user_id} {url}"));
    }

    fn on_play(&self, url: String, user_id: String) {
        self.0.lock().unwrap().push(format!("play {user_id} {url}"));
    }
}

fn recording(gap_ms: u64) -> String {
    json!({
        "roomId": "r1",
        "durationMs": gap_ms * 3,
        "events": [
            {"at": 0, "type": "state", "payload": {
                "current": {"isAdmin": false},
                "room": [
                    {"id": "host", "isAdmin": true, "mode": "room"},
                    {"id": "guest", "mode": "popup", "isHandRaised": true}
                ]
            }},
            {"at": gap_ms, "type": "media", "payload": {"url": "https://cdn/a.m3u8", "userId": "host", "action": "prepare"}},
            {"at": gap_ms * 2, "type": "media", "payload": {"url": "https://cdn/a.m3u8", "userId": "host", "action": "play"}},
            {"at": gap_ms * 3, "type": "serverAdminNotify", "payload": {"id": "host", "type": "remove"}}
        ]
    })
    .to_string()
}

async fn open(status: u16, body: String) -> Result<(RecordedRoom, Arc<Cues>), RoomError> {
    let cues = Arc::new(Cues::default());
    let room = RecordedRoom::open(
        "https://api.example.com/recordings/r1",
        LayoutParams::default(),
        None,
        cues.clone(),
        Arc::new(StaticHttp { status, body }),
        &EngineConfig::default(),
    )
    .await?;
    Ok((room, cues))
}

async fn wait_for(room: &RecordedRoom, state: PlaybackState) {
    let mut rx = room.watch_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .expect("playback state not reached")
        .unwrap();
}

#[tokio::test]
async fn replays_timeline_to_the_end() {
    let (room, cues) = open(200, recording(5)).await.unwrap();
    assert_eq!(room.room_id(), "r1");
    assert_eq!(room.duration(), Duration::from_millis(15));

    wait_for(&room, PlaybackState::Stopped).await;
    assert_eq!(
        *cues.0.lock().unwrap(),
        [
            "prepare host https://cdn/a.m3u8",
            "play host https://cdn/a.m3u8"
        ]
    );
    let state = room.device_state();
    assert_eq!(state.room.len(), 2);
    assert_eq!(state.raised_hands_count, 1);
    assert!(!room.is_there_other_admin());
    room.stop().await;
}

#[tokio::test]
async fn pause_holds_the_timeline() {
    let (room, cues) = open(200, recording(40)).await.unwrap();
    room.pause();
    wait_for(&room, PlaybackState::Paused).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cues.0.lock().unwrap().is_empty());
    assert_eq!(room.state(), PlaybackState::Paused);

    room.resume();
    wait_for(&room, PlaybackState::Stopped).await;
    assert_eq!(cues.0.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn admin_queries_match_a_live_room() {
    let (room, _) = open(200, recording(500)).await.unwrap();
    // the first event is due immediately
    tokio::time::timeout(Duration::from_secs(2), async {
        while room.device_state().room.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(room.is_there_other_admin());
    let admins: Vec<String> = serde_json::from_slice(&room.admins().unwrap()).unwrap();
    assert_eq!(admins, ["host"]);
    let hands: Vec<String> = serde_json::from_slice(&room.hands().unwrap()).unwrap();
    assert_eq!(hands, ["guest"]);
    room.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (room, cues) = open(200, recording(1_000)).await.unwrap();
    room.stop().await;
    room.stop().await;
    assert_eq!(room.state(), PlaybackState::Stopped);
    assert!(cues.0.lock().unwrap().is_empty());
    room.pause();
}

#[tokio::test]
async fn missing_recording_is_not_found() {
    assert!(matches!(
        open(404, String::new()).await,
        Err(RoomError::NotFound(_))
    ));
    assert!(matches!(
        open(200, "not json".into()).await,
        Err(RoomError::NotFound(_))
    ));
}
