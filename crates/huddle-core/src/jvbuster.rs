//! Session setup with the jvbuster media server.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::RoomError;
use crate::http::{HttpClient, HttpRequest};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthLimits {
    /// kbit/s, 0 = unlimited
    pub video_kbps: u32,
    /// kbit/s, 0 = unlimited
    pub audio_kbps: u32,
    pub full_res_circle_diameter_inch: f64,
    pub viewport_width_inch: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JvbusterSession {
    pub address: String,
    pub token: String,
    pub user_id: String,
    pub is_speaker: bool,
    pub bandwidth: BandwidthLimits,
}

/// A peer connection offered by the media server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JvbusterOffer {
    pub id: String,
    #[serde(default)]
    pub is_main: bool,
    pub sdp: String,
}

pub trait JvbusterApi: Send + Sync {
    /// Open a media session; returns the initial offers.
    fn start<'a>(
        &'a self,
        session: &'a JvbusterSession,
    ) -> BoxFuture<'a, Result<Vec<JvbusterOffer>, RoomError>>;
    fn answer<'a>(
        &'a self,
        session: &'a JvbusterSession,
        id: &'a str,
        sdp: &'a str,
    ) -> BoxFuture<'a, Result<(), RoomError>>;
}

#[derive(Deserialize)]
struct StartResponse {
    offers: Vec<JvbusterOffer>,
}

/// Talks to jvbuster's REST endpoints through an [`HttpClient`].
pub struct HttpJvbusterApi {
    http: Arc<dyn HttpClient>,
}

impl HttpJvbusterApi {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }
}

fn endpoint(address: &str, path: &str) -> String {
    format!("{}/{path}", address.trim_end_matches('/'))
}

impl JvbusterApi for HttpJvbusterApi {
    fn start<'a>(
        &'a self,
        session: &'a JvbusterSession,
    ) -> BoxFuture<'a, Result<Vec<JvbusterOffer>, RoomError>> {
        Box::pin(async move {
            let body = json!({
                "token": session.token,
                "userId": session.user_id,
                "isSpeaker": session.is_speaker,
                "bandwidth": session.bandwidth,
            });
            let resp = self
                .http
                .request(HttpRequest::post(endpoint(&session.address, "session/start"), body))
                .await?;
            if !resp.is_success() {
                return Err(RoomError::Connection(format!(
                    "jvbuster start returned status {}",
                    resp.status
                )));
            }
            let offers = resp.json::<StartResponse>()?.offers;
            tracing::info!("jvbuster session started with {} offers", offers.len());
            Ok(offers)
        })
    }

    fn answer<'a>(
        &'a self,
        session: &'a JvbusterSession,
        id: &'a str,
        sdp: &'a str,
    ) -> BoxFuture<'a, Result<(), RoomError>> {
        Box::pin(async move {
            let body = json!({ "token": session.token, "id": id, "sdp": sdp });
            let resp = self
                .http
                .request(HttpRequest::post(endpoint(&session.address, "session/answer"), body))
                .await?;
            if !resp.is_success() {
                return Err(RoomError::Signaling(format!(
                    "jvbuster rejected answer for {id}: status {}",
                    resp.status
                )));
            }
            Ok(())
        })
    }
}
