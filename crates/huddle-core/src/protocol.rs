//! JSON messages exchanged over the signaling socket and the media-server
//! data channel. Both use a `{"type": ..., "payload": ...}` envelope.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RoomError;
use crate::geometry::LayoutParams;
use crate::presence::{DeviceRoomUser, RoomSnapshot};

/// Loudest value `update_audio_level` accepts.
pub const AUDIO_LEVEL_MAX: u16 = 32767;
/// Seconds a reaction stays visible.
pub const REACTION_DURATION: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, RoomError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn decode<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, RoomError> {
    serde_json::from_value(payload)
        .map_err(|e| RoomError::Signaling(format!("invalid {kind} payload: {e}")))
}

/// Check a caller-supplied message: a JSON object with a string `type`.
pub fn validate_raw(json: &str) -> Result<String, RoomError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| RoomError::InvalidArgument(format!("message is not json: {e}")))?;
    match value.get("type") {
        Some(Value::String(_)) if value.is_object() => Ok(value.to_string()),
        _ => Err(RoomError::InvalidArgument(
            "message must be an object with a string \"type\"".into(),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Reaction {
    pub from_id: String,
    pub reaction: String,
    pub duration: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PopupUser {
    pub id: String,
    pub avatar: String,
    pub is_admin: bool,
    pub name: String,
    pub surname: String,
    pub is_local: bool,
    pub is_owner: bool,
    pub reaction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PopupUsers {
    pub name: String,
    pub speakers_count: u32,
    pub users: Vec<PopupUser>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserVolume {
    pub id: String,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RadarVolume {
    pub is_subscriber: bool,
    pub screen_volume: f64,
    pub radar_volume: Vec<UserVolume>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserPath {
    pub user_id: String,
    pub x: f64,
    pub y: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub room_id: String,
    pub access_token: String,
    pub room_pass: String,
    pub client_id: String,
    pub layout: LayoutParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub video: bool,
    pub audio: bool,
    pub phone_call: bool,
}

/// Payload of a `broadcast`, relayed by the server to everyone in the room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Broadcast {
    Nonverbal {
        message: String,
        duration: u32,
    },
    /// Round timer; a non-positive duration stops it.
    Timer {
        duration: i64,
        #[serde(rename = "startUserName", skip_serializing_if = "Option::is_none")]
        start_user_name: Option<String>,
    },
}

/// Who lowers a raised hand: an admin or the participant themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandDownBy {
    Admin,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuteKind {
    Audio,
    Video,
}

/// Messages the client sends over signaling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    Register(Register),
    UserPath { x: f64, y: f64 },
    AudioLevel { level: u16 },
    MediaState(MediaState),
    Broadcast(Broadcast),
    RemoveReaction { id: String },
    HandUp { id: String },
    HandDown {
        id: String,
        #[serde(rename = "type")]
        by: HandDownBy,
    },
    MoveToStage { id: String },
    MoveFromStage { id: String },
    CallToStage { id: String },
    DeclineCallToStage {
        #[serde(rename = "inviterId")]
        inviter_id: String,
    },
    AddAdmin { id: String },
    RemoveAdmin { id: String },
    BecomeAbsoluteSpeaker { state: bool },
    Mute {
        #[serde(rename = "type")]
        kind: MuteKind,
        id: String,
    },
    SetHandsAllowed { value: bool },
    UpdateProfile {},
}

impl ClientMessage {
    pub fn reaction(reaction: &str) -> Self {
        ClientMessage::Broadcast(Broadcast::Nonverbal {
            message: reaction.to_string(),
            duration: REACTION_DURATION,
        })
    }

    pub fn timer(duration: i64, start_user_name: Option<&str>) -> Self {
        ClientMessage::Broadcast(Broadcast::Timer {
            duration,
            start_user_name: start_user_name.map(str::to_string),
        })
    }

    pub fn encode(&self) -> Result<String, RoomError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandNotifyKind {
    /// A listener asks to go on stage.
    Request,
    /// An admin invites the participant on stage.
    Invite,
    DeclineInvite,
}

/// `serverHandNotify`: a stage request, invitation or refusal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandNotify {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: HandNotifyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<String>,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub from_surname: String,
}

/// `muteRequest`: someone with the rights to do so turned our media off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteRequest {
    #[serde(rename = "type")]
    pub kind: MuteKind,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub from_surname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    pub duration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_user_name: Option<String>,
}

impl Timer {
    pub fn is_stop(&self) -> bool {
        self.duration <= 0
    }
}

/// Messages the server sends over signaling.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Registered { user_id: String, mode: Option<String> },
    Error { reason: String },
    State(Box<RoomSnapshot>),
    UserUpdate(Box<DeviceRoomUser>),
    UserLeave { user_id: String },
    Path(UserPath),
    Reactions(Vec<Reaction>),
    PopupUsers(PopupUsers),
    ChangeRoomMode { mode: String, is_first_connection: bool },
    RadarVolume(RadarVolume),
    ConnectionState(Value),
    HandNotify(HandNotify),
    AdminNotify { user_id: String, is_admin: bool },
    /// False once an admin silenced the room.
    HandsAllowed(bool),
    AbsoluteSpeaker { user_id: String, present: bool },
    /// The local user was removed from the room.
    Ban,
    MuteRequest(MuteRequest),
    Timer(Timer),
    /// Anything else, kept verbatim.
    Other(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisteredPayload {
    user_id: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserIdPayload {
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomModePayload {
    mode: String,
    #[serde(default)]
    is_first_connection: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum AdminChange {
    Add,
    Remove,
}

#[derive(Deserialize)]
struct AdminNotifyPayload {
    id: String,
    #[serde(rename = "type")]
    change: AdminChange,
}

#[derive(Deserialize)]
struct HandsAllowedPayload {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum SpeakerChange {
    Set,
    Clear,
}

#[derive(Deserialize)]
struct AbsoluteSpeakerPayload {
    id: String,
    #[serde(rename = "type")]
    change: SpeakerChange,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn error_reason(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("reason")
            .or_else(|| map.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        _ => "unknown".to_string(),
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, RoomError> {
        let Envelope { kind, payload } = Envelope::parse(text)?;
        Ok(match kind.as_str() {
            "registered" => {
                let p: RegisteredPayload = decode(&kind, payload)?;
                ServerMessage::Registered {
                    user_id: p.user_id,
                    mode: p.mode,
                }
            }
            "error" => ServerMessage::Error {
                reason: error_reason(&payload),
            },
            "state" => ServerMessage::State(Box::new(decode(&kind, payload)?)),
            "userUpdate" => ServerMessage::UserUpdate(Box::new(decode(&kind, payload)?)),
            "userLeave" => {
                let p: UserIdPayload = decode(&kind, payload)?;
                ServerMessage::UserLeave { user_id: p.user_id }
            }
            "path" => ServerMessage::Path(decode(&kind, payload)?),
            "reactions" => match decode(&kind, payload)? {
                OneOrMany::One(r) => ServerMessage::Reactions(vec![r]),
                OneOrMany::Many(rs) => ServerMessage::Reactions(rs),
            },
            "popupUsers" => ServerMessage::PopupUsers(decode(&kind, payload)?),
            "changeRoomMode" => {
                let p: RoomModePayload = decode(&kind, payload)?;
                ServerMessage::ChangeRoomMode {
                    mode: p.mode,
                    is_first_connection: p.is_first_connection,
                }
            }
            "radarVolume" => ServerMessage::RadarVolume(decode(&kind, payload)?),
            "connectionState" => ServerMessage::ConnectionState(payload),
            "serverHandNotify" => ServerMessage::HandNotify(decode(&kind, payload)?),
            "serverAdminNotify" => {
                let p: AdminNotifyPayload = decode(&kind, payload)?;
                ServerMessage::AdminNotify {
                    user_id: p.id,
                    is_admin: matches!(p.change, AdminChange::Add),
                }
            }
            "serverHandsAllowedNotify" => {
                let p: HandsAllowedPayload = decode(&kind, payload)?;
                ServerMessage::HandsAllowed(p.kind != "banned")
            }
            "serverAbsoluteSpeakerNotify" => {
                let p: AbsoluteSpeakerPayload = decode(&kind, payload)?;
                ServerMessage::AbsoluteSpeaker {
                    user_id: p.id,
                    present: matches!(p.change, SpeakerChange::Set),
                }
            }
            "ban" => ServerMessage::Ban,
            "muteRequest" => ServerMessage::MuteRequest(decode(&kind, payload)?),
            "timer" => ServerMessage::Timer(decode(&kind, payload)?),
            _ => ServerMessage::Other(text.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionType {
    #[default]
    NormalSubscription,
    AudioSubscription,
    MixedAudioSubscription,
}

impl SubscriptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NormalSubscription => "normalSubscription",
            Self::AudioSubscription => "audioSubscription",
            Self::MixedAudioSubscription => "mixedAudioSubscription",
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionType {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normalSubscription" => Ok(Self::NormalSubscription),
            "audioSubscription" => Ok(Self::AudioSubscription),
            "mixedAudioSubscription" => Ok(Self::MixedAudioSubscription),
            other => Err(RoomError::InvalidArgument(format!(
                "unknown subscription type {other:?}"
            ))),
        }
    }
}

/// Messages sent to the media server over the main data channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum DataChannelRequest {
    Answer {
        sdp: String,
    },
    Subscribe {
        endpoints: Vec<String>,
        #[serde(rename = "subscriptionType")]
        subscription_type: SubscriptionType,
    },
    SubscriptionType {
        #[serde(rename = "subscriptionType")]
        subscription_type: SubscriptionType,
    },
}

impl DataChannelRequest {
    pub fn encode(&self) -> Result<String, RoomError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages the media server pushes over a data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DataChannelMessage {
    Offer { sdp: String, is_speaker: Option<bool> },
    MetaAdd(Value),
    MetaRemove(Value),
    Other(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferPayload {
    sdp: String,
    #[serde(default)]
    is_speaker: Option<bool>,
}

impl DataChannelMessage {
    pub fn parse(text: &str) -> Result<Self, RoomError> {
        let Envelope { kind, payload } = Envelope::parse(text)?;
        Ok(match kind.as_str() {
            "offer" => {
                let p: OfferPayload = decode(&kind, payload)?;
                DataChannelMessage::Offer {
                    sdp: p.sdp,
                    is_speaker: p.is_speaker,
                }
            }
            "metaAdd" => DataChannelMessage::MetaAdd(payload),
            "metaRemove" => DataChannelMessage::MetaRemove(payload),
            _ => DataChannelMessage::Other(text.to_string()),
        })
    }
}
