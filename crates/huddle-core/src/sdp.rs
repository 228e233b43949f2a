//! Lightweight SDP checks for offers coming from the media server.
//!
//! The engine does the real parsing; this only rejects payloads that are not
//! SDP at all before a peer connection gets registered, and rewrites the
//! bandwidth lines of the engine's answer.

use crate::errors::RoomError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Application,
}

impl MediaKind {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "application" => Some(Self::Application),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub mid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfferSummary {
    pub session_name: String,
    pub media: Vec<MediaSection>,
}

impl OfferSummary {
    pub fn has_data_channel(&self) -> bool {
        self.media.iter().any(|m| m.kind == MediaKind::Application)
    }
}

fn split_line(line: &str) -> Result<(char, &str), RoomError> {
    let (kind, value) = line
        .split_once('=')
        .ok_or_else(|| RoomError::Signaling(format!("malformed sdp line: {line:?}")))?;
    let mut chars = kind.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok((c, value)),
        _ => Err(RoomError::Signaling(format!("malformed sdp line: {line:?}"))),
    }
}

/// Check that `sdp` is a structurally valid offer.
pub fn validate_offer(sdp: &str) -> Result<OfferSummary, RoomError> {
    let mut lines = sdp.lines().filter(|l| !l.trim().is_empty());

    match lines.next().map(split_line).transpose()? {
        Some(('v', "0")) => {}
        Some(('v', other)) => {
            return Err(RoomError::Signaling(format!("unsupported sdp version {other}")));
        }
        _ => return Err(RoomError::Signaling("sdp must start with v=0".into())),
    }

    let mut has_origin = false;
    let mut session_name = None;
    let mut media: Vec<MediaSection> = Vec::new();

    for line in lines {
        let (kind, value) = split_line(line)?;
        match kind {
            'o' if media.is_empty() => has_origin = true,
            's' if media.is_empty() => session_name = Some(value.to_string()),
            'm' => {
                let token = value.split_whitespace().next().unwrap_or_default();
                let kind = MediaKind::parse(token).ok_or_else(|| {
                    RoomError::Signaling(format!("unsupported media type {token:?}"))
                })?;
                media.push(MediaSection { kind, mid: None });
            }
            'a' => {
                if let (Some(mid), Some(section)) = (value.strip_prefix("mid:"), media.last_mut()) {
                    section.mid = Some(mid.to_string());
                }
            }
            _ => {}
        }
    }

    if !has_origin {
        return Err(RoomError::Signaling("sdp has no origin line".into()));
    }
    let session_name =
        session_name.ok_or_else(|| RoomError::Signaling("sdp has no session name".into()))?;
    if media.is_empty() {
        return Err(RoomError::Signaling("sdp has no media sections".into()));
    }
    Ok(OfferSummary {
        session_name,
        media,
    })
}

/// Cap audio and video sections with `b=AS` lines. A limit of 0 leaves the
/// section unlimited and strips any existing cap.
pub fn apply_bandwidth(sdp: &str, video_kbps: u32, audio_kbps: u32) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut pending: Option<u32> = None;
    let mut in_limited_section = false;

    for line in sdp.lines().filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("m=") {
            if let Some(limit) = pending.take() {
                out.push(format!("b=AS:{limit}"));
            }
            let limit = match MediaKind::parse(rest.split_whitespace().next().unwrap_or_default()) {
                Some(MediaKind::Video) => Some(video_kbps),
                Some(MediaKind::Audio) => Some(audio_kbps),
                _ => None,
            };
            in_limited_section = limit.is_some();
            pending = limit.filter(|kbps| *kbps > 0);
            out.push(line.to_string());
            continue;
        }
        if in_limited_section {
            if line.starts_with("b=") {
                continue;
            }
            // b= belongs after the i= and c= lines of a media section
            if !line.starts_with("i=") && !line.starts_with("c=") {
                if let Some(limit) = pending.take() {
                    out.push(format!("b=AS:{limit}"));
                }
            }
        }
        out.push(line.to_string());
    }
    if let Some(limit) = pending {
        out.push(format!("b=AS:{limit}"));
    }

    let mut sdp = out.join("\r\n");
    sdp.push_str("\r\n");
    sdp
}
