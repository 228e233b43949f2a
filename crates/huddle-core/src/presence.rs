use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mode string of participants who are on stage. Everything else is a listener mode.
pub const STAGE_MODE: &str = "room";
/// Mode the local user starts in before the server says otherwise.
pub const LISTENER_MODE: &str = "popup";

/// A participant as the server describes it. Positions are room coordinates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceRoomUser {
    pub id: String,
    pub name: String,
    pub surname: String,
    pub avatar: String,
    pub size: f64,
    pub is_local: bool,
    pub has_radar: bool,
    pub in_radar: bool,
    pub mode: String,
    pub is_admin: bool,
    pub is_expired: bool,
    pub is_hand_raised: bool,
    pub video: bool,
    pub audio: bool,
    pub phone_call: bool,
    pub is_special_guest: bool,
    pub is_absolute_speaker: bool,
    /// Last microphone level reported for the local user, `0..=32767`.
    pub audio_level: u16,
    pub badges: Vec<String>,
    pub x: f64,
    pub y: f64,
}

impl DeviceRoomUser {
    pub fn is_on_stage(&self) -> bool {
        self.mode == STAGE_MODE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceCurrentUser {
    pub is_admin: bool,
    pub is_hand_raised: bool,
    pub mode: String,
    pub is_absolute_speaker: bool,
}

impl Default for DeviceCurrentUser {
    fn default() -> Self {
        Self {
            is_admin: false,
            is_hand_raised: false,
            mode: LISTENER_MODE.to_string(),
            is_absolute_speaker: false,
        }
    }
}

/// Read-only view of the room handed to the application.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub current: DeviceCurrentUser,
    pub room: Vec<DeviceRoomUser>,
    pub listeners_count: usize,
    pub raised_hands_count: usize,
    pub hands_allowed: bool,
    pub absolute_speaker_present: bool,
}

/// Full roster as carried by the signaling `state` message.
///
/// Server-side counters are accepted but ignored; counts are always folded
/// from the roster itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub current: DeviceCurrentUser,
    pub room: Vec<DeviceRoomUser>,
    pub hands_allowed: bool,
    pub absolute_speaker_present: bool,
    pub raised_hands_count: Option<usize>,
    pub listeners_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceDelta {
    Upsert(DeviceRoomUser),
    Remove(String),
    Replace(RoomSnapshot),
    Current(DeviceCurrentUser),
    Moved { user_id: String, x: f64, y: f64 },
    HandRaised { user_id: String, raised: bool },
    AdminChanged { user_id: String, is_admin: bool },
    HandsAllowed(bool),
    AbsoluteSpeaker { user_id: String, present: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaisedHand {
    pub user_id: String,
    pub raised_at: DateTime<Utc>,
}

/// Ordered participant list plus the local user's own record.
///
/// Owned by the room actor. Every query result is derived from the roster
/// so counts can never drift from the participant list.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    local_id: Option<String>,
    users: Vec<DeviceRoomUser>,
    current: DeviceCurrentUser,
    /// Raise queue, oldest first.
    hands: Vec<RaisedHand>,
    hands_allowed: bool,
    absolute_speaker_present: bool,
    /// Remote participants currently inside the viewport.
    radar: BTreeSet<String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_id(&mut self, id: String) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn users(&self) -> &[DeviceRoomUser] {
        &self.users
    }

    pub fn user(&self, id: &str) -> Option<&DeviceRoomUser> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn current(&self) -> &DeviceCurrentUser {
        &self.current
    }

    pub fn is_local(&self, user: &DeviceRoomUser) -> bool {
        user.is_local || self.local_id.as_deref() == Some(user.id.as_str())
    }

    /// Apply a delta and report whether anything observable changed.
    pub fn apply(&mut self, delta: PresenceDelta) -> bool {
        self.apply_at(delta, Utc::now())
    }

    pub fn apply_at(&mut self, delta: PresenceDelta, now: DateTime<Utc>) -> bool {
        let changed = match delta {
            PresenceDelta::Upsert(user) => self.upsert(user),
            PresenceDelta::Remove(id) => self.remove(&id),
            PresenceDelta::Replace(snapshot) => self.replace(snapshot),
            PresenceDelta::Current(current) => replace_if_changed(&mut self.current, current),
            PresenceDelta::Moved { user_id, x, y } => match self.user_mut(&user_id) {
                Some(u) if u.x != x || u.y != y => {
                    u.x = x;
                    u.y = y;
                    true
                }
                _ => false,
            },
            PresenceDelta::HandRaised { user_id, raised } => {
                let mut changed = match self.user_mut(&user_id) {
                    Some(u) => replace_if_changed(&mut u.is_hand_raised, raised),
                    None => false,
                };
                if self.local_id.as_deref() == Some(user_id.as_str()) {
                    changed |= replace_if_changed(&mut self.current.is_hand_raised, raised);
                }
                changed
            }
            PresenceDelta::AdminChanged { user_id, is_admin } => {
                let mut changed = match self.user_mut(&user_id) {
                    Some(u) => replace_if_changed(&mut u.is_admin, is_admin),
                    None => false,
                };
                if self.local_id.as_deref() == Some(user_id.as_str()) {
                    changed |= replace_if_changed(&mut self.current.is_admin, is_admin);
                }
                changed
            }
            PresenceDelta::HandsAllowed(allowed) => {
                replace_if_changed(&mut self.hands_allowed, allowed)
            }
            PresenceDelta::AbsoluteSpeaker { user_id, present } => {
                let mut changed = replace_if_changed(&mut self.absolute_speaker_present, present);
                if let Some(u) = self.user_mut(&user_id) {
                    changed |= replace_if_changed(&mut u.is_absolute_speaker, present);
                }
                if self.local_id.as_deref() == Some(user_id.as_str()) {
                    changed |= replace_if_changed(&mut self.current.is_absolute_speaker, present);
                }
                changed
            }
        };
        self.sync_hands(now);
        changed
    }

    fn user_mut(&mut self, id: &str) -> Option<&mut DeviceRoomUser> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    fn upsert(&mut self, mut user: DeviceRoomUser) -> bool {
        if user.is_expired {
            return self.remove(&user.id);
        }
        if self.local_id.is_none() && user.is_local {
            self.local_id = Some(user.id.clone());
        }
        user.in_radar = self.radar.contains(&user.id);
        match self.user_mut(&user.id) {
            Some(existing) => replace_if_changed(existing, user),
            None => {
                self.users.push(user);
                true
            }
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.id != id);
        before != self.users.len()
    }

    fn replace(&mut self, snapshot: RoomSnapshot) -> bool {
        let users: Vec<DeviceRoomUser> = snapshot
            .room
            .into_iter()
            .filter(|u| !u.is_expired)
            .map(|mut u| {
                u.in_radar = self.radar.contains(&u.id);
                u
            })
            .collect();
        if self.local_id.is_none() {
            self.local_id = users.iter().find(|u| u.is_local).map(|u| u.id.clone());
        }
        let mut changed = replace_if_changed(&mut self.users, users);
        changed |= replace_if_changed(&mut self.current, snapshot.current);
        changed |= replace_if_changed(&mut self.hands_allowed, snapshot.hands_allowed);
        changed |= replace_if_changed(
            &mut self.absolute_speaker_present,
            snapshot.absolute_speaker_present,
        );
        changed
    }

    /// Keep the raise queue in step with the per-user flags. New raises are
    /// stamped with `now`, existing ones keep their original position.
    fn sync_hands(&mut self, now: DateTime<Utc>) {
        let raised: Vec<&str> = self
            .users
            .iter()
            .filter(|u| u.is_hand_raised)
            .map(|u| u.id.as_str())
            .collect();
        self.hands.retain(|h| raised.contains(&h.user_id.as_str()));
        for id in raised {
            if !self.hands.iter().any(|h| h.user_id == id) {
                self.hands.push(RaisedHand {
                    user_id: id.to_string(),
                    raised_at: now,
                });
            }
        }
        self.hands.sort_by_key(|h| h.raised_at);
    }

    /// Mark exactly the participants in `visible` as in radar.
    pub fn set_radar(&mut self, visible: &BTreeSet<String>) -> bool {
        self.radar.clone_from(visible);
        let mut changed = false;
        for user in &mut self.users {
            changed |= replace_if_changed(&mut user.in_radar, visible.contains(&user.id));
        }
        changed
    }

    pub fn hands(&self) -> &[RaisedHand] {
        &self.hands
    }

    pub fn hand_ids(&self) -> Vec<String> {
        self.hands.iter().map(|h| h.user_id.clone()).collect()
    }

    pub fn admin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .users
            .iter()
            .filter(|u| u.is_admin)
            .map(|u| u.id.clone())
            .collect();
        if self.current.is_admin {
            if let Some(local) = &self.local_id {
                if !ids.contains(local) {
                    ids.push(local.clone());
                }
            }
        }
        ids
    }

    pub fn listeners_count(&self) -> usize {
        self.users
            .iter()
            .filter(|u| !self.is_local(u) && !u.is_admin && !u.is_on_stage())
            .count()
    }

    pub fn snapshot(&self) -> DeviceState {
        DeviceState {
            current: self.current.clone(),
            room: self.users.clone(),
            listeners_count: self.listeners_count(),
            raised_hands_count: self.hands.len(),
            hands_allowed: self.hands_allowed,
            absolute_speaker_present: self.absolute_speaker_present
                || self.users.iter().any(|u| u.is_absolute_speaker),
        }
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(id: &str, mode: &str) -> DeviceRoomUser {
        DeviceRoomUser {
            id: id.to_string(),
            name: format!("name-{id}"),
            mode: mode.to_string(),
            size: 40.0,
            ..DeviceRoomUser::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut roster = Roster::new();
        assert!(roster.apply(PresenceDelta::Upsert(user("a", "popup"))));
        let once = roster.snapshot();
        assert!(!roster.apply(PresenceDelta::Upsert(user("a", "popup"))));
        assert_eq!(roster.snapshot(), once);
        assert_eq!(roster.users().len(), 1);
    }

    #[test]
    fn upsert_updates_in_place() {
        let mut roster = Roster::new();
        roster.apply(PresenceDelta::Upsert(user("a", "popup")));
        roster.apply(PresenceDelta::Upsert(user("b", "popup")));
        roster.apply(PresenceDelta::Upsert(user("a", STAGE_MODE)));
        let ids: Vec<&str> = roster.users().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(roster.user("a").unwrap().is_on_stage());
    }

    #[test]
    fn removing_absent_participant_is_noop() {
        let mut roster = Roster::new();
        roster.apply(PresenceDelta::Upsert(user("a", "popup")));
        let before = roster.snapshot();
        assert!(!roster.apply(PresenceDelta::Remove("ghost".into())));
        assert_eq!(roster.snapshot(), before);
    }

    #[test]
    fn expired_participants_are_dropped() {
        let mut roster = Roster::new();
        roster.apply(PresenceDelta::Upsert(user("a", "popup")));
        let mut expired = user("a", "popup");
        expired.is_expired = true;
        assert!(roster.apply(PresenceDelta::Upsert(expired)));
        assert!(roster.user("a").is_none());
    }

    #[test]
    fn listener_count_folds_over_roster() {
        let mut roster = Roster::new();
        let mut me = user("me", "popup");
        me.is_local = true;
        let mut admin = user("admin", "popup");
        admin.is_admin = true;
        roster.apply(PresenceDelta::Replace(RoomSnapshot {
            room: vec![me, admin, user("s", STAGE_MODE), user("l1", "popup"), user("l2", "popup")],
            listeners_count: Some(99),
            ..RoomSnapshot::default()
        }));
        assert_eq!(roster.local_id(), Some("me"));
        assert_eq!(roster.snapshot().listeners_count, 2);

        roster.apply(PresenceDelta::Remove("l1".into()));
        assert_eq!(roster.snapshot().listeners_count, 1);
        roster.apply(PresenceDelta::Upsert(user("l2", STAGE_MODE)));
        assert_eq!(roster.snapshot().listeners_count, 0);
    }

    #[test]
    fn hand_queue_keeps_first_raise_order() {
        let mut roster = Roster::new();
        for id in ["a", "b", "c"] {
            roster.apply(PresenceDelta::Upsert(user(id, "popup")));
        }
        let raise = |id: &str, raised| PresenceDelta::HandRaised {
            user_id: id.to_string(),
            raised,
        };
        roster.apply_at(raise("c", true), at(1));
        roster.apply_at(raise("a", true), at(2));
        // re-raising does not move the entry to the back
        roster.apply_at(raise("c", true), at(3));
        assert_eq!(roster.hand_ids(), ["c", "a"]);
        assert_eq!(roster.snapshot().raised_hands_count, 2);

        roster.apply_at(raise("c", false), at(4));
        roster.apply_at(raise("b", true), at(5));
        assert_eq!(roster.hand_ids(), ["a", "b"]);

        roster.apply_at(PresenceDelta::Remove("a".into()), at(6));
        assert_eq!(roster.hand_ids(), ["b"]);
    }

    #[test]
    fn hand_raise_for_unknown_user_is_ignored() {
        let mut roster = Roster::new();
        assert!(!roster.apply(PresenceDelta::HandRaised {
            user_id: "ghost".into(),
            raised: true,
        }));
        assert!(roster.hands().is_empty());
    }

    #[test]
    fn local_admin_flag_counts_as_admin() {
        let mut roster = Roster::new();
        roster.set_local_id("me".into());
        roster.apply(PresenceDelta::Current(DeviceCurrentUser {
            is_admin: true,
            ..DeviceCurrentUser::default()
        }));
        assert_eq!(roster.admin_ids(), ["me"]);
        roster.apply(PresenceDelta::AdminChanged {
            user_id: "me".into(),
            is_admin: false,
        });
        assert!(roster.admin_ids().is_empty());
    }

    #[test]
    fn moved_updates_position() {
        let mut roster = Roster::new();
        roster.apply(PresenceDelta::Upsert(user("a", "popup")));
        assert!(roster.apply(PresenceDelta::Moved {
            user_id: "a".into(),
            x: 3.0,
            y: 4.0,
        }));
        let a = roster.user("a").unwrap();
        assert_eq!((a.x, a.y), (3.0, 4.0));
    }

    #[test]
    fn radar_membership_survives_updates() {
        let mut roster = Roster::new();
        roster.apply(PresenceDelta::Upsert(user("a", "popup")));
        roster.apply(PresenceDelta::Upsert(user("b", "popup")));

        let visible: BTreeSet<String> = ["b".to_string()].into();
        assert!(roster.set_radar(&visible));
        assert!(!roster.set_radar(&visible));
        assert!(!roster.user("a").unwrap().in_radar);
        assert!(roster.user("b").unwrap().in_radar);

        // a server update does not know about the radar
        assert!(!roster.apply(PresenceDelta::Upsert(user("b", "popup"))));
        assert!(roster.user("b").unwrap().in_radar);
        roster.apply(PresenceDelta::Replace(RoomSnapshot {
            room: vec![user("a", "popup"), user("b", STAGE_MODE)],
            ..RoomSnapshot::default()
        }));
        let flags: Vec<bool> = roster.snapshot().room.iter().map(|u| u.in_radar).collect();
        assert_eq!(flags, [false, true]);

        assert!(roster.set_radar(&BTreeSet::new()));
        assert!(roster.users().iter().all(|u| !u.in_radar));
    }

    #[test]
    fn absolute_speaker_set_and_clear() {
        let mut roster = Roster::new();
        roster.set_local_id("me".into());
        roster.apply(PresenceDelta::Upsert(user("me", STAGE_MODE)));
        roster.apply(PresenceDelta::Upsert(user("s", STAGE_MODE)));

        assert!(roster.apply(PresenceDelta::AbsoluteSpeaker {
            user_id: "s".into(),
            present: true,
        }));
        let state = roster.snapshot();
        assert!(state.absolute_speaker_present);
        assert!(state.room[1].is_absolute_speaker);
        assert!(!state.current.is_absolute_speaker);

        roster.apply(PresenceDelta::AbsoluteSpeaker {
            user_id: "s".into(),
            present: false,
        });
        assert!(!roster.snapshot().absolute_speaker_present);

        roster.apply(PresenceDelta::AbsoluteSpeaker {
            user_id: "me".into(),
            present: true,
        });
        let state = roster.snapshot();
        assert!(state.current.is_absolute_speaker);
        assert!(state.absolute_speaker_present);
    }

    #[test]
    fn snapshot_deserializes_from_state_payload() {
        let json = r#"{
            "current": {"isAdmin": false, "mode": "room", "isHandRaised": false, "isAbsoluteSpeaker": false},
            "raisedHandsCount": 0,
            "handsAllowed": true,
            "absoluteSpeakerPresent": false,
            "room": [{"id": "u1", "name": "Ada", "isLocal": true, "mode": "room", "badges": ["host"]}]
        }"#;
        let snapshot: RoomSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.current.mode, STAGE_MODE);
        assert!(snapshot.hands_allowed);
        assert_eq!(snapshot.room[0].badges, ["host"]);
        assert!(snapshot.room[0].is_local);
    }
}
