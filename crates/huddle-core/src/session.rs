use std::collections::HashMap;

use crate::base_room::BaseRoom;
use crate::events::{EventEmitter, RoomEvent};
use crate::geometry::{LayoutParams, Viewport};
use crate::presence::{DeviceCurrentUser, DeviceRoomUser, PresenceDelta, Roster};
use crate::protocol::{HandNotifyKind, Reaction, ServerMessage};
use crate::radar::{Radar, VisibilityChange};

/// Presence state shared by live and recorded rooms: roster, radar and the
/// published [`BaseRoom`]. Owned by the room task.
pub(crate) struct PresenceSession {
    roster: Roster,
    radar: Radar,
    base: BaseRoom,
    emitter: EventEmitter,
    layout: LayoutParams,
    viewport: Viewport,
    reactions: HashMap<String, Reaction>,
}

impl PresenceSession {
    pub(crate) fn new(base: BaseRoom, emitter: EventEmitter, layout: LayoutParams) -> Self {
        Self {
            roster: Roster::new(),
            radar: Radar::new(),
            base,
            emitter,
            layout,
            viewport: Viewport::default(),
            reactions: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn roster(&self) -> &Roster {
        &self.roster
    }

    pub(crate) fn layout(&self) -> &LayoutParams {
        &self.layout
    }

    pub(crate) fn emit(&self, event: RoomEvent) {
        self.emitter.emit(event);
    }

    pub(crate) fn set_local_id(&mut self, id: String) {
        self.roster.set_local_id(id);
        self.base.publish(&self.roster);
    }

    /// Apply a delta; on change publish the new snapshot and report it.
    pub(crate) fn apply(&mut self, delta: PresenceDelta) -> bool {
        if !self.roster.apply(delta) {
            return false;
        }
        self.publish();
        true
    }

    fn publish(&self) {
        self.base.publish(&self.roster);
        self.emitter
            .emit(RoomEvent::NativeState(self.base.device_state()));
    }

    /// Update the local user's roster entry in place.
    pub(crate) fn update_local(&mut self, f: impl FnOnce(&mut DeviceRoomUser)) -> bool {
        let Some(local_id) = self.roster.local_id() else {
            return false;
        };
        let Some(mut me) = self.roster.user(local_id).cloned() else {
            return false;
        };
        f(&mut me);
        self.apply(PresenceDelta::Upsert(me))
    }

    pub(crate) fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    /// Recompute which participants are in view and report the difference.
    pub(crate) fn refresh_visibility(&mut self) -> VisibilityChange {
        let change = self.radar.update(&self.roster, &self.viewport, &self.layout);
        if !change.is_empty() {
            tracing::debug!(
                "visibility changed: +{} -{}",
                change.shown.len(),
                change.hidden.len()
            );
            self.emitter
                .emit(RoomEvent::ParticipantsVisibilityChanged(change.clone()));
            if self.roster.set_radar(self.radar.visible()) {
                self.publish();
            }
        }
        change
    }

    pub(crate) fn visible_ids(&self) -> Vec<String> {
        self.radar.visible().iter().cloned().collect()
    }

    /// Forget a reaction. Unknown ids are ignored.
    pub(crate) fn remove_reaction(&mut self, id: &str) -> bool {
        self.reactions.remove(id).is_some()
    }

    /// Route one server message. Returns whether the roster changed.
    pub(crate) fn handle(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::Registered { user_id, mode } => {
                tracing::debug!("registered again as {user_id}");
                self.set_local_id(user_id);
                match mode {
                    Some(mode) => self.set_mode(mode),
                    None => false,
                }
            }
            ServerMessage::Error { reason } => {
                tracing::warn!("server error: {reason}");
                self.emit(RoomEvent::Error(reason));
                false
            }
            ServerMessage::State(snapshot) => self.apply(PresenceDelta::Replace(*snapshot)),
            ServerMessage::UserUpdate(user) => self.apply(PresenceDelta::Upsert(*user)),
            ServerMessage::UserLeave { user_id } => {
                self.reactions.remove(&user_id);
                self.apply(PresenceDelta::Remove(user_id))
            }
            ServerMessage::Path(path) => {
                let changed = self.apply(PresenceDelta::Moved {
                    user_id: path.user_id.clone(),
                    x: path.x,
                    y: path.y,
                });
                let device = self.layout.to_device(path.x, path.y);
                self.emit(RoomEvent::Path {
                    user_id: path.user_id,
                    x: device.x,
                    y: device.y,
                    duration: path.duration,
                });
                changed
            }
            ServerMessage::Reactions(reactions) => {
                for reaction in reactions {
                    self.reactions
                        .insert(reaction.from_id.clone(), reaction.clone());
                    self.emit(RoomEvent::Reaction(reaction));
                }
                false
            }
            ServerMessage::PopupUsers(users) => {
                self.emit(RoomEvent::PopupUsers(users));
                false
            }
            ServerMessage::ChangeRoomMode {
                mode,
                is_first_connection,
            } => {
                let changed = self.set_mode(mode.clone());
                self.emit(RoomEvent::RoomModeChanged {
                    mode,
                    is_first_connection,
                });
                changed
            }
            ServerMessage::RadarVolume(volume) => {
                self.emit(RoomEvent::RadarVolume(volume));
                false
            }
            ServerMessage::ConnectionState(state) => {
                self.emit(RoomEvent::ConnectionState(state));
                false
            }
            ServerMessage::HandNotify(notify) => {
                let changed = match notify.kind {
                    HandNotifyKind::Request => self.apply(PresenceDelta::HandRaised {
                        user_id: notify.id.clone(),
                        raised: true,
                    }),
                    HandNotifyKind::Invite | HandNotifyKind::DeclineInvite => false,
                };
                self.emit(RoomEvent::HandNotify(notify));
                changed
            }
            ServerMessage::AdminNotify { user_id, is_admin } => {
                self.apply(PresenceDelta::AdminChanged { user_id, is_admin })
            }
            ServerMessage::HandsAllowed(allowed) => self.apply(PresenceDelta::HandsAllowed(allowed)),
            ServerMessage::AbsoluteSpeaker { user_id, present } => {
                self.apply(PresenceDelta::AbsoluteSpeaker { user_id, present })
            }
            ServerMessage::Ban => {
                tracing::warn!("banned from the room");
                self.emit(RoomEvent::Banned);
                false
            }
            ServerMessage::MuteRequest(request) => {
                tracing::info!("{:?} muted by {} {}", request.kind, request.from_name, request.from_surname);
                self.emit(RoomEvent::MuteRequested(request));
                false
            }
            ServerMessage::Timer(timer) => {
                self.emit(RoomEvent::Timer(timer));
                false
            }
            ServerMessage::Other(raw) => {
                self.emit(RoomEvent::Message(raw));
                false
            }
        }
    }

    fn set_mode(&mut self, mode: String) -> bool {
        let current = DeviceCurrentUser {
            mode,
            ..self.roster.current().clone()
        };
        self.apply(PresenceDelta::Current(current))
    }
}
