use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::RoomError;
use crate::presence::{DeviceState, Roster};

#[derive(Debug, Default)]
struct Published {
    local_user_id: Option<String>,
    admins: Vec<String>,
    hands: Vec<String>,
    state: DeviceState,
}

/// Admin and raised-hand sets shared by live and recorded rooms.
///
/// Written only by the room actor through [`BaseRoom::publish`]; read from
/// any thread. Admins, hands and the device state come from the same roster
/// and are swapped in under one write lock.
#[derive(Clone, Default)]
pub struct BaseRoom {
    inner: Arc<RwLock<Published>>,
}

impl BaseRoom {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Published> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Published> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publish(&self, roster: &Roster) {
        let admins = roster.admin_ids();
        let hands = roster.hand_ids();
        let state = roster.snapshot();
        let local_user_id = roster.local_id().map(str::to_string);

        let mut inner = self.write();
        inner.local_user_id = local_user_id;
        inner.admins = admins;
        inner.hands = hands;
        inner.state = state;
    }

    /// Admin ids as a JSON array.
    pub fn admins(&self) -> Result<Vec<u8>, RoomError> {
        Ok(serde_json::to_vec(&self.read().admins)?)
    }

    /// Raised-hand ids as a JSON array, oldest raise first.
    pub fn hands(&self) -> Result<Vec<u8>, RoomError> {
        Ok(serde_json::to_vec(&self.read().hands)?)
    }

    pub fn admin_ids(&self) -> Vec<String> {
        self.read().admins.clone()
    }

    pub fn hand_ids(&self) -> Vec<String> {
        self.read().hands.clone()
    }

    pub fn local_user_id(&self) -> Option<String> {
        self.read().local_user_id.clone()
    }

    pub fn is_there_other_admin(&self) -> bool {
        let inner = self.read();
        let local = inner.local_user_id.as_deref();
        inner.admins.iter().any(|id| Some(id.as_str()) != local)
    }

    pub fn device_state(&self) -> DeviceState {
        self.read().state.clone()
    }
}
