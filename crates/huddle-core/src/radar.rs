use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::geometry::{LayoutParams, Point, Viewport};
use crate::presence::Roster;

/// Participants that entered or left the viewport since the last computation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VisibilityChange {
    pub shown: Vec<String>,
    pub hidden: Vec<String>,
}

impl VisibilityChange {
    pub fn is_empty(&self) -> bool {
        self.shown.is_empty() && self.hidden.is_empty()
    }
}

/// Tracks which remote participants are currently inside the viewport.
#[derive(Debug, Clone, Default)]
pub struct Radar {
    visible: BTreeSet<String>,
}

impl Radar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visible(&self) -> &BTreeSet<String> {
        &self.visible
    }

    /// Recompute visibility. A participant is visible when its bubble overlaps
    /// the viewport, i.e. its center lies within the viewport grown by the
    /// bubble radius. An unset (zero) viewport leaves the current set untouched.
    pub fn update(
        &mut self,
        roster: &Roster,
        viewport: &Viewport,
        layout: &LayoutParams,
    ) -> VisibilityChange {
        if viewport.is_zero() {
            return VisibilityChange::default();
        }
        let now: BTreeSet<String> = roster
            .users()
            .iter()
            .filter(|u| !roster.is_local(u))
            .filter(|u| {
                let pos = layout.to_device(u.x, u.y);
                viewport
                    .is_inside_with_border(Point::from(pos), layout.bubble_radius(u.size))
                    .unwrap_or(false)
            })
            .map(|u| u.id.clone())
            .collect();

        let change = VisibilityChange {
            shown: now.difference(&self.visible).cloned().collect(),
            hidden: self.visible.difference(&now).cloned().collect(),
        };
        self.visible = now;
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{DeviceRoomUser, PresenceDelta};

    fn placed(id: &str, x: f64, y: f64) -> PresenceDelta {
        PresenceDelta::Upsert(DeviceRoomUser {
            id: id.to_string(),
            x,
            y,
            size: 10.0,
            ..DeviceRoomUser::default()
        })
    }

    #[test]
    fn viewport_flip_reports_shown_then_hidden() {
        let mut roster = Roster::new();
        roster.apply(placed("b", 50.0, 50.0));
        let layout = LayoutParams::default();
        let mut radar = Radar::new();

        let near = Viewport::new(0.0, 0.0, 100.0, 100.0).unwrap();
        let far = Viewport::new(500.0, 500.0, 600.0, 600.0).unwrap();

        let first = radar.update(&roster, &near, &layout);
        assert_eq!(first.shown, ["b"]);
        assert!(first.hidden.is_empty());

        let second = radar.update(&roster, &far, &layout);
        assert!(second.shown.is_empty());
        assert_eq!(second.hidden, ["b"]);
    }

    #[test]
    fn bubble_edge_counts_as_visible() {
        let mut roster = Roster::new();
        // center 4 units outside, radius 5
        roster.apply(placed("edge", 104.0, 50.0));
        let mut radar = Radar::new();
        let change = radar.update(
            &roster,
            &Viewport::new(0.0, 0.0, 100.0, 100.0).unwrap(),
            &LayoutParams::default(),
        );
        assert_eq!(change.shown, ["edge"]);
    }

    #[test]
    fn local_user_is_never_reported() {
        let mut roster = Roster::new();
        roster.set_local_id("me".into());
        roster.apply(placed("me", 10.0, 10.0));
        let mut radar = Radar::new();
        let change = radar.update(
            &roster,
            &Viewport::new(0.0, 0.0, 100.0, 100.0).unwrap(),
            &LayoutParams::default(),
        );
        assert!(change.is_empty());
    }

    #[test]
    fn zero_viewport_keeps_current_set() {
        let mut roster = Roster::new();
        roster.apply(placed("b", 5.0, 5.0));
        let layout = LayoutParams::default();
        let mut radar = Radar::new();
        radar.update(&roster, &Viewport::new(0.0, 0.0, 10.0, 10.0).unwrap(), &layout);
        assert!(radar.update(&roster, &Viewport::default(), &layout).is_empty());
        assert!(radar.visible().contains("b"));
    }

    #[test]
    fn departed_user_is_hidden() {
        let mut roster = Roster::new();
        roster.apply(placed("b", 5.0, 5.0));
        let layout = LayoutParams::default();
        let viewport = Viewport::new(0.0, 0.0, 10.0, 10.0).unwrap();
        let mut radar = Radar::new();
        radar.update(&roster, &viewport, &layout);
        roster.apply(PresenceDelta::Remove("b".into()));
        assert_eq!(radar.update(&roster, &viewport, &layout).hidden, ["b"]);
    }
}
