use serde::{Deserialize, Serialize};

use crate::errors::RoomError;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A participant position in device coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UserPoint {
    pub x: f64,
    pub y: f64,
}

impl From<UserPoint> for Point {
    fn from(p: UserPoint) -> Self {
        Point { x: p.x, y: p.y }
    }
}

/// Axis-aligned rectangle. Corner order does not matter for containment.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub p1: Point,
    pub p2: Point,
}

impl Viewport {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Result<Self, RoomError> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err(RoomError::InvalidArgument(format!(
                "viewport coordinates must be finite: ({x1}, {y1}) ({x2}, {y2})"
            )));
        }
        Ok(Self {
            p1: Point::new(x1, y1),
            p2: Point::new(x2, y2),
        })
    }

    pub fn min_x(&self) -> f64 {
        self.p1.x.min(self.p2.x)
    }

    pub fn max_x(&self) -> f64 {
        self.p1.x.max(self.p2.x)
    }

    pub fn min_y(&self) -> f64 {
        self.p1.y.min(self.p2.y)
    }

    pub fn max_y(&self) -> f64 {
        self.p1.y.max(self.p2.y)
    }

    pub fn is_inside(&self, p: Point) -> bool {
        p.x >= self.min_x() && p.x <= self.max_x() && p.y >= self.min_y() && p.y <= self.max_y()
    }

    /// Containment against the rectangle grown by `border` on every side.
    pub fn is_inside_with_border(&self, p: Point, border: f64) -> Result<bool, RoomError> {
        // NaN fails this comparison too
        if !(border >= 0.0) {
            return Err(RoomError::InvalidArgument(format!(
                "viewport border must be non-negative, got {border}"
            )));
        }
        Ok(p.x >= self.min_x() - border
            && p.x <= self.max_x() + border
            && p.y >= self.min_y() - border
            && p.y <= self.max_y() + border)
    }

    /// The all-zero viewport means "not set yet".
    pub fn is_zero(&self) -> bool {
        self.p1 == Point::default() && self.p2 == Point::default()
    }
}

/// Scaling between room coordinates (server) and device coordinates (screen).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutParams {
    pub room_width_mul: f64,
    pub room_height_mul: f64,
    pub adaptive_bubble_size: f64,
    pub device_pixel_ratio: f64,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            room_width_mul: 1.0,
            room_height_mul: 1.0,
            adaptive_bubble_size: 1.0,
            device_pixel_ratio: 1.0,
        }
    }
}

impl LayoutParams {
    pub fn validate(&self) -> Result<(), RoomError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.room_width_mul) || !positive(self.room_height_mul) {
            return Err(RoomError::InvalidArgument(format!(
                "room multipliers must be positive, got {}x{}",
                self.room_width_mul, self.room_height_mul
            )));
        }
        if !positive(self.device_pixel_ratio) {
            return Err(RoomError::InvalidArgument(format!(
                "device pixel ratio must be positive, got {}",
                self.device_pixel_ratio
            )));
        }
        if !(self.adaptive_bubble_size >= 0.0) {
            return Err(RoomError::InvalidArgument(format!(
                "bubble size must be non-negative, got {}",
                self.adaptive_bubble_size
            )));
        }
        Ok(())
    }

    /// Room coordinates to device pixels.
    pub fn to_device(&self, room_x: f64, room_y: f64) -> UserPoint {
        UserPoint {
            x: room_x * self.room_width_mul * self.device_pixel_ratio,
            y: room_y * self.room_height_mul * self.device_pixel_ratio,
        }
    }

    pub fn to_room(&self, device_x: f64, device_y: f64) -> Point {
        Point {
            x: device_x / (self.room_width_mul * self.device_pixel_ratio),
            y: device_y / (self.room_height_mul * self.device_pixel_ratio),
        }
    }

    /// Half the rendered bubble size in device pixels.
    pub fn bubble_radius(&self, size: f64) -> f64 {
        (size * self.adaptive_bubble_size * self.device_pixel_ratio).max(0.0) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corner_order_does_not_change_containment() {
        let a = Viewport::new(0.0, 0.0, 100.0, 50.0).unwrap();
        let b = Viewport::new(100.0, 50.0, 0.0, 0.0).unwrap();
        let c = Viewport::new(0.0, 50.0, 100.0, 0.0).unwrap();
        for p in [
            Point::new(10.0, 10.0),
            Point::new(100.0, 50.0),
            Point::new(-1.0, 10.0),
            Point::new(50.0, 51.0),
        ] {
            assert_eq!(a.is_inside(p), b.is_inside(p));
            assert_eq!(a.is_inside(p), c.is_inside(p));
        }
    }

    #[test]
    fn border_grows_containment() {
        let v = Viewport::new(0.0, 0.0, 10.0, 10.0).unwrap();
        let outside = Point::new(12.0, 5.0);
        assert!(!v.is_inside(outside));
        assert!(!v.is_inside_with_border(outside, 1.0).unwrap());
        assert!(v.is_inside_with_border(outside, 2.0).unwrap());
        assert!(v.is_inside_with_border(outside, 5.0).unwrap());
    }

    #[test]
    fn inside_stays_inside_with_border() {
        let v = Viewport::new(-5.0, -5.0, 5.0, 5.0).unwrap();
        let p = Point::new(4.0, -4.0);
        assert!(v.is_inside(p));
        assert!(v.is_inside_with_border(p, 0.0).unwrap());
        assert!(v.is_inside_with_border(p, 3.5).unwrap());
    }

    #[test]
    fn negative_or_nan_border_is_rejected() {
        let v = Viewport::new(0.0, 0.0, 1.0, 1.0).unwrap();
        assert!(matches!(
            v.is_inside_with_border(Point::new(0.5, 0.5), -0.1),
            Err(RoomError::InvalidArgument(_))
        ));
        assert!(matches!(
            v.is_inside_with_border(Point::new(0.5, 0.5), f64::NAN),
            Err(RoomError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_viewport_sentinel() {
        assert!(Viewport::default().is_zero());
        assert!(Viewport::new(0.0, 0.0, 0.0, 0.0).unwrap().is_zero());
        assert!(!Viewport::new(0.0, 0.0, 1.0, 0.0).unwrap().is_zero());
    }

    #[test]
    fn non_finite_coordinates_are_rejected() {
        assert!(Viewport::new(f64::INFINITY, 0.0, 1.0, 1.0).is_err());
        assert!(Viewport::new(0.0, f64::NAN, 1.0, 1.0).is_err());
    }

    #[test]
    fn layout_round_trips_between_spaces() {
        let layout = LayoutParams {
            room_width_mul: 2.0,
            room_height_mul: 0.5,
            adaptive_bubble_size: 1.5,
            device_pixel_ratio: 3.0,
        };
        let device = layout.to_device(10.0, 10.0);
        assert_eq!(device, UserPoint { x: 60.0, y: 15.0 });
        assert_eq!(layout.to_room(device.x, device.y), Point::new(10.0, 10.0));
        assert_eq!(layout.bubble_radius(40.0), 90.0);
    }

    #[test]
    fn pixel_ratio_scales_device_space() {
        let retina = LayoutParams {
            device_pixel_ratio: 2.0,
            ..LayoutParams::default()
        };
        assert_eq!(retina.to_device(7.0, 3.0), UserPoint { x: 14.0, y: 6.0 });
        assert_eq!(retina.to_room(14.0, 6.0), Point::new(7.0, 3.0));
        assert_eq!(retina.bubble_radius(10.0), 10.0);
        assert_eq!(LayoutParams::default().bubble_radius(10.0), 5.0);
    }

    #[test]
    fn layout_rejects_zero_multiplier() {
        let layout = LayoutParams {
            room_width_mul: 0.0,
            ..LayoutParams::default()
        };
        assert!(matches!(layout.validate(), Err(RoomError::InvalidArgument(_))));
        assert!(LayoutParams::default().validate().is_ok());
    }
}
