//! Node positions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A point in the simulation space. All coordinates are in meters.
///
/// Missing coordinates deserialize as `0.0`, so `{"x": 10}` is a valid position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    /// East-west coordinate.
    pub x: f64,
    /// North-south coordinate.
    pub y: f64,
    /// Altitude.
    pub z: f64,
}

impl Position {
    /// The origin of the simulation space.
    pub const ORIGIN: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    /// Create a new position.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`, in meters.
    pub fn distance_to(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Returns `true` if every coordinate is a finite number.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean_in_three_dimensions() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 12.0);

        assert_eq!(a.distance_to(&b), 13.0);
        assert_eq!(b.distance_to(&a), 13.0);
        assert_eq!(a.distance_to(&a), 0.0);
    }

    #[test]
    fn missing_coordinates_default_to_zero() {
        let pos: Position = serde_json::from_str(r#"{"x": 500}"#).unwrap();
        assert_eq!(pos, Position::new(500.0, 0.0, 0.0));
    }
}
