//! Grid geometry: integer positions, distance metrics and weather.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Integer cell position. Ordering is x, then y, then z; every position-keyed
/// iteration in the kernel relies on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Vec3i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Vec3i {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn from_array(raw: [i32; 3]) -> Self {
        Self::new(raw[0], raw[1], raw[2])
    }

    /// Same cell projected onto the single world layer.
    pub fn flat(raw: [i32; 3]) -> Self {
        Self::new(raw[0], 0, raw[2])
    }

    pub fn to_array(self) -> [i32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y, self.z + dz)
    }

    /// Parses `x,y,z`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(',').map(|part| part.trim().parse::<i32>());
        let x = parts.next()?.ok()?;
        let y = parts.next()?.ok()?;
        let z = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(x, y, z))
    }
}

impl std::fmt::Display for Vec3i {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

pub fn manhattan(a: Vec3i, b: Vec3i) -> i32 {
    (a.x - b.x).abs() + (a.y - b.y).abs() + (a.z - b.z).abs()
}

/// Manhattan distance on the ground plane.
pub fn dist_xz(a: Vec3i, b: Vec3i) -> i32 {
    (a.x - b.x).abs() + (a.z - b.z).abs()
}

pub fn chebyshev_xz(a: Vec3i, b: Vec3i) -> i32 {
    (a.x - b.x).abs().max((a.z - b.z).abs())
}

pub const CARDINALS: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Maps a yaw in degrees to the nearest cardinal direction (0 = +z, 90 = -x).
pub fn yaw_to_dir(yaw: i32) -> (i32, i32) {
    match ((yaw % 360 + 360) % 360 + 45) / 90 % 4 {
        0 => (0, 1),
        1 => (-1, 0),
        2 => (0, -1),
        _ => (1, 0),
    }
}

/// Id of a block-backed object: `TYPE@x,y,z`.
pub fn positional_id(kind: &str, pos: Vec3i) -> String {
    format!("{kind}@{pos}")
}

/// Inverse of [`positional_id`].
pub fn parse_positional_id(raw: &str) -> Option<(&str, Vec3i)> {
    let (kind, rest) = raw.split_once('@')?;
    if kind.is_empty() {
        return None;
    }
    Some((kind, Vec3i::parse(rest)?))
}

// ---------------------------------------------------------------------------
// Weather
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Weather {
    #[default]
    Clear,
    Storm,
    Cold,
}

impl Weather {
    pub const ALL: [Weather; 3] = [Weather::Clear, Weather::Storm, Weather::Cold];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clear => "CLEAR",
            Self::Storm => "STORM",
            Self::Cold => "COLD",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_order_x_then_y_then_z() {
        let mut cells = vec![
            Vec3i::new(1, 0, -5),
            Vec3i::new(0, 0, 9),
            Vec3i::new(0, 0, -1),
            Vec3i::new(1, 0, -6),
        ];
        cells.sort();
        assert_eq!(
            cells,
            vec![
                Vec3i::new(0, 0, -1),
                Vec3i::new(0, 0, 9),
                Vec3i::new(1, 0, -6),
                Vec3i::new(1, 0, -5),
            ]
        );
    }

    #[test]
    fn positional_ids_round_trip() {
        let id = positional_id("CHEST", Vec3i::new(-3, 0, 12));
        assert_eq!(id, "CHEST@-3,0,12");
        assert_eq!(
            parse_positional_id(&id),
            Some(("CHEST", Vec3i::new(-3, 0, 12)))
        );
        assert_eq!(parse_positional_id("CHEST@1,2"), None);
        assert_eq!(parse_positional_id("@1,2,3"), None);
        assert_eq!(parse_positional_id("NEWS"), None);
    }

    #[test]
    fn distance_metrics_agree_on_axis_moves() {
        let a = Vec3i::new(0, 0, 0);
        let b = Vec3i::new(3, 0, -4);
        assert_eq!(dist_xz(a, b), 7);
        assert_eq!(manhattan(a, b), 7);
        assert_eq!(chebyshev_xz(a, b), 4);
    }

    #[test]
    fn yaw_snaps_to_cardinals() {
        assert_eq!(yaw_to_dir(0), (0, 1));
        assert_eq!(yaw_to_dir(90), (-1, 0));
        assert_eq!(yaw_to_dir(180), (0, -1));
        assert_eq!(yaw_to_dir(270), (1, 0));
        assert_eq!(yaw_to_dir(-90), (1, 0));
        assert_eq!(yaw_to_dir(44), (0, 1));
    }
}
