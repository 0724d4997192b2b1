use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A three-component extent or coordinate. Unused dimensions are 1 for
/// extents and 0 for coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const ORIGIN: Dim3 = Dim3 { x: 0, y: 0, z: 0 };
    pub const ONE: Dim3 = Dim3 { x: 1, y: 1, z: 1 };

    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Build an extent from a dimension count and an optional per-dimension
    /// array. Dimensions at or past `dimension`, or missing from `extent`,
    /// default to 1.
    pub fn from_extent(dimension: usize, extent: Option<&[u32]>) -> Self {
        let mut m = [1u32; 3];
        if let Some(extent) = extent {
            for (i, slot) in m.iter_mut().enumerate().take(dimension.min(3)) {
                if let Some(&v) = extent.get(i) {
                    *slot = v;
                }
            }
        }
        Self::new(m[0], m[1], m[2])
    }

    /// Product of all three components.
    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Decode a linear index into a coordinate within this extent
    /// (x fastest, z slowest).
    pub fn decode(&self, index: u64) -> Dim3 {
        let gx = self.x.max(1) as u64;
        let gy = self.y.max(1) as u64;
        Dim3 {
            x: (index % gx) as u32,
            y: ((index / gx) % gy) as u32,
            z: (index / (gx * gy)) as u32,
        }
    }

    /// Inverse of [`Dim3::decode`].
    pub fn linearize(&self, point: Dim3) -> u64 {
        point.x as u64 + point.y as u64 * self.x as u64 + point.z as u64 * self.x as u64 * self.y as u64
    }

    /// True when every component of `point` lies inside this extent.
    pub fn contains(&self, point: Dim3) -> bool {
        point.x < self.x && point.y < self.y && point.z < self.z
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::ONE
    }
}

impl From<[u32; 3]> for Dim3 {
    fn from(m: [u32; 3]) -> Self {
        Self::new(m[0], m[1], m[2])
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Parses `X`, `X,Y` or `X,Y,Z` (also accepts `x` as separator).
impl FromStr for Dim3 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s
            .split(|c| c == ',' || c == 'x')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(format!("expected 1 to 3 extents, got '{s}'"));
        }
        let mut values = Vec::with_capacity(parts.len());
        for p in &parts {
            let v = p
                .parse::<u32>()
                .map_err(|e| format!("invalid extent '{p}': {e}"))?;
            values.push(v);
        }
        Ok(Self::from_extent(values.len(), Some(values.as_slice())))
    }
}
