//! A simple 1, 2, or 3 dimensional launch extent.

use num_traits::ToPrimitive;
use std::fmt::Debug;

use super::{to_u32, WorkDims};

/// Specifies a 1-, 2-, or 3-dimensional grid or group extent.
///
/// Almost anything scalar-ish converts into one: integers, tuples and
/// arrays of integers. Unspecified trailing dimensions count as `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialDims {
    One(u32),
    Two(u32, u32),
    Three(u32, u32, u32),
}

impl SpatialDims {
    /// A unit extent, the default group shape.
    pub fn unit() -> SpatialDims {
        SpatialDims::One(1)
    }

    /// Per-axis extents padded with `1`.
    pub fn extent(&self) -> [u32; 3] {
        match *self {
            SpatialDims::One(x) => [x, 1, 1],
            SpatialDims::Two(x, y) => [x, y, 1],
            SpatialDims::Three(x, y, z) => [x, y, z],
        }
    }

    /// Total element count.
    pub fn product(&self) -> u64 {
        let [x, y, z] = self.extent();
        x as u64 * y as u64 * z as u64
    }

    /// True when any axis is zero.
    pub fn is_degenerate(&self) -> bool {
        self.extent().contains(&0)
    }
}

impl WorkDims for SpatialDims {
    fn dim_count(&self) -> u32 {
        match *self {
            SpatialDims::One(..) => 1,
            SpatialDims::Two(..) => 2,
            SpatialDims::Three(..) => 3,
        }
    }

    fn to_extent(&self) -> [u32; 3] {
        self.extent()
    }
}

impl From<u32> for SpatialDims {
    fn from(val: u32) -> SpatialDims {
        SpatialDims::One(val)
    }
}

impl From<i32> for SpatialDims {
    fn from(val: i32) -> SpatialDims {
        SpatialDims::One(to_u32(val))
    }
}

impl From<usize> for SpatialDims {
    fn from(val: usize) -> SpatialDims {
        SpatialDims::One(to_u32(val))
    }
}

impl From<u64> for SpatialDims {
    fn from(val: u64) -> SpatialDims {
        SpatialDims::One(to_u32(val))
    }
}

impl<T> From<(T,)> for SpatialDims
where
    T: ToPrimitive + Debug + Copy,
{
    fn from(val: (T,)) -> SpatialDims {
        SpatialDims::One(to_u32(val.0))
    }
}

impl<T> From<[T; 1]> for SpatialDims
where
    T: ToPrimitive + Debug + Copy,
{
    fn from(val: [T; 1]) -> SpatialDims {
        SpatialDims::One(to_u32(val[0]))
    }
}

impl<T> From<(T, T)> for SpatialDims
where
    T: ToPrimitive + Debug + Copy,
{
    fn from(val: (T, T)) -> SpatialDims {
        SpatialDims::Two(to_u32(val.0), to_u32(val.1))
    }
}

impl<T> From<[T; 2]> for SpatialDims
where
    T: ToPrimitive + Debug + Copy,
{
    fn from(val: [T; 2]) -> SpatialDims {
        SpatialDims::Two(to_u32(val[0]), to_u32(val[1]))
    }
}

impl<T> From<(T, T, T)> for SpatialDims
where
    T: ToPrimitive + Debug + Copy,
{
    fn from(val: (T, T, T)) -> SpatialDims {
        SpatialDims::Three(to_u32(val.0), to_u32(val.1), to_u32(val.2))
    }
}

impl<T> From<[T; 3]> for SpatialDims
where
    T: ToPrimitive + Debug + Copy,
{
    fn from(val: [T; 3]) -> SpatialDims {
        SpatialDims::Three(to_u32(val[0]), to_u32(val[1]), to_u32(val[2]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(SpatialDims::from(64u32), SpatialDims::One(64));
        assert_eq!(SpatialDims::from([4, 8]), SpatialDims::Two(4, 8));
        assert_eq!(SpatialDims::from((2, 3, 4)), SpatialDims::Three(2, 3, 4));
        assert_eq!(SpatialDims::from((2, 3, 4)).product(), 24);
        assert_eq!(SpatialDims::from([4, 8]).extent(), [4, 8, 1]);
    }
}
