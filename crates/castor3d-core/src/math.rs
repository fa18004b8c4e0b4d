//! Math utilities and helpers.

use glam::{Mat4, Vec3};

/// Axis-Aligned Bounding Box.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Create a new AABB from min and max corners
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box holding every point, `None` for an empty iterator.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        let mut result = Self::new(first, first);
        for point in points {
            result.expand_to_include(point);
        }
        Some(result)
    }

    /// Get the center of the AABB
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size of the AABB
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Largest edge length.
    #[inline]
    pub fn max_dimension(&self) -> f32 {
        self.size().max_element()
    }

    /// Check if a point is inside the AABB
    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Expand the AABB to include a point
    #[inline]
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Merge two AABBs
    #[inline]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Round `value` up to a multiple of `alignment`.
///
/// An alignment of zero leaves the value unchanged.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Smallest `n` such that `2^n >= value`.
#[inline]
pub const fn ceil_log2(value: u64) -> u32 {
    if value <= 1 {
        0
    } else {
        u64::BITS - (value - 1).leading_zeros()
    }
}

/// Snap each component of `position` down to a multiple of `step`.
#[inline]
pub fn snap_to_step(position: Vec3, step: f32) -> Vec3 {
    if step <= 0.0 {
        return position;
    }
    (position / step).floor() * step
}

/// Pixel-space orthographic projection with the origin in the top-left corner.
#[inline]
pub fn ortho_pixels(width: u32, height: u32) -> Mat4 {
    Mat4::orthographic_rh(0.0, width as f32, 0.0, height as f32, -1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn aabb_contains_point() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.contains_point(Vec3::splat(0.5)));
        assert!(aabb.contains_point(Vec3::ONE));
        assert!(!aabb.contains_point(Vec3::new(2.0, 0.5, 0.5)));
    }

    #[test]
    fn aabb_from_points() {
        let aabb = Aabb::from_points([
            Vec3::new(1.0, -2.0, 0.0),
            Vec3::new(-1.0, 4.0, 3.0),
            Vec3::ZERO,
        ])
        .unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 4.0, 3.0));
        assert_relative_eq!(aabb.max_dimension(), 6.0);
        assert!(Aabb::from_points(std::iter::empty()).is_none());
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(300, 64), 320);
        assert_eq!(align_up(17, 0), 17);
    }

    #[test]
    fn log2_rounding() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(100), 7);
        assert_eq!(ceil_log2(128), 7);
    }

    #[test]
    fn snapping() {
        let snapped = snap_to_step(Vec3::new(1.7, -0.2, 4.0), 0.5);
        assert_relative_eq!(snapped.x, 1.5);
        assert_relative_eq!(snapped.y, -0.5);
        assert_relative_eq!(snapped.z, 4.0);
        assert_eq!(snap_to_step(Vec3::ONE, 0.0), Vec3::ONE);
    }

    #[test]
    fn ortho_maps_corners() {
        let ortho = ortho_pixels(800, 600);
        let top_left = ortho.project_point3(Vec3::ZERO);
        let bottom_right = ortho.project_point3(Vec3::new(800.0, 600.0, 0.0));
        assert_relative_eq!(top_left.x, -1.0);
        assert_relative_eq!(top_left.y, -1.0);
        assert_relative_eq!(bottom_right.x, 1.0);
        assert_relative_eq!(bottom_right.y, 1.0);
    }
}
