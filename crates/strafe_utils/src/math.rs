use glam::Vec3;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// An inverted box that any point extends.
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Grows the box to contain `point`.
    pub fn extend(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Shrinks the box by `amount` on every side. The box may end up inverted
    /// when it is thinner than `2 * amount` on some axis; callers that iterate
    /// the extents are expected to clamp.
    pub fn shrunk(&self, amount: f32) -> Aabb {
        Aabb {
            min: self.min + Vec3::splat(amount),
            max: self.max - Vec3::splat(amount),
        }
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }
}

/// Comparison with a fixed tolerance, for places where accumulated
/// floating-point error is expected.
pub fn is_almost_equal(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_and_contains() {
        let mut aabb = Aabb::EMPTY;
        aabb.extend(Vec3::new(-1.0, 0.0, 2.0));
        aabb.extend(Vec3::new(3.0, -2.0, 0.0));

        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(3.0, 0.0, 2.0));
        assert!(aabb.contains(Vec3::new(0.0, -1.0, 1.0)));
        assert!(!aabb.contains(Vec3::new(0.0, -3.0, 1.0)));
    }

    #[test]
    fn shrunk_moves_both_sides() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::splat(10.0)).shrunk(1.0);
        assert_eq!(aabb.min, Vec3::splat(1.0));
        assert_eq!(aabb.max, Vec3::splat(9.0));
    }
}
