//! Sampling primitives for the Monte-Carlo integrator.

use glam::{Mat3, Quat, Vec3};
use rand::Rng;
use std::f32::consts::PI;

/// Uniform direction on the unit sphere.
pub fn uniform_sphere_sample(rng: &mut impl Rng) -> Vec3 {
    let rand1: f32 = rng.gen();
    let rand2: f32 = rng.gen();

    let z = 1.0 - 2.0 * rand1;
    let ring = (1.0 - z * z).sqrt();
    Vec3 {
        x: (2.0 * PI * rand2).cos() * ring,
        y: (2.0 * PI * rand2).sin() * ring,
        z,
    }
}

pub const fn uniform_sphere_sample_pdf() -> f32 {
    1.0 / (4.0 * PI)
}

/// Shirley's area-preserving square-to-disk mapping. Returns a point on the
/// unit disk in the XY plane.
pub fn concentric_disk_sample(rng: &mut impl Rng) -> Vec3 {
    let rand1 = 2.0 * rng.gen::<f32>() - 1.0;
    let rand2 = 2.0 * rng.gen::<f32>() - 1.0;

    if rand1 == 0.0 && rand2 == 0.0 {
        return Vec3::ZERO;
    }

    let (r, theta) = if rand1.abs() > rand2.abs() {
        (rand1, PI * rand2 / (rand1 * 4.0))
    } else {
        (rand2, PI / 2.0 - PI * rand1 / (rand2 * 4.0))
    };

    Vec3::new(r * theta.cos(), r * theta.sin(), 0.0)
}

/// Cosine-weighted direction in the upper hemisphere around +Z: the disk
/// sample lifted onto the sphere.
pub fn cosine_weighted_sample(rng: &mut impl Rng) -> Vec3 {
    let mut sample = concentric_disk_sample(rng);
    sample.z = (1.0 - sample.x * sample.x - sample.y * sample.y).max(0.0).sqrt();
    sample
}

pub fn cosine_weighted_sample_pdf(cos_theta: f32) -> f32 {
    cos_theta / PI
}

/// Random triple for area-light sampling: x and y pick the point on a
/// triangle, z picks the triangle through the area CDF.
pub fn area_light_sample(rng: &mut impl Rng) -> Vec3 {
    Vec3::new(rng.gen(), rng.gen(), rng.gen())
}

/// Basis rotating +Z onto `normal`, for orienting hemisphere samples.
pub fn rotation_from_z_to(normal: Vec3) -> Mat3 {
    Mat3::from_quat(Quat::from_rotation_arc(Vec3::Z, normal))
}

/// Windowed inverse-square falloff (Real-Time Rendering, 4th ed., pp. 111-113).
///
/// Distances at or under `dist0` count as being inside the light source and
/// clamp to 1; the window forces an exact zero at `dist_max`.
pub fn distance_falloff(dist: f32, dist0: f32, dist_max: f32) -> f32 {
    if dist >= dist_max {
        return 0.0;
    }
    if dist <= dist0 {
        return 1.0;
    }

    debug_assert!(dist > 0.0, "can't have negative distance");
    debug_assert!(dist_max > 0.0, "max distance must be more than zero");

    let windowed = (1.0 - (dist / dist_max).powi(4)).max(0.0).powi(2);
    let inverse_square = (dist0 / dist).powi(2);

    windowed * inverse_square
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn sphere_samples_are_unit_length() {
        let mut rng = rng();
        for _ in 0..256 {
            let sample = uniform_sphere_sample(&mut rng);
            assert!((sample.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn cosine_samples_stay_in_the_upper_hemisphere() {
        let mut rng = rng();
        for _ in 0..256 {
            let sample = cosine_weighted_sample(&mut rng);
            assert!(sample.z >= 0.0);
            assert!(sample.length() <= 1.0 + 1e-5);
        }
    }

    #[test]
    fn rotated_sample_preserves_the_z_angle() {
        let mut rng = rng();
        let normal = Vec3::new(1.0, 2.0, -0.5).normalize();
        let rotation = rotation_from_z_to(normal);

        for _ in 0..64 {
            let sample = cosine_weighted_sample(&mut rng);
            let rotated = rotation * sample;
            // Angle to the normal equals the unrotated angle to +Z
            assert!((normal.dot(rotated) - sample.z).abs() < 1e-4);
        }
    }

    #[test]
    fn falloff_boundaries() {
        assert_eq!(distance_falloff(1000.0, 1.0, 1000.0), 0.0);
        assert_eq!(distance_falloff(2000.0, 1.0, 1000.0), 0.0);
        assert_eq!(distance_falloff(0.5, 1.0, 1000.0), 1.0);
        assert_eq!(distance_falloff(1.0, 1.0, 1000.0), 1.0);
    }

    #[test]
    fn falloff_is_strictly_monotone_between_the_clamps() {
        let mut previous = 1.0;
        for step in 1..100 {
            let dist = 1.0 + step as f32 * 9.989;
            let value = distance_falloff(dist, 1.0, 1000.0);
            assert!(value < previous, "falloff not decreasing at {dist}");
            assert!(value > 0.0);
            previous = value;
        }
    }

    #[test]
    fn disk_samples_land_on_the_unit_disk() {
        let mut rng = rng();
        for _ in 0..256 {
            let sample = concentric_disk_sample(&mut rng);
            assert_eq!(sample.z, 0.0);
            assert!(sample.length() <= 1.0 + 1e-5);
        }
    }
}
