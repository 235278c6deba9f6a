//! Order-3 real spherical harmonics, the storage basis for baked irradiance.

use glam::Vec3;

pub const SH9_COEFF_COUNT: usize = 9;

/// Nine coefficients of something projected onto the order-3 SH basis.
pub type Sh9<T> = [T; SH9_COEFF_COUNT];

/// Evaluates the 9 SH basis functions in `direction`.
///
/// Constants follow MJP's BakingLab convention.
pub fn sh9_basis(direction: Vec3) -> Sh9<f32> {
    let Vec3 { x, y, z } = direction;
    let mut basis = [0.0; SH9_COEFF_COUNT];

    // Band 0
    basis[0] = 0.282095;

    // Band 1
    basis[1] = -0.488603 * y;
    basis[2] = 0.488603 * z;
    basis[3] = -0.488603 * x;

    // Band 2
    basis[4] = 1.092548 * x * y;
    basis[5] = -1.092548 * y * z;
    basis[6] = 0.315392 * (3.0 * z * z - 1.0);
    basis[7] = -1.092548 * x * z;
    basis[8] = 0.546274 * (x * x - y * y);

    basis
}

/// Projects one radiance sample arriving from `direction` onto the basis.
pub fn project_onto_sh9(direction: Vec3, color: Vec3) -> Sh9<Vec3> {
    let basis = sh9_basis(direction);
    basis.map(|value| color * value)
}
