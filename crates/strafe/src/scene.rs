//! Static scene inputs consumed by the renderer and the light baker, plus the
//! BSP interface the baker queries for visibility.
//!
//! The BSP itself (map loading, PVS decompression, tree walks) lives outside
//! this crate; [`BspTree`] is the surface the core consumes.

use ahash::AHashMap;
use glam::Vec3;
use std::collections::BTreeSet;
use strafe_utils::math::Aabb;

/// Triangle mesh of one static map surface.
#[derive(Debug, Clone, Default)]
pub struct SourceStaticObject {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub texture_key: String,
}

impl SourceStaticObject {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn triangle_vertices(&self, triangle: usize) -> [Vec3; 3] {
        let i0 = self.indices[triangle * 3] as usize;
        let i1 = self.indices[triangle * 3 + 1] as usize;
        let i2 = self.indices[triangle * 3 + 2] as usize;
        [self.vertices[i0], self.vertices[i1], self.vertices[i2]]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PointLight {
    pub origin: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    /// Radius of the emitting surface; inside it the falloff clamps to 1.
    pub radius: f32,
}

/// An emissive map surface. Sampling needs the per-triangle area distribution,
/// which is precomputed once from the mesh.
#[derive(Debug, Clone, Default)]
pub struct AreaLight {
    pub static_object_index: usize,
    /// Emitted radiance, uniform over the surface.
    pub radiance: Vec3,
    pub area: f32,
    /// Normalized prefix sums of triangle areas; the last entry is 1.0.
    pub triangles_cdf: Vec<f32>,
}

impl AreaLight {
    pub fn new(static_object_index: usize, radiance: Vec3) -> Self {
        Self {
            static_object_index,
            radiance,
            area: 0.0,
            triangles_cdf: Vec::new(),
        }
    }

    /// Computes the total surface area and the triangle-area CDF used to map
    /// uniform random numbers onto triangles proportionally to their area.
    pub fn init_distribution(&mut self, object: &SourceStaticObject) {
        let triangle_count = object.triangle_count();
        assert!(triangle_count > 0, "area light with no triangles");
        assert!(
            self.triangles_cdf.is_empty(),
            "area light distribution initialized twice"
        );

        let mut areas = Vec::with_capacity(triangle_count);
        for triangle in 0..triangle_count {
            let [v0, v1, v2] = object.triangle_vertices(triangle);
            areas.push((v1 - v0).cross(v2 - v0).length() / 2.0);
        }

        self.area = areas.iter().sum();

        let mut running = 0.0;
        self.triangles_cdf = areas
            .iter()
            .map(|area| {
                running += area;
                running / self.area
            })
            .collect();

        debug_assert!(
            (self.triangles_cdf.last().copied().unwrap() - 1.0).abs() < 1e-5,
            "triangle CDF does not end at 1.0"
        );
        // Guard against the last entry being 0.99999 and dropping samples
        *self.triangles_cdf.last_mut().unwrap() = 1.0;
    }

    pub fn uniform_sample_pdf(&self) -> f32 {
        1.0 / self.area
    }
}

/// Average albedo of a surface texture, used as the baking BRDF albedo.
/// Dim textures get rescaled the way the original Quake 2 path tracing code
/// does it, because wall textures are so dark.
pub fn calculate_reflectivity(width: u32, height: u32, rgba: &[u8]) -> Vec3 {
    let texel_count = (width * height) as usize;
    assert_eq!(rgba.len(), texel_count * 4, "texture data size mismatch");

    let mut sum = Vec3::ZERO;
    for texel in rgba.chunks_exact(4) {
        sum += Vec3::new(texel[0] as f32, texel[1] as f32, texel[2] as f32);
    }

    let mut reflectivity = sum / texel_count as f32 / 255.0;

    let mut scale = reflectivity.max_element();
    if scale != 0.0 {
        reflectivity /= scale;
    }
    if scale < 0.5 {
        scale *= 2.0;
        reflectivity *= scale;
    }

    reflectivity
}

/// Static scene: geometry, lights and per-texture reflectivity.
#[derive(Debug, Default)]
pub struct Scene {
    pub static_objects: Vec<SourceStaticObject>,
    pub point_lights: Vec<PointLight>,
    pub area_lights: Vec<AreaLight>,
    /// Texture key -> average albedo, filled as textures are loaded.
    pub reflectivity: AHashMap<String, Vec3>,
}

impl Scene {
    /// Albedo of a static object's surface. Falls back to mid gray when the
    /// texture was never seen, so an unbaked texture doesn't black-hole the
    /// bake.
    pub fn object_reflectivity(&self, object_index: usize) -> Vec3 {
        self.static_objects
            .get(object_index)
            .and_then(|object| self.reflectivity.get(&object.texture_key))
            .copied()
            .unwrap_or(Vec3::splat(0.5))
    }
}

// --- BSP interface

#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

/// Leaf lookup result; `cluster` is `None` outside the playable area.
#[derive(Debug, Clone, Copy)]
pub struct BspNode {
    pub cluster: Option<u32>,
}

/// Closest-hit result of a BSP ray query. `u`, `v`, `w` are the barycentric
/// weights of the hit inside the triangle.
#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    pub w: f32,
    pub static_object_index: usize,
    pub triangle_index: usize,
}

impl RayHit {
    /// Shading normal: barycentric interpolation of the vertex normals.
    pub fn interpolated_normal(&self, objects: &[SourceStaticObject]) -> Vec3 {
        let object = &objects[self.static_object_index];
        let i0 = object.indices[self.triangle_index * 3] as usize;
        let i1 = object.indices[self.triangle_index * 3 + 1] as usize;
        let i2 = object.indices[self.triangle_index * 3 + 2] as usize;

        (object.normals[i0] * self.u + object.normals[i1] * self.v + object.normals[i2] * self.w)
            .normalize()
    }
}

/// The map's binary space partition with its potentially visible set, as the
/// baker consumes it.
pub trait BspTree: Sync {
    /// Every cluster index present in the map, ascending.
    fn clusters_set(&self) -> BTreeSet<u32>;

    fn cluster_aabb(&self, cluster: u32) -> Aabb;

    fn node_with_point(&self, point: Vec3) -> BspNode;

    fn is_point_visible_from_other_point(&self, from: Vec3, to: Vec3) -> bool;

    /// Indices of static objects potentially visible from `point`, pruned by
    /// the PVS of the cluster containing it.
    fn potentially_visible_objects(&self, point: Vec3) -> Vec<usize>;

    fn find_closest_ray_intersection(&self, ray: Ray) -> Option<RayHit>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_object() -> SourceStaticObject {
        // Two triangles: a unit right triangle and one twice its area
        SourceStaticObject {
            vertices: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(2.0, 0.0, 1.0),
                Vec3::new(0.0, 2.0, 1.0),
            ],
            normals: vec![Vec3::Z; 5],
            indices: vec![0, 1, 2, 0, 3, 4],
            texture_key: "e1u1/floor".to_string(),
        }
    }

    #[test]
    fn area_light_cdf_is_area_weighted() {
        let object = quad_object();
        let mut light = AreaLight::new(0, Vec3::ONE);
        light.init_distribution(&object);

        assert!((light.area - 2.5).abs() < 1e-5);
        assert_eq!(light.triangles_cdf.len(), 2);
        assert!((light.triangles_cdf[0] - 0.2).abs() < 1e-5);
        assert_eq!(light.triangles_cdf[1], 1.0);
        assert!((light.uniform_sample_pdf() - 0.4).abs() < 1e-5);
    }

    #[test]
    fn reflectivity_of_a_bright_texture_is_normalized() {
        // 2x1 texture, pure red and pure dim red
        let data = [255, 0, 0, 255, 127, 0, 0, 255];
        let reflectivity = calculate_reflectivity(2, 1, &data);
        // Average ~0.749 red, normalized to 1.0
        assert!((reflectivity.x - 1.0).abs() < 1e-5);
        assert_eq!(reflectivity.y, 0.0);
    }

    #[test]
    fn dim_textures_are_rescaled_not_normalized() {
        // Uniform 10% gray: scale = 0.1 < 0.5, so result is 2 * original
        let data = [26, 26, 26, 255];
        let reflectivity = calculate_reflectivity(1, 1, &data);
        let expected = 2.0 * 26.0 / 255.0;
        assert!((reflectivity.x - expected).abs() < 1e-4);
        assert!((reflectivity.y - expected).abs() < 1e-4);
    }

    #[test]
    fn interpolated_normal_uses_barycentrics() {
        let mut object = quad_object();
        object.normals[0] = Vec3::X;
        object.normals[1] = Vec3::Y;
        object.normals[2] = Vec3::Z;

        let hit = RayHit {
            t: 1.0,
            u: 1.0,
            v: 0.0,
            w: 0.0,
            static_object_index: 0,
            triangle_index: 0,
        };
        let normal = hit.interpolated_normal(std::slice::from_ref(&object));
        assert!((normal - Vec3::X).length() < 1e-5);
    }
}
