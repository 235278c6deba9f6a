//! Offline diffuse-indirect light baker.
//!
//! For every bake point the baker shoots `PROBE_SAMPLES_NUM` paths, gathers
//! direct irradiance from point and area lights at every bounce, and projects
//! the per-path radiance onto a 9-coefficient spherical-harmonic probe. Bake
//! points come from a uniform grid inside each selected PVS cluster.
//!
//! Clusters bake in parallel on a worker pool. Workers write disjoint probe
//! ranges, so the only shared state is the progress counter; every worker
//! owns an RNG stream seeded from the bake seed and its cluster index.
//!
//! A finished bake is a *transferable* snapshot: [`LightBaker::post_bake`]
//! moves it to the renderer (and optionally to disk) and resets the
//! in-progress state, so a failed or abandoned bake never leaks a partial
//! result into the renderer.

use crate::config::*;
use crate::device::RendererHost;
use crate::scene::{AreaLight, BspTree, Ray, RayHit, Scene};
use glam::Vec3;
use log::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::f32::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

pub mod bakefile;
pub mod sampling;
pub mod sh;

use sampling::*;
use sh::{project_onto_sh9, Sh9, SH9_COEFF_COUNT};

#[derive(Debug, Error)]
pub enum BakeError {
    #[error("invalid baking input: {0}")]
    InputInvalid(String),

    #[error("baked data file error: {0}")]
    DataIo(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightBakingMode {
    AllClusters,
    CurrentPositionCluster,
}

impl LightBakingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LightBakingMode::AllClusters => "AllClusters",
            LightBakingMode::CurrentPositionCluster => "CurrentPositionCluster",
        }
    }

    pub fn from_str(text: &str) -> Option<LightBakingMode> {
        match text {
            "AllClusters" => Some(LightBakingMode::AllClusters),
            "CurrentPositionCluster" => Some(LightBakingMode::CurrentPositionCluster),
            _ => None,
        }
    }
}

/// One segment of a traced path, kept when `save_ray_path` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub v0: Vec3,
    pub v1: Vec3,
    pub bounce: u32,
    /// Radiance accumulated by the path up to this segment.
    pub radiance: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Point,
    Area,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LightSample {
    pub kind: LightKind,
    pub position: Vec3,
    pub radiance: Vec3,
}

/// Direct-light gathering done at one path vertex.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightSamplePoint {
    pub position: Vec3,
    pub samples: Vec<LightSample>,
}

/// Light-gather info along one path, one entry per bounce.
pub type PathLightSampleInfo = Vec<LightSamplePoint>;

/// A baked probe: RGB irradiance projected onto SH9, plus optional debug
/// payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffuseProbe {
    pub radiance_sh: Sh9<Vec3>,
    pub path_segments: Option<Vec<PathSegment>>,
    pub light_samples: Option<Vec<PathLightSampleInfo>>,
}

impl Default for DiffuseProbe {
    fn default() -> Self {
        Self {
            radiance_sh: [Vec3::ZERO; SH9_COEFF_COUNT],
            path_segments: None,
            light_samples: None,
        }
    }
}

/// The transferable result of a bake, also the on-disk representation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BakingData {
    pub mode: Option<LightBakingMode>,
    /// The single baked cluster, in `CurrentPositionCluster` mode.
    pub baking_cluster: Option<u32>,
    /// `cluster_first_probe_indices[c]` is the flat index of cluster `c`'s
    /// first probe, in `AllClusters` mode.
    pub cluster_first_probe_indices: Vec<usize>,
    pub probes: Vec<DiffuseProbe>,
}

#[derive(Debug, Clone, Default)]
pub struct BakeFlags {
    pub sample_point_lights: bool,
    pub sample_area_lights: bool,
    pub save_ray_path: bool,
    pub save_light_sampling: bool,
    pub save_to_file_after_bake: bool,
}

pub struct LightBaker {
    transferable: BakingData,
    cluster_bake_points: Vec<Vec<Vec3>>,
    probes_baked: AtomicUsize,
    is_complete: AtomicBool,
    bake_position: Option<Vec3>,
    pub flags: BakeFlags,
    seed: u64,
}

impl Default for LightBaker {
    fn default() -> Self {
        Self::new()
    }
}

impl LightBaker {
    pub fn new() -> Self {
        Self {
            transferable: BakingData {
                mode: Some(LightBakingMode::CurrentPositionCluster),
                ..Default::default()
            },
            cluster_bake_points: Vec::new(),
            probes_baked: AtomicUsize::new(0),
            is_complete: AtomicBool::new(false),
            bake_position: None,
            flags: BakeFlags {
                sample_point_lights: true,
                sample_area_lights: true,
                ..Default::default()
            },
            seed: 0x5u64.wrapping_mul(0x9e3779b97f4a7c15),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_baking_mode(&mut self, mode: LightBakingMode) {
        self.transferable.mode = Some(mode);
    }

    pub fn baking_mode(&self) -> LightBakingMode {
        self.transferable.mode.expect("baking mode is not set")
    }

    pub fn baked_cluster(&self) -> Option<u32> {
        self.transferable.baking_cluster
    }

    /// Sets the position whose cluster is baked in
    /// `CurrentPositionCluster` mode. Consumed by the next bake.
    pub fn set_bake_position(&mut self, position: Vec3) {
        debug_assert!(self.bake_position.is_none(), "bake position is not cleared");
        self.bake_position = Some(position);
    }

    pub fn total_probes(&self) -> usize {
        self.transferable.probes.len()
    }

    pub fn baked_probes(&self) -> usize {
        let baked = self.probes_baked.load(Ordering::Relaxed);
        debug_assert!(baked <= self.total_probes(), "baked probes exceeded total probes");
        baked
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete.load(Ordering::Acquire)
    }

    /// Runs a full bake synchronously: bake-point generation, the parallel
    /// probe integration, and the completion flag. Workers are joined before
    /// this returns.
    pub fn bake(&mut self, scene: &Scene, bsp: &dyn BspTree) -> Result<(), BakeError> {
        self.pre_bake(bsp)?;

        let context = BakeContext {
            scene,
            bsp,
            flags: self.flags.clone(),
        };

        info!(
            "baking {} probes across {} clusters",
            self.total_probes(),
            self.cluster_bake_points.iter().filter(|points| !points.is_empty()).count()
        );

        let seed = self.seed;
        let probes_baked = &self.probes_baked;
        let cluster_bake_points = &self.cluster_bake_points;

        // Carve the flat probe array into disjoint per-cluster ranges; the
        // workers share nothing else but the progress counter.
        let mut cluster_probes = Vec::with_capacity(cluster_bake_points.len());
        let mut rest = self.transferable.probes.as_mut_slice();
        for points in cluster_bake_points {
            let (head, tail) = rest.split_at_mut(points.len());
            cluster_probes.push(head);
            rest = tail;
        }

        cluster_probes
            .into_par_iter()
            .enumerate()
            .for_each(|(cluster, probes)| {
                let mut rng = SmallRng::seed_from_u64(
                    seed ^ (cluster as u64).wrapping_mul(0x9e3779b97f4a7c15),
                );

                let points = &cluster_bake_points[cluster];
                for (probe, point) in probes.iter_mut().zip(points) {
                    bake_probe(&context, &mut rng, *point, probe);
                    probes_baked.fetch_add(1, Ordering::Relaxed);
                }
            });

        self.is_complete
            .store(self.baked_probes() == self.total_probes(), Ordering::Release);

        Ok(())
    }

    fn pre_bake(&mut self, bsp: &dyn BspTree) -> Result<(), BakeError> {
        debug_assert!(
            self.transferable.cluster_first_probe_indices.is_empty(),
            "cluster probe data should be empty before bake"
        );
        debug_assert!(
            self.cluster_bake_points.is_empty(),
            "cluster bake points should be empty before bake"
        );
        debug_assert_eq!(self.baked_probes(), 0, "baked probe counter was not reset");
        debug_assert!(
            self.transferable.probes.is_empty(),
            "probes were baked but never consumed"
        );

        let mode = self
            .transferable
            .mode
            .ok_or_else(|| BakeError::InputInvalid("baking mode is not set".to_string()))?;

        if mode == LightBakingMode::AllClusters && self.flags.save_ray_path {
            return Err(BakeError::InputInvalid(
                "can't save ray paths when baking all clusters".to_string(),
            ));
        }

        self.cluster_bake_points = self.generate_clusters_bake_points(mode, bsp)?;

        let mut total_probes = 0;
        self.transferable.cluster_first_probe_indices = self
            .cluster_bake_points
            .iter()
            .map(|points| {
                let first = total_probes;
                total_probes += points.len();
                first
            })
            .collect();

        self.transferable.probes = vec![DiffuseProbe::default(); total_probes];
        Ok(())
    }

    fn generate_clusters_bake_points(
        &mut self,
        mode: LightBakingMode,
        bsp: &dyn BspTree,
    ) -> Result<Vec<Vec<Vec3>>, BakeError> {
        match mode {
            LightBakingMode::AllClusters => {
                self.transferable.baking_cluster = None;

                let clusters = bsp.clusters_set();
                let last = clusters.iter().next_back().copied().ok_or_else(|| {
                    BakeError::InputInvalid("the BSP has no clusters".to_string())
                })?;

                let mut bake_points = vec![Vec::new(); last as usize + 1];
                for cluster in clusters {
                    bake_points[cluster as usize] = generate_cluster_bake_points(bsp, cluster);
                }
                Ok(bake_points)
            }
            LightBakingMode::CurrentPositionCluster => {
                let position = self.bake_position.take().ok_or_else(|| {
                    BakeError::InputInvalid("bake position is not set".to_string())
                })?;

                let cluster = bsp.node_with_point(position).cluster.ok_or_else(|| {
                    BakeError::InputInvalid("bake position is outside any cluster".to_string())
                })?;

                self.transferable.baking_cluster = Some(cluster);

                let mut bake_points = vec![Vec::new(); cluster as usize + 1];
                bake_points[cluster as usize] = generate_cluster_bake_points(bsp, cluster);
                Ok(bake_points)
            }
        }
    }

    /// Moves the finished snapshot out. In-progress bookkeeping is reset; the
    /// baking mode survives for the next run.
    pub fn transfer_baking_result(&mut self) -> BakingData {
        self.is_complete.store(false, Ordering::Release);

        let mode = self.transferable.mode;
        let result = std::mem::take(&mut self.transferable);
        self.transferable.mode = mode;

        result
    }

    /// Completes a bake: transfers the snapshot, optionally saves it, and
    /// hands it to the renderer. A file-save failure is logged and doesn't
    /// affect the in-memory result.
    pub fn post_bake(&mut self, host: &mut dyn RendererHost, data_dir: &Path) {
        debug_assert!(
            !self.transferable.probes.is_empty(),
            "baking is finished but no probes were generated"
        );

        let result = self.transfer_baking_result();

        if self.flags.save_to_file_after_bake {
            let path = data_dir.join(LIGHT_BAKING_DATA_FILENAME);
            if let Err(err) = bakefile::save(&path, &result) {
                error!("failed to save baking results to {}: {err}", path.display());
            }
            self.flags.save_to_file_after_bake = false;
        }

        host.consume_diffuse_indirect_lighting(result);

        self.probes_baked.store(0, Ordering::Relaxed);
        self.cluster_bake_points.clear();
    }

    /// Replaces the in-memory result with one parsed from disk, as if a bake
    /// had just completed.
    pub fn load_from_file(
        &mut self,
        grammar: &crate::graph::grammar::Grammar,
        path: &Path,
    ) -> Result<(), BakeError> {
        self.transferable = bakefile::load(grammar, path)?;
        self.is_complete.store(true, Ordering::Release);
        Ok(())
    }
}

/// Uniform grid of bake points inside a cluster's AABB. The box is shrunk by
/// epsilon so points never start exactly on cluster geometry; coordinates are
/// clamped to the shrunk maximum. An axis thinner than the grid interval (or
/// than epsilon) still contributes one layer of points.
fn generate_cluster_bake_points(bsp: &dyn BspTree, cluster: u32) -> Vec<Vec3> {
    let aabb = bsp.cluster_aabb(cluster).shrunk(PATH_TRACING_EPSILON);

    let axis_count = |extent: f32| ((extent / BAKE_POINTS_INTERVAL).ceil() as i64).max(1) as usize;
    let x_num = axis_count(aabb.max.x - aabb.min.x);
    let y_num = axis_count(aabb.max.y - aabb.min.y);
    let z_num = axis_count(aabb.max.z - aabb.min.z);

    let mut points = Vec::with_capacity(x_num * y_num * z_num);
    for x in 0..x_num {
        for y in 0..y_num {
            for z in 0..z_num {
                points.push(Vec3 {
                    x: (aabb.min.x + BAKE_POINTS_INTERVAL * x as f32).min(aabb.max.x),
                    y: (aabb.min.y + BAKE_POINTS_INTERVAL * y as f32).min(aabb.max.y),
                    z: (aabb.min.z + BAKE_POINTS_INTERVAL * z as f32).min(aabb.max.z),
                });
            }
        }
    }

    points
}

// --- Per-probe integration

struct BakeContext<'a> {
    scene: &'a Scene,
    bsp: &'a dyn BspTree,
    flags: BakeFlags,
}

struct ProbePathTraceResult {
    radiance: Vec3,
    path_segments: Option<Vec<PathSegment>>,
    light_samples: Option<PathLightSampleInfo>,
}

fn bake_probe(ctx: &BakeContext, rng: &mut SmallRng, bake_point: Vec3, probe: &mut DiffuseProbe) {
    probe.radiance_sh = [Vec3::ZERO; SH9_COEFF_COUNT];
    probe.path_segments = ctx.flags.save_ray_path.then(Vec::new);
    probe.light_samples = ctx.flags.save_light_sampling.then(Vec::new);

    for _ in 0..PROBE_SAMPLES_NUM {
        let (direction, sample) = path_trace_from_probe(ctx, rng, bake_point);

        if let Some(segments) = &mut probe.path_segments {
            segments.extend(sample.path_segments.expect("ray path flag set but no segments"));
        }
        if let Some(light_samples) = &mut probe.light_samples {
            light_samples.push(sample.light_samples.expect("light sampling flag set but no info"));
        }

        let sample_projection = project_onto_sh9(direction, sample.radiance);
        for (total, value) in probe.radiance_sh.iter_mut().zip(sample_projection) {
            *total += value;
        }
    }

    // Monte-Carlo estimate of the sphere integral: divide by pdf and N
    let monte_carlo_factor = (1.0 / uniform_sphere_sample_pdf()) / PROBE_SAMPLES_NUM as f32;
    for coeff in &mut probe.radiance_sh {
        *coeff *= monte_carlo_factor;
    }
}

fn lambertian_brdf(albedo: Vec3) -> Vec3 {
    albedo / PI
}

/// Traces one path from a probe and returns the initial direction together
/// with the indirect radiance that arrived along it.
fn path_trace_from_probe(
    ctx: &BakeContext,
    rng: &mut SmallRng,
    probe_coord: Vec3,
) -> (Vec3, ProbePathTraceResult) {
    let mut result = ProbePathTraceResult {
        radiance: Vec3::ZERO,
        path_segments: ctx.flags.save_ray_path.then(Vec::new),
        light_samples: ctx.flags.save_light_sampling.then(Vec::new),
    };

    let initial_direction = uniform_sphere_sample(rng);

    let mut ray = Ray {
        origin: probe_coord,
        direction: initial_direction,
    };
    let mut throughput = Vec3::ONE;
    let mut bounce = 0u32;

    loop {
        let guaranteed_bounce = bounce < GUARANTEED_BOUNCES_NUM;
        if !guaranteed_bounce {
            // Russian roulette: absorbed paths end, survivors repay the
            // termination probability through their throughput
            if rng.gen::<f32>() < RUSSIAN_ROULETTE_ABSORPTION_PROBABILITY {
                break;
            }
            throughput /= 1.0 - RUSSIAN_ROULETTE_ABSORPTION_PROBABILITY;
        }

        let Some(hit) = ctx.bsp.find_closest_ray_intersection(ray) else {
            if let Some(segments) = &mut result.path_segments {
                const MISS_RAY_LEN: f32 = 25.0;
                segments.push(PathSegment {
                    v0: ray.origin,
                    v1: ray.origin + ray.direction * MISS_RAY_LEN,
                    bounce,
                    radiance: result.radiance,
                });
            }
            break;
        };

        // Reconstruct the hit slightly before the triangle; the epsilon keeps
        // the follow-up rays from starting behind the surface they just hit
        let intersection_point = ray.origin + ray.direction * (hit.t - PATH_TRACING_EPSILON);

        if let Some(segments) = &mut result.path_segments {
            segments.push(PathSegment {
                v0: ray.origin,
                v1: intersection_point,
                bounce,
                radiance: result.radiance,
            });
        }

        let mut light_gather_info = ctx.flags.save_light_sampling.then(LightSamplePoint::default);

        let direct_irradiance =
            gather_direct_irradiance_at_hit(ctx, rng, intersection_point, &hit, light_gather_info.as_mut());

        if let Some(samples) = &mut result.light_samples {
            samples.push(light_gather_info.expect("light gather info missing"));
        }

        result.radiance += direct_irradiance * throughput;

        // New direction: cosine-weighted around the shading normal
        let normal = hit.interpolated_normal(&ctx.scene.static_objects);
        let cosine_sample = cosine_weighted_sample(rng);
        let new_direction = rotation_from_z_to(normal) * cosine_sample;

        debug_assert!((normal.length() - 1.0).abs() < 1e-4, "normal is not normalized");
        debug_assert!(
            (new_direction.length() - 1.0).abs() < 1e-4,
            "bounce direction is not normalized"
        );

        let n_dot_l = normal.dot(new_direction);
        debug_assert!(n_dot_l > 0.0, "bounce direction points into the surface");
        debug_assert!(
            (n_dot_l - cosine_sample.z).abs() < 1e-4,
            "rotation changed the sample's angle to the normal"
        );

        // One reflected sample per vertex, so the estimator divides by its pdf
        let pdf = cosine_weighted_sample_pdf(n_dot_l);
        let brdf = lambertian_brdf(ctx.scene.object_reflectivity(hit.static_object_index));
        throughput *= brdf * n_dot_l / pdf;

        ray = Ray {
            origin: intersection_point,
            direction: new_direction,
        };
        bounce += 1;
    }

    (initial_direction, result)
}

/// Direct irradiance arriving at a path vertex, from both light kinds.
fn gather_direct_irradiance_at_hit(
    ctx: &BakeContext,
    rng: &mut SmallRng,
    intersection_point: Vec3,
    hit: &RayHit,
    mut debug_info: Option<&mut LightSamplePoint>,
) -> Vec3 {
    if let Some(info) = debug_info.as_deref_mut() {
        info.position = intersection_point;
    }

    let normal = hit.interpolated_normal(&ctx.scene.static_objects);
    let brdf = lambertian_brdf(ctx.scene.object_reflectivity(hit.static_object_index));

    let mut irradiance = Vec3::ZERO;

    if ctx.flags.sample_point_lights {
        irradiance += gather_irradiance_from_point_lights(
            ctx,
            intersection_point,
            normal,
            brdf,
            debug_info.as_deref_mut(),
        );
    }

    if ctx.flags.sample_area_lights {
        irradiance += gather_irradiance_from_area_lights(
            ctx,
            rng,
            intersection_point,
            normal,
            brdf,
            debug_info,
        );
    }

    irradiance
}

fn gather_irradiance_from_point_lights(
    ctx: &BakeContext,
    intersection_point: Vec3,
    normal: Vec3,
    brdf: Vec3,
    mut debug_info: Option<&mut LightSamplePoint>,
) -> Vec3 {
    let mut result = Vec3::ZERO;

    for light in &ctx.scene.point_lights {
        if light.intensity == 0.0 {
            continue;
        }

        let to_light = light.origin - intersection_point;
        let distance = to_light.length();
        if distance > POINT_LIGHTS_MAX_DISTANCE {
            continue;
        }

        let n_dot_l = to_light.normalize().dot(normal);
        if n_dot_l <= 0.0 {
            continue;
        }

        // The visibility test walks the BSP, so it goes last
        if !ctx
            .bsp
            .is_point_visible_from_other_point(intersection_point, light.origin)
        {
            continue;
        }

        let falloff = distance_falloff(distance, light.radius, POINT_LIGHTS_MAX_DISTANCE);
        if falloff == 0.0 {
            continue;
        }

        let base_radiance = light.color * light.intensity;
        let radiance = brdf * falloff * base_radiance * n_dot_l;

        // We can't receive more energy than the light produces
        debug_assert!(radiance.x >= 0.0 && radiance.x <= base_radiance.x);
        debug_assert!(radiance.y >= 0.0 && radiance.y <= base_radiance.y);
        debug_assert!(radiance.z >= 0.0 && radiance.z <= base_radiance.z);

        result += radiance;

        if let Some(info) = debug_info.as_deref_mut() {
            info.samples.push(LightSample {
                kind: LightKind::Point,
                position: light.origin,
                radiance,
            });
        }
    }

    result
}

fn gather_irradiance_from_area_lights(
    ctx: &BakeContext,
    rng: &mut SmallRng,
    intersection_point: Vec3,
    normal: Vec3,
    brdf: Vec3,
    mut debug_info: Option<&mut LightSamplePoint>,
) -> Vec3 {
    // Outside the playable area nothing is lit
    if ctx.bsp.node_with_point(intersection_point).cluster.is_none() {
        return Vec3::ZERO;
    }

    let potentially_visible = ctx.bsp.potentially_visible_objects(intersection_point);

    let mut result = Vec3::ZERO;
    for light in &ctx.scene.area_lights {
        if !potentially_visible.contains(&light.static_object_index) {
            continue;
        }

        result += gather_irradiance_from_area_light(
            ctx,
            rng,
            intersection_point,
            normal,
            brdf,
            light,
            debug_info.as_deref_mut(),
        );
    }

    result
}

fn gather_irradiance_from_area_light(
    ctx: &BakeContext,
    rng: &mut SmallRng,
    intersection_point: Vec3,
    normal: Vec3,
    brdf: Vec3,
    light: &AreaLight,
    mut debug_info: Option<&mut LightSamplePoint>,
) -> Vec3 {
    let mesh = &ctx.scene.static_objects[light.static_object_index];

    let mut radiance_sum = Vec3::ZERO;

    for _ in 0..AREA_LIGHTS_SAMPLES_NUM {
        let sample = area_light_sample(rng);

        let triangle = light
            .triangles_cdf
            .iter()
            .position(|&cdf| cdf >= sample.z)
            .expect("triangle sample not found in the area CDF");

        // Random square to barycentric triangle coordinates
        let u = 1.0 - sample.x.sqrt();
        let v = sample.y * sample.x.sqrt();
        let w = 1.0 - u - v;

        let i0 = mesh.indices[triangle * 3] as usize;
        let i1 = mesh.indices[triangle * 3 + 1] as usize;
        let i2 = mesh.indices[triangle * 3 + 2] as usize;

        let mut sample_point =
            mesh.vertices[i0] * u + mesh.vertices[i1] * v + mesh.vertices[i2] * w;

        // Pull the sample slightly toward the receiver so it can't sit
        // behind its own emitting surface
        let to_sample_dir = (sample_point - intersection_point).normalize();
        sample_point = intersection_point
            + to_sample_dir * ((sample_point - intersection_point).length() - PATH_TRACING_EPSILON);

        let to_sample = sample_point - intersection_point;

        // Receiver behind the light's emitting side
        if to_sample.dot(mesh.normals[i0]) >= 0.0 {
            continue;
        }

        let distance = to_sample.length();
        if distance > AREA_LIGHTS_MAX_DISTANCE {
            continue;
        }

        let n_dot_l = to_sample.normalize().dot(normal);
        if n_dot_l <= 0.0 {
            continue;
        }

        if !ctx
            .bsp
            .is_point_visible_from_other_point(intersection_point, sample_point)
        {
            continue;
        }

        let falloff = distance_falloff(distance, AREA_LIGHTS_MIN_DISTANCE, AREA_LIGHTS_MAX_DISTANCE);
        if falloff == 0.0 {
            continue;
        }

        let sample_radiance = brdf * light.radiance * falloff * n_dot_l;

        // Energy conservation per channel
        debug_assert!(sample_radiance.x >= 0.0 && sample_radiance.x <= light.radiance.x);
        debug_assert!(sample_radiance.y >= 0.0 && sample_radiance.y <= light.radiance.y);
        debug_assert!(sample_radiance.z >= 0.0 && sample_radiance.z <= light.radiance.z);

        radiance_sum += sample_radiance;

        if let Some(info) = debug_info.as_deref_mut() {
            info.samples.push(LightSample {
                kind: LightKind::Area,
                position: sample_point,
                radiance: sample_radiance,
            });
        }
    }

    // Monte-Carlo integration over the light surface: the triangle-selection
    // and in-triangle probabilities collapse into area / N
    radiance_sum * light.area / AREA_LIGHTS_SAMPLES_NUM as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bakeresult_grammar, TestBsp, TestHost};
    use strafe_utils::math::Aabb;

    /// Floor quad covering the whole test map, normals up.
    fn floor_object() -> SourceStaticObject {
        SourceStaticObject {
            vertices: vec![
                Vec3::new(-200.0, -200.0, 0.0),
                Vec3::new(400.0, -200.0, 0.0),
                Vec3::new(400.0, 400.0, 0.0),
                Vec3::new(-200.0, 400.0, 0.0),
            ],
            normals: vec![Vec3::Z; 4],
            indices: vec![0, 1, 2, 0, 2, 3],
            texture_key: "e1u1/floor".to_string(),
        }
    }

    /// Wall filling the x = 100 plane, normals toward -X.
    fn wall_object() -> SourceStaticObject {
        SourceStaticObject {
            vertices: vec![
                Vec3::new(100.0, -200.0, -50.0),
                Vec3::new(100.0, 400.0, -50.0),
                Vec3::new(100.0, 400.0, 200.0),
                Vec3::new(100.0, -200.0, 200.0),
            ],
            normals: vec![Vec3::NEG_X; 4],
            indices: vec![0, 1, 2, 0, 2, 3],
            texture_key: "e1u1/wall".to_string(),
        }
    }

    /// Emissive quad at z = 18 over the middle cluster, normals down.
    fn lamp_object() -> SourceStaticObject {
        SourceStaticObject {
            vertices: vec![
                Vec3::new(80.0, 20.0, 18.0),
                Vec3::new(100.0, 20.0, 18.0),
                Vec3::new(100.0, 40.0, 18.0),
                Vec3::new(80.0, 40.0, 18.0),
            ],
            normals: vec![Vec3::NEG_Z; 4],
            indices: vec![0, 2, 1, 0, 3, 2],
            texture_key: "e1u1/lamp".to_string(),
        }
    }

    fn three_cluster_bsp(objects: Vec<SourceStaticObject>) -> TestBsp {
        TestBsp {
            clusters: vec![
                Aabb::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(60.0, 60.0, 20.0)),
                Aabb::new(Vec3::new(60.0, 0.0, 0.0), Vec3::new(120.0, 60.0, 20.0)),
                Aabb::new(Vec3::new(120.0, 0.0, 0.0), Vec3::new(180.0, 60.0, 20.0)),
            ],
            objects,
        }
    }

    fn scene_with(objects: Vec<SourceStaticObject>, point_lights: Vec<PointLight>) -> Scene {
        Scene {
            static_objects: objects,
            point_lights,
            area_lights: Vec::new(),
            reflectivity: Default::default(),
        }
    }

    use crate::scene::{PointLight, SourceStaticObject};

    #[test]
    fn bake_point_grid_spacing_and_clamping() {
        let bsp = three_cluster_bsp(vec![]);
        let points = generate_cluster_bake_points(&bsp, 1);

        // 60x60x20 box: two layers on x and y, one on z
        assert_eq!(points.len(), 2 * 2 * 1);
        for point in &points {
            assert!(bsp.cluster_aabb(1).contains(*point));
        }
    }

    #[test]
    fn thin_axis_still_gets_one_bake_point_layer() {
        let bsp = TestBsp {
            clusters: vec![Aabb::new(Vec3::ZERO, Vec3::new(100.0, 100.0, 0.0005))],
            objects: vec![],
        };
        let points = generate_cluster_bake_points(&bsp, 0);
        // z is thinner than epsilon, yet contributes exactly one layer
        assert_eq!(points.len(), 2 * 2 * 1);
    }

    #[test]
    fn bake_current_cluster_covers_only_the_camera_cluster() {
        let objects = vec![floor_object()];
        let bsp = three_cluster_bsp(objects.clone());
        let scene = scene_with(
            objects,
            vec![PointLight {
                origin: Vec3::new(90.0, 30.0, 15.0),
                color: Vec3::ONE,
                intensity: 1.0,
                radius: 1.0,
            }],
        );

        let mut baker = LightBaker::new();
        baker.flags.sample_area_lights = false;
        baker.set_bake_position(Vec3::new(90.0, 30.0, 10.0));
        baker.bake(&scene, &bsp).unwrap();

        assert!(baker.is_complete());
        assert_eq!(baker.baked_cluster(), Some(1));

        // Only cluster 1 has probes; the flat array covers exactly its grid
        let expected_points = generate_cluster_bake_points(&bsp, 1).len();
        assert_eq!(baker.total_probes(), expected_points);
        assert_eq!(baker.baked_probes(), expected_points);

        let per_cluster: Vec<usize> =
            baker.cluster_bake_points.iter().map(|points| points.len()).collect();
        assert_eq!(per_cluster.iter().sum::<usize>(), baker.total_probes());
        for (cluster, first) in baker
            .transferable
            .cluster_first_probe_indices
            .iter()
            .enumerate()
        {
            let next = baker
                .transferable
                .cluster_first_probe_indices
                .get(cluster + 1)
                .copied()
                .unwrap_or(baker.total_probes());
            assert_eq!(next - first, per_cluster[cluster]);
        }

        // Every probe has nine coefficients and saw some light
        for probe in &baker.transferable.probes {
            assert_eq!(probe.radiance_sh.len(), 9);
            assert!(probe.radiance_sh[0].x > 0.0, "probe with no gathered light");
        }

        // Completion: the snapshot moves to the renderer, state resets
        let mut host = TestHost::new((640, 480));
        baker.post_bake(&mut host, std::env::temp_dir().as_path());
        assert_eq!(host.consumed.len(), 1);
        assert_eq!(host.consumed[0].probes.len(), expected_points);
        assert!(!baker.is_complete());
        assert_eq!(baker.total_probes(), 0);
        assert_eq!(baker.baked_probes(), 0);
    }

    #[test]
    fn all_clusters_mode_bakes_every_cluster() {
        let objects = vec![floor_object()];
        let bsp = three_cluster_bsp(objects.clone());
        let scene = scene_with(objects, vec![]);

        let mut baker = LightBaker::new();
        baker.flags.sample_area_lights = false;
        baker.set_baking_mode(LightBakingMode::AllClusters);
        baker.bake(&scene, &bsp).unwrap();

        assert!(baker.is_complete());
        assert_eq!(baker.baked_cluster(), None);
        assert_eq!(baker.transferable.cluster_first_probe_indices.len(), 3);

        let expected: usize = (0..3)
            .map(|cluster| generate_cluster_bake_points(&bsp, cluster).len())
            .sum();
        assert_eq!(baker.total_probes(), expected);
    }

    #[test]
    fn occluded_point_light_equals_a_dark_light() {
        let objects = vec![floor_object(), wall_object()];
        let light = PointLight {
            // Behind the wall, as seen from cluster 0
            origin: Vec3::new(150.0, 30.0, 10.0),
            color: Vec3::ONE,
            intensity: 1.0,
            radius: 1.0,
        };

        let bake_with_intensity = |intensity: f32| {
            let bsp = three_cluster_bsp(objects.clone());
            let scene = scene_with(objects.clone(), vec![PointLight { intensity, ..light }]);

            let mut baker = LightBaker::new().with_seed(77);
            baker.flags.sample_area_lights = false;
            baker.set_bake_position(Vec3::new(30.0, 30.0, 10.0));
            baker.bake(&scene, &bsp).unwrap();
            baker.transfer_baking_result()
        };

        let occluded = bake_with_intensity(1.0);
        let dark = bake_with_intensity(0.0);

        assert_eq!(occluded.probes.len(), dark.probes.len());
        for (occluded_probe, dark_probe) in occluded.probes.iter().zip(&dark.probes) {
            for (a, b) in occluded_probe.radiance_sh.iter().zip(&dark_probe.radiance_sh) {
                assert!((*a - *b).abs().max_element() < 1e-6);
            }
        }
    }

    #[test]
    fn bake_round_trip_through_the_text_format() {
        let objects = vec![floor_object(), lamp_object()];
        let mut scene = scene_with(
            objects.clone(),
            vec![PointLight {
                origin: Vec3::new(90.0, 30.0, 15.0),
                color: Vec3::new(1.0, 0.9, 0.8),
                intensity: 0.7,
                radius: 1.0,
            }],
        );
        let mut lamp = AreaLight::new(1, Vec3::new(1.0, 0.8, 0.6));
        lamp.init_distribution(&scene.static_objects[1]);
        scene.area_lights.push(lamp);

        let bsp = three_cluster_bsp(objects);

        let mut baker = LightBaker::new();
        baker.set_bake_position(Vec3::new(90.0, 30.0, 10.0));
        baker.bake(&scene, &bsp).unwrap();
        let baked = baker.transfer_baking_result();

        let text = bakefile::serialize(&baked).unwrap();
        let parsed = bakefile::parse(&bakeresult_grammar(), &text).unwrap();

        assert_eq!(parsed.mode, baked.mode);
        assert_eq!(parsed.baking_cluster, baked.baking_cluster);
        assert_eq!(parsed.probes.len(), baked.probes.len());
        for (parsed_probe, original) in parsed.probes.iter().zip(&baked.probes) {
            for (a, b) in parsed_probe.radiance_sh.iter().zip(&original.radiance_sh) {
                assert!((*a - *b).abs().max_element() < 1e-6);
            }
        }
    }

    #[test]
    fn missing_inputs_are_rejected() {
        let bsp = three_cluster_bsp(vec![]);
        let scene = Scene::default();

        // Current-position mode with no position
        let mut baker = LightBaker::new();
        assert!(matches!(baker.bake(&scene, &bsp), Err(BakeError::InputInvalid(_))));

        // Position outside every cluster
        let mut baker = LightBaker::new();
        baker.set_bake_position(Vec3::new(-500.0, 0.0, 0.0));
        assert!(matches!(baker.bake(&scene, &bsp), Err(BakeError::InputInvalid(_))));

        // All-clusters mode over a clusterless map
        let empty_bsp = TestBsp {
            clusters: vec![],
            objects: vec![],
        };
        let mut baker = LightBaker::new();
        baker.set_baking_mode(LightBakingMode::AllClusters);
        assert!(matches!(
            baker.bake(&scene, &empty_bsp),
            Err(BakeError::InputInvalid(_))
        ));

        // Ray paths can't be saved across all clusters
        let mut baker = LightBaker::new();
        baker.set_baking_mode(LightBakingMode::AllClusters);
        baker.flags.save_ray_path = true;
        assert!(matches!(baker.bake(&scene, &bsp), Err(BakeError::InputInvalid(_))));
    }

    #[test]
    fn saved_results_load_back_as_a_complete_bake() {
        let data = BakingData {
            mode: Some(LightBakingMode::CurrentPositionCluster),
            baking_cluster: Some(2),
            cluster_first_probe_indices: vec![],
            probes: vec![DiffuseProbe::default(); 3],
        };

        let path = std::env::temp_dir().join("strafe_bake_load_test.dat");
        bakefile::save(&path, &data).unwrap();

        let mut baker = LightBaker::new();
        baker
            .load_from_file(&bakeresult_grammar(), &path)
            .unwrap();
        assert!(baker.is_complete());
        assert_eq!(baker.total_probes(), 3);
        assert_eq!(baker.baked_cluster(), Some(2));

        // A missing file fails the load without touching the loaded state
        let missing = std::env::temp_dir().join("strafe_no_such_bake.dat");
        assert!(matches!(
            baker.load_from_file(&bakeresult_grammar(), &missing),
            Err(BakeError::DataIo(_))
        ));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn debug_payloads_follow_the_flags() {
        let objects = vec![floor_object()];
        let bsp = three_cluster_bsp(objects.clone());
        let scene = scene_with(objects, vec![]);

        let mut baker = LightBaker::new();
        baker.flags.sample_area_lights = false;
        baker.flags.save_ray_path = true;
        baker.flags.save_light_sampling = true;
        baker.set_bake_position(Vec3::new(30.0, 30.0, 10.0));
        baker.bake(&scene, &bsp).unwrap();

        for probe in &baker.transferable.probes {
            let segments = probe.path_segments.as_ref().expect("ray path flag ignored");
            assert!(!segments.is_empty());
            let light_samples = probe.light_samples.as_ref().expect("light sampling flag ignored");
            assert_eq!(light_samples.len(), PROBE_SAMPLES_NUM);
        }
    }
}
