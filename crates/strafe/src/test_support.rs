//! Shared fixtures: a recording device/encoder pair, a renderer host stub,
//! and a brute-force BSP over triangle soups. Everything the core consumes
//! through collaborator traits has a deterministic stand-in here.

use crate::baker::BakingData;
use crate::config::GraphConfig;
use crate::device::*;
use crate::frame::BufferHandle;
use crate::graph::builder::load_grammar_file;
use crate::graph::grammar::Grammar;
use crate::scene::{BspNode, BspTree, Ray, RayHit, SourceStaticObject};
use glam::Vec3;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use strafe_utils::math::Aabb;

pub fn assets_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../assets")
}

pub fn grammar_dir() -> PathBuf {
    assets_dir().join("grammar")
}

pub fn test_config() -> GraphConfig {
    GraphConfig {
        grammar_dir: grammar_dir(),
        framegraph_dir: assets_dir().join("framegraph"),
        data_dir: std::env::temp_dir(),
    }
}

pub fn pass_grammar() -> Grammar {
    load_grammar_file(grammar_dir().join(crate::config::GRAMMAR_PASS_FILENAME)).unwrap()
}

pub fn framegraph_grammar() -> Grammar {
    load_grammar_file(grammar_dir().join(crate::config::GRAMMAR_FRAMEGRAPH_FILENAME)).unwrap()
}

pub fn bakeresult_grammar() -> Grammar {
    load_grammar_file(grammar_dir().join(crate::config::GRAMMAR_BAKE_RESULT_FILENAME)).unwrap()
}

// --- Device

/// Records every driver call; "compiles" shaders by wrapping their source.
#[derive(Default)]
pub struct TestDevice {
    next_id: AtomicU64,
    shaders: Mutex<Vec<(String, String, String)>>,
    debug_names: Mutex<Vec<String>>,
}

impl TestDevice {
    /// (name, source, profile) triples, in compilation order.
    pub fn compiled_shaders(&self) -> Vec<(String, String, String)> {
        self.shaders.lock().clone()
    }

    pub fn debug_names(&self) -> Vec<String> {
        self.debug_names.lock().clone()
    }
}

impl Device for TestDevice {
    fn compile_shader(
        &self,
        name: &str,
        source: &str,
        profile: &str,
    ) -> Result<ShaderBlob, DeviceError> {
        if source.contains("#error") {
            return Err(DeviceError(format!("{name}: forced compile error")));
        }
        self.shaders
            .lock()
            .push((name.to_string(), source.to_string(), profile.to_string()));
        Ok(ShaderBlob {
            bytecode: source.as_bytes().to_vec(),
        })
    }

    fn create_root_signature(
        &self,
        _blob: &ShaderBlob,
        debug_name: &str,
    ) -> Result<RootSignatureId, DeviceError> {
        self.debug_names.lock().push(debug_name.to_string());
        Ok(RootSignatureId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn create_pipeline_state(
        &self,
        _desc: &PipelineDesc,
        debug_name: &str,
    ) -> Result<PipelineId, DeviceError> {
        self.debug_names.lock().push(debug_name.to_string());
        Ok(PipelineId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }
}

// --- Encoder

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    SetPipeline(PipelineId),
    SetRootSignature(RootSignatureId),
    SetViewport(Viewport),
    SetScissor(u32, u32, u32, u32),
    SetTargets(u32, u32),
    SetTopology(Topology),
    SetRootConstBuffer { bind_index: u32, offset: u32 },
    SetRootDescriptorTable { bind_index: u32, heap_base: u32 },
    SetVertexBuffer { offset: u32, stride: u32, size: u32 },
    UpdateBuffer { offset: u32, bytes: usize },
    Draw { vertex_count: u32, start_vertex: u32 },
}

#[derive(Default)]
pub struct TestEncoder {
    commands: Vec<RecordedCommand>,
}

impl TestEncoder {
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }
}

impl CommandEncoder for TestEncoder {
    fn set_pipeline(&mut self, pipeline: PipelineId) {
        self.commands.push(RecordedCommand::SetPipeline(pipeline));
    }

    fn set_root_signature(&mut self, root_signature: RootSignatureId) {
        self.commands.push(RecordedCommand::SetRootSignature(root_signature));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(RecordedCommand::SetViewport(viewport));
    }

    fn set_scissor(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.commands.push(RecordedCommand::SetScissor(x, y, width, height));
    }

    fn set_targets(&mut self, color_target_hash: u32, depth_target_hash: u32) {
        self.commands
            .push(RecordedCommand::SetTargets(color_target_hash, depth_target_hash));
    }

    fn set_topology(&mut self, topology: Topology) {
        self.commands.push(RecordedCommand::SetTopology(topology));
    }

    fn set_root_const_buffer(&mut self, bind_index: u32, _buffer: BufferHandle, offset: u32) {
        self.commands
            .push(RecordedCommand::SetRootConstBuffer { bind_index, offset });
    }

    fn set_root_descriptor_table(&mut self, bind_index: u32, heap_base: u32) {
        self.commands
            .push(RecordedCommand::SetRootDescriptorTable { bind_index, heap_base });
    }

    fn set_vertex_buffer(&mut self, _buffer: BufferHandle, offset: u32, stride: u32, size: u32) {
        self.commands
            .push(RecordedCommand::SetVertexBuffer { offset, stride, size });
    }

    fn update_buffer(&mut self, _buffer: BufferHandle, offset: u32, data: &[u8]) {
        self.commands.push(RecordedCommand::UpdateBuffer {
            offset,
            bytes: data.len(),
        });
    }

    fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        self.commands.push(RecordedCommand::Draw {
            vertex_count,
            start_vertex,
        });
    }
}

// --- Renderer host

pub struct TestHost {
    pub flushed_frames: usize,
    pub consumed: Vec<BakingData>,
    pub draw_area: (u32, u32),
}

impl TestHost {
    pub fn new(draw_area: (u32, u32)) -> Self {
        Self {
            flushed_frames: 0,
            consumed: Vec::new(),
            draw_area,
        }
    }
}

impl RendererHost for TestHost {
    fn flush_all_frames(&mut self) {
        self.flushed_frames += 1;
    }

    fn consume_diffuse_indirect_lighting(&mut self, data: BakingData) {
        self.consumed.push(data);
    }

    fn draw_area_size(&self) -> (u32, u32) {
        self.draw_area
    }
}

// --- BSP

/// Brute-force BSP stand-in: clusters are boxes, visibility and closest-hit
/// queries walk every triangle of every object.
pub struct TestBsp {
    pub clusters: Vec<Aabb>,
    pub objects: Vec<SourceStaticObject>,
}

impl TestBsp {
    const EPSILON: f32 = 1e-4;

    fn intersect_triangle(ray: &Ray, v0: Vec3, v1: Vec3, v2: Vec3) -> Option<(f32, f32, f32)> {
        let edge1 = v1 - v0;
        let edge2 = v2 - v0;
        let h = ray.direction.cross(edge2);
        let det = edge1.dot(h);
        if det.abs() < 1e-8 {
            return None;
        }

        let inv_det = 1.0 / det;
        let s = ray.origin - v0;
        let u = s.dot(h) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }

        let q = s.cross(edge1);
        let v = ray.direction.dot(q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }

        let t = edge2.dot(q) * inv_det;
        (t > Self::EPSILON).then_some((t, u, v))
    }
}

impl BspTree for TestBsp {
    fn clusters_set(&self) -> BTreeSet<u32> {
        (0..self.clusters.len() as u32).collect()
    }

    fn cluster_aabb(&self, cluster: u32) -> Aabb {
        self.clusters[cluster as usize]
    }

    fn node_with_point(&self, point: Vec3) -> BspNode {
        let cluster = self
            .clusters
            .iter()
            .position(|aabb| aabb.contains(point))
            .map(|index| index as u32);
        BspNode { cluster }
    }

    fn is_point_visible_from_other_point(&self, from: Vec3, to: Vec3) -> bool {
        let distance = (to - from).length();
        if distance < Self::EPSILON {
            return true;
        }
        let ray = Ray {
            origin: from,
            direction: (to - from) / distance,
        };
        match self.find_closest_ray_intersection(ray) {
            Some(hit) => hit.t >= distance - 2.0 * Self::EPSILON,
            None => true,
        }
    }

    fn potentially_visible_objects(&self, _point: Vec3) -> Vec<usize> {
        (0..self.objects.len()).collect()
    }

    fn find_closest_ray_intersection(&self, ray: Ray) -> Option<RayHit> {
        let mut closest: Option<RayHit> = None;

        for (object_index, object) in self.objects.iter().enumerate() {
            for triangle in 0..object.triangle_count() {
                let [v0, v1, v2] = object.triangle_vertices(triangle);
                if let Some((t, u, v)) = Self::intersect_triangle(&ray, v0, v1, v2) {
                    if closest.as_ref().map_or(true, |hit| t < hit.t) {
                        // Store weights of v0, v1, v2 in that order
                        closest = Some(RayHit {
                            t,
                            u: 1.0 - u - v,
                            v: u,
                            w: v,
                            static_object_index: object_index,
                            triangle_index: triangle,
                        });
                    }
                }
            }
        }

        closest
    }
}
