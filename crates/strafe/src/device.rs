//! Interfaces of the native GPU layer consumed by the core.
//!
//! The driver bindings themselves (device, queues, swap chain, command lists,
//! descriptor heaps) live outside this crate. The frame-graph compiler and the
//! pass runtime only ever talk to these traits, which keeps the whole core
//! testable without a GPU.

use crate::frame::BufferHandle;
use crate::baker::BakingData;
use thiserror::Error;

/// Error reported by the driver layer, forwarded verbatim.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DeviceError(pub String);

/// Compiled shader bytecode, opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBlob {
    pub bytecode: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSignatureId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u64);

/// Primitive topology of a pass. A single token in the pass source selects
/// both the draw-time topology and the pipeline topology kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
    PointList,
}

impl Topology {
    pub fn kind(self) -> TopologyKind {
        match self {
            Topology::TriangleList => TopologyKind::Triangle,
            Topology::PointList => TopologyKind::Point,
        }
    }
}

/// Topology class baked into a pipeline state object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    Triangle,
    Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    SrcAlpha,
    InvSrcAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendState {
    pub enabled: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enabled: false,
            src: BlendFactor::SrcAlpha,
            dst: BlendFactor::InvSrcAlpha,
        }
    }
}

/// Viewport in pixels. Fractional viewport declarations in pass sources are
/// resolved against the current draw area before this is built, which makes a
/// compiled frame graph dependent on the window size it was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub top_left_x: f32,
    pub top_left_y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementFormat {
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Int,
}

/// One entry of a pipeline input layout.
#[derive(Debug, Clone, PartialEq)]
pub struct InputElement {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub format: ElementFormat,
    pub input_slot: u32,
    pub aligned_byte_offset: u32,
}

/// Everything the driver needs to create a graphics pipeline for a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    pub root_signature: RootSignatureId,
    pub vs: Option<ShaderBlob>,
    pub gs: Option<ShaderBlob>,
    pub ps: Option<ShaderBlob>,
    pub input_layout: Vec<InputElement>,
    pub topology_kind: TopologyKind,
    pub blend: BlendState,
    pub depth_write: bool,
    /// Render target names, interned. The driver resolves formats from these.
    pub color_target_hash: u32,
    pub depth_target_hash: u32,
}

/// Build-time driver surface: shader compilation and state object creation.
///
/// `debug_name` arguments follow the `"<kind>, pass: <name>"` convention and
/// must be attached to the created objects.
pub trait Device {
    /// Compiles one shader. `profile` is `<stage>_5_1`. On failure the full
    /// compiler diagnostic comes back in the error.
    fn compile_shader(
        &self,
        name: &str,
        source: &str,
        profile: &str,
    ) -> Result<ShaderBlob, DeviceError>;

    /// Creates a root signature from the signature embedded in a compiled
    /// shader blob.
    fn create_root_signature(
        &self,
        blob: &ShaderBlob,
        debug_name: &str,
    ) -> Result<RootSignatureId, DeviceError>;

    fn create_pipeline_state(
        &self,
        desc: &PipelineDesc,
        debug_name: &str,
    ) -> Result<PipelineId, DeviceError>;
}

/// Frame-time driver surface: command recording for one pass execution.
pub trait CommandEncoder {
    fn set_pipeline(&mut self, pipeline: PipelineId);
    fn set_root_signature(&mut self, root_signature: RootSignatureId);
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_scissor(&mut self, x: u32, y: u32, width: u32, height: u32);
    fn set_targets(&mut self, color_target_hash: u32, depth_target_hash: u32);
    fn set_topology(&mut self, topology: Topology);

    /// Binds an inline CBV root argument.
    fn set_root_const_buffer(&mut self, bind_index: u32, buffer: BufferHandle, offset: u32);
    /// Binds a descriptor table root argument by its heap base index.
    fn set_root_descriptor_table(&mut self, bind_index: u32, heap_base: u32);

    fn set_vertex_buffer(&mut self, buffer: BufferHandle, offset: u32, stride: u32, size: u32);

    /// Streams CPU data into a leased buffer region.
    fn update_buffer(&mut self, buffer: BufferHandle, offset: u32, data: &[u8]);

    fn draw(&mut self, vertex_count: u32, start_vertex: u32);
}

/// The enclosing renderer, as seen from the core.
pub trait RendererHost {
    /// Blocks until every in-flight frame has fence-completed. Called before a
    /// frame graph rebuild so no GPU work references the old graph.
    fn flush_all_frames(&mut self);

    /// Hands a finished bake over to the renderer's indirect-diffuse lookup.
    fn consume_diffuse_indirect_lighting(&mut self, data: BakingData);

    /// Current draw area in pixels, used to resolve fractional viewports.
    fn draw_area_size(&self) -> (u32, u32);
}
