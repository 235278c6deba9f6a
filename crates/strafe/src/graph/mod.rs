//! Frame-graph compiler: grammar-driven pass parsing, resource validation,
//! pipeline compilation and graph assembly.
//!
//! Building a frame graph goes through these stages, all driven by
//! [`builder::FrameGraphBuilder`]:
//!
//! 1. every `*.pass` file in the frame-graph directory is read and
//!    preprocessed (`#include` substitution, one level deep),
//! 2. each file is parsed into a [`source::PassParametersSource`],
//! 3. resource declarations are validated across passes,
//! 4. passes are compiled in the order the frame-graph file dictates:
//!    shaders, root signature, input layout, pipeline state, and the lowering
//!    of root parameters into root arguments,
//! 5. the typed passes are assembled into a [`FrameGraph`].
//!
//! A build failure at any stage leaves the previously built graph untouched.

use crate::device::{PipelineId, RootSignatureId, Topology, Viewport};
use crate::pass::Pass;
use thiserror::Error;

pub mod args;
pub mod builder;
pub mod compile;
pub mod grammar;
pub mod parser;
pub mod preprocessor;
pub mod source;
pub mod validate;

use args::RootArg;
use source::{PassInput, VertAttr, PASS_INPUT_COUNT};

/// Everything that can go wrong while building a frame graph.
#[derive(Debug, Error)]
pub enum GraphBuildError {
    #[error("missing configuration input: {0}")]
    ConfigMissing(String),

    #[error("invalid pass source `{file}` at line {line}, column {column}: {message}")]
    InvalidPassSource {
        file: String,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("resource name collision on `{name}`")]
    ResourceNameCollision { name: String },

    #[error("descriptor table entries disagree on scope or bind frequency in pass `{pass}`")]
    DescTableMixedFrequency { pass: String },

    #[error("shader compilation failed in pass `{pass}`: {message}")]
    ShaderCompile { pass: String, message: String },

    #[error("pipeline creation failed in pass `{pass}`: {message}")]
    PipelineCreate { pass: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compiled, bindable state of one pass, shared by all pass variants.
#[derive(Debug, Clone, PartialEq)]
pub struct PassParameters {
    pub name: String,
    pub input: PassInput,
    pub topology: Topology,
    pub color_target_hash: u32,
    pub depth_target_hash: u32,
    pub viewport: Viewport,
    pub vert_attr: VertAttr,
    pub root_signature: RootSignatureId,
    pub pipeline: PipelineId,

    /// Arguments private to the pass, bound once per pass.
    pub pass_local_root_args: Vec<RootArg>,
    /// Template instantiated for every drawn object.
    pub per_object_local_root_args_template: Vec<RootArg>,
    /// Indices into [`FrameGraph::passes_global_res`].
    pub pass_global_root_args_indices: Vec<usize>,
    /// Indices into the per-input-type global template table.
    pub per_obj_global_root_args_indices_template: Vec<usize>,
}

/// Per-input-type pools of global per-object argument templates.
pub type PerObjectGlobalTemplate = [Vec<RootArg>; PASS_INPUT_COUNT];

/// An ordered sequence of compiled passes plus the argument pools shared
/// between them.
#[derive(Debug, Default)]
pub struct FrameGraph {
    pub passes: Vec<Pass>,
    /// Global per-pass arguments, deduplicated across the whole graph.
    pub passes_global_res: Vec<RootArg>,
    /// Global per-object argument templates, keyed by pass input type.
    pub obj_global_res_template: PerObjectGlobalTemplate,
}

impl FrameGraph {
    /// Executes every pass once, in graph order, against one frame's draw
    /// input. Pass-global const buffers are leased from the frame first; they
    /// go stale when the frame retires and are re-leased next time.
    pub fn execute(
        &mut self,
        frame: &mut crate::frame::Frame,
        encoder: &mut dyn crate::device::CommandEncoder,
        input: &crate::pass::FrameDrawInput,
    ) {
        crate::pass::lease_const_buffers(frame, &mut self.passes_global_res);

        let Self {
            passes,
            passes_global_res,
            obj_global_res_template,
        } = self;

        for pass in passes.iter_mut() {
            let mut ctx = crate::pass::JobContext {
                frame: &mut *frame,
                encoder: &mut *encoder,
                passes_global_res,
                obj_global_res_template,
                input,
            };
            pass.execute(&mut ctx);
        }
    }
}
