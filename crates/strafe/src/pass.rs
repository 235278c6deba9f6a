//! Per-frame pass execution.
//!
//! Every pass runs the same four stages once per frame:
//!
//! 1. *start* — lease frame memory, transition targets,
//! 2. *update draw objects* — instantiate the per-object argument templates
//!    for this frame's draw calls and stream their data into the arenas,
//! 3. *set up render state* — bind PSO, viewport, scissor, targets and the
//!    pass-scoped root arguments,
//! 4. *draw* — per object: bind its arguments, issue the draw.
//!
//! Within a pass, objects draw in draw-call-list order; passes themselves run
//! in frame-graph order on the main thread.

use crate::device::CommandEncoder;
use crate::frame::{BufferHandle, Frame};
use crate::graph::args::{ConstBufferViewArg, RootArg};
use crate::graph::{PassParameters, PerObjectGlobalTemplate};
use glam::{Mat4, Vec3};
use log::*;
use strafe_utils::{fnv1a_hash, pack_floats};

// Const-buffer fields the runtime knows how to stream.
const FIELD_POSITION: u32 = fnv1a_hash(b"position");
const FIELD_SCALE: u32 = fnv1a_hash(b"scale");
const FIELD_MODEL: u32 = fnv1a_hash(b"model");

/// One UI quad: screen position, scale, and the texture to sample.
#[derive(Debug, Clone)]
pub struct UiDrawCall {
    pub position: Vec3,
    pub scale: Vec3,
    pub texture_hash: u32,
}

/// A static map surface, drawn from its persistent vertex buffer.
#[derive(Debug, Clone)]
pub struct StaticDrawCall {
    pub object_index: usize,
    pub vertex_buffer: BufferHandle,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub model: Mat4,
}

/// An animated entity; the interpolated mesh is uploaded by the model
/// streaming path, the pass only positions and draws it.
#[derive(Debug, Clone)]
pub struct DynamicDrawCall {
    pub vertex_buffer: BufferHandle,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub model: Mat4,
}

#[derive(Debug, Clone, Copy)]
pub struct ParticleDrawCall {
    pub origin: Vec3,
    pub color: Vec3,
}

/// All draw-call streams of one frame, routed to passes by input type.
#[derive(Debug, Default)]
pub struct FrameDrawInput {
    pub ui: Vec<UiDrawCall>,
    pub statics: Vec<StaticDrawCall>,
    pub dynamics: Vec<DynamicDrawCall>,
    pub particles: Vec<ParticleDrawCall>,
}

/// Everything one pass execution needs from the outside.
pub struct JobContext<'a> {
    pub frame: &'a mut Frame,
    pub encoder: &'a mut dyn CommandEncoder,
    pub passes_global_res: &'a [RootArg],
    pub obj_global_res_template: &'a PerObjectGlobalTemplate,
    pub input: &'a FrameDrawInput,
}

/// A compiled pass, tagged by the input type it consumes. Closed set.
#[derive(Debug)]
pub enum Pass {
    Ui(UiPass),
    Static(StaticPass),
    Dynamic(DynamicPass),
    Particles(ParticlesPass),
}

impl Pass {
    /// Emplaces the right pass variant for the parameters' input type.
    pub fn from_parameters(parameters: PassParameters) -> Pass {
        use crate::graph::source::PassInput;
        match parameters.input {
            PassInput::Ui => Pass::Ui(UiPass::init(parameters)),
            PassInput::Static => Pass::Static(StaticPass::init(parameters)),
            PassInput::Dynamic => Pass::Dynamic(DynamicPass::init(parameters)),
            PassInput::Particles => Pass::Particles(ParticlesPass::init(parameters)),
        }
    }

    pub fn parameters(&self) -> &PassParameters {
        match self {
            Pass::Ui(pass) => &pass.parameters,
            Pass::Static(pass) => &pass.parameters,
            Pass::Dynamic(pass) => &pass.parameters,
            Pass::Particles(pass) => &pass.parameters,
        }
    }

    pub fn execute(&mut self, ctx: &mut JobContext) {
        match self {
            Pass::Ui(pass) => pass.execute(ctx),
            Pass::Static(pass) => pass.execute(ctx),
            Pass::Dynamic(pass) => pass.execute(ctx),
            Pass::Particles(pass) => pass.execute(ctx),
        }
    }
}

impl PartialEq for Pass {
    /// Structural comparison of the compiled state; transient per-frame data
    /// doesn't participate. Used by rebuild idempotence checks.
    fn eq(&self, other: &Self) -> bool {
        self.parameters() == other.parameters()
    }
}

/// Per-object state instantiated from the argument templates each frame.
#[derive(Debug)]
struct DrawObject {
    root_args: Vec<RootArg>,
    global_root_args: Vec<RootArg>,
}

// --- Shared stage helpers

/// Leases const-buffer memory for every CBV argument in `args` that is
/// unbound, or whose lease went stale with a retired frame.
pub(crate) fn lease_const_buffers(frame: &mut Frame, args: &mut [RootArg]) {
    for arg in args.iter_mut() {
        match arg {
            RootArg::ConstBufferView(view) => {
                let stale = view.buffer.map_or(true, |buffer| !frame.const_buffers.is_valid(buffer));
                if stale {
                    view.buffer = Some(frame.const_buffers.allocate(view.byte_size()));
                }
            }
            RootArg::DescTable(table) => {
                for entity in &mut table.entities {
                    if let crate::graph::args::DescTableEntity::ConstBufferView {
                        fields,
                        buffer,
                        ..
                    } = entity
                    {
                        let stale =
                            buffer.map_or(true, |handle| !frame.const_buffers.is_valid(handle));
                        if stale {
                            let size = fields.iter().map(|field| field.size).sum();
                            *buffer = Some(frame.const_buffers.allocate(size));
                        }
                    }
                }
            }
        }
    }
}

/// Streams field data into a bound const-buffer view. Fields the provider
/// doesn't know are zero-filled.
fn update_const_buffer_view(
    frame: &Frame,
    encoder: &mut dyn CommandEncoder,
    view: &ConstBufferViewArg,
    mut provide: impl FnMut(u32) -> Option<Vec<f32>>,
) {
    let buffer = match view.buffer {
        Some(buffer) => buffer,
        None => {
            debug_assert!(false, "updating an unbound const buffer view");
            return;
        }
    };

    let mut staging = Vec::with_capacity(view.byte_size() as usize);
    for field in &view.fields {
        match provide(field.name_hash) {
            Some(values) => {
                let bytes = pack_floats(&values);
                debug_assert_eq!(bytes.len(), field.size as usize, "field data size mismatch");
                staging.extend_from_slice(&bytes);
            }
            None => staging.extend(std::iter::repeat(0u8).take(field.size as usize)),
        }
    }

    encoder.update_buffer(buffer, frame.const_buffers.offset(buffer), &staging);
}

/// Binds a set of root arguments at their bind indices.
fn bind_root_args(frame: &Frame, encoder: &mut dyn CommandEncoder, args: &[RootArg]) {
    for arg in args {
        match arg {
            RootArg::ConstBufferView(view) => match view.buffer {
                Some(buffer) => encoder.set_root_const_buffer(
                    view.bind_index,
                    buffer,
                    frame.const_buffers.offset(buffer),
                ),
                None => debug_assert!(false, "binding an unbound const buffer view"),
            },
            RootArg::DescTable(table) => match table.heap_base {
                Some(heap_base) => encoder.set_root_descriptor_table(table.bind_index, heap_base),
                // Descriptor allocation happens in the texture registry;
                // a table with no descriptors yet simply isn't bound.
                None => trace!("descriptor table {} not resolved, skipping bind", table.bind_index),
            },
        }
    }
}

fn set_up_render_state(
    parameters: &PassParameters,
    frame: &Frame,
    encoder: &mut dyn CommandEncoder,
    pass_local: &[RootArg],
    pass_global_indices: &[usize],
    passes_global_res: &[RootArg],
) {
    encoder.set_pipeline(parameters.pipeline);
    encoder.set_root_signature(parameters.root_signature);
    encoder.set_topology(parameters.topology);
    encoder.set_viewport(parameters.viewport);
    encoder.set_scissor(
        parameters.viewport.top_left_x as u32,
        parameters.viewport.top_left_y as u32,
        parameters.viewport.width as u32,
        parameters.viewport.height as u32,
    );
    encoder.set_targets(parameters.color_target_hash, parameters.depth_target_hash);

    bind_root_args(frame, encoder, pass_local);
    for &index in pass_global_indices {
        bind_root_args(frame, encoder, std::slice::from_ref(&passes_global_res[index]));
    }
}

/// Instantiates this pass's per-object templates for one object.
fn instantiate_object(
    parameters: &PassParameters,
    obj_global_template: &PerObjectGlobalTemplate,
) -> DrawObject {
    let global_pool = &obj_global_template[parameters.input.index()];
    DrawObject {
        root_args: parameters.per_object_local_root_args_template.clone(),
        global_root_args: parameters
            .per_obj_global_root_args_indices_template
            .iter()
            .map(|&index| global_pool[index].clone())
            .collect(),
    }
}

fn vertex_stride(parameters: &PassParameters) -> u32 {
    parameters
        .vert_attr
        .fields
        .iter()
        .map(|field| field.ty.size())
        .sum()
}

// --- UI

/// Streams textured screen-space quads.
#[derive(Debug)]
pub struct UiPass {
    pub parameters: PassParameters,
    draw_objects: Vec<DrawObject>,
    vertex_memory: Option<BufferHandle>,
}

impl UiPass {
    fn init(parameters: PassParameters) -> Self {
        Self {
            parameters,
            draw_objects: Vec::new(),
            vertex_memory: None,
        }
    }

    pub fn execute(&mut self, ctx: &mut JobContext) {
        self.start(ctx);
        self.update_draw_objects(ctx);
        set_up_render_state(
            &self.parameters,
            ctx.frame,
            ctx.encoder,
            &self.parameters.pass_local_root_args,
            &self.parameters.pass_global_root_args_indices,
            ctx.passes_global_res,
        );
        self.draw(ctx);
    }

    fn start(&mut self, ctx: &mut JobContext) {
        self.draw_objects.clear();
        self.vertex_memory = None;

        lease_const_buffers(ctx.frame, &mut self.parameters.pass_local_root_args);

        let stride = vertex_stride(&self.parameters);
        let quad_bytes = stride * 6;
        if !ctx.input.ui.is_empty() {
            self.vertex_memory = Some(
                ctx.frame
                    .streaming_vertices
                    .allocate(quad_bytes * ctx.input.ui.len() as u32),
            );
        }
    }

    fn update_draw_objects(&mut self, ctx: &mut JobContext) {
        let stride = vertex_stride(&self.parameters);

        for (object_index, call) in ctx.input.ui.iter().enumerate() {
            let mut object = instantiate_object(&self.parameters, ctx.obj_global_res_template);
            lease_const_buffers(ctx.frame, &mut object.root_args);
            lease_const_buffers(ctx.frame, &mut object.global_root_args);

            for arg in object.root_args.iter().chain(&object.global_root_args) {
                if let RootArg::ConstBufferView(view) = arg {
                    update_const_buffer_view(ctx.frame, ctx.encoder, view, |field| {
                        if field == FIELD_POSITION {
                            Some(vec![call.position.x, call.position.y, call.position.z, 1.0])
                        } else if field == FIELD_SCALE {
                            Some(vec![call.scale.x, call.scale.y, call.scale.z, 0.0])
                        } else {
                            None
                        }
                    });
                }
            }

            // A unit quad per object; position and scale live in the
            // per-object const buffer
            if let Some(vertex_memory) = self.vertex_memory {
                let quad = unit_quad_vertices(&self.parameters);
                let offset = ctx.frame.streaming_vertices.offset(vertex_memory)
                    + stride * 6 * object_index as u32;
                ctx.encoder.update_buffer(vertex_memory, offset, &quad);
            }

            self.draw_objects.push(object);
        }
    }

    fn draw(&mut self, ctx: &mut JobContext) {
        let stride = vertex_stride(&self.parameters);
        let Some(vertex_memory) = self.vertex_memory else {
            return;
        };

        for (object_index, object) in self.draw_objects.iter().enumerate() {
            bind_root_args(ctx.frame, ctx.encoder, &object.root_args);
            bind_root_args(ctx.frame, ctx.encoder, &object.global_root_args);

            ctx.encoder.set_vertex_buffer(
                vertex_memory,
                ctx.frame.streaming_vertices.offset(vertex_memory)
                    + stride * 6 * object_index as u32,
                stride,
                stride * 6,
            );
            ctx.encoder.draw(6, 0);
        }
    }
}

/// Unit quad matching the pass's vertex layout: two triangles, packed field
/// by field in declaration order.
fn unit_quad_vertices(parameters: &PassParameters) -> Vec<u8> {
    const CORNERS: [(f32, f32); 6] = [
        (0.0, 0.0),
        (1.0, 0.0),
        (1.0, 1.0),
        (1.0, 1.0),
        (0.0, 1.0),
        (0.0, 0.0),
    ];

    let mut floats = Vec::new();
    for (x, y) in CORNERS {
        for field in &parameters.vert_attr.fields {
            match field.ty.size() / 4 {
                4 => floats.extend_from_slice(&[x, y, 0.0, 1.0]),
                2 => floats.extend_from_slice(&[x, 1.0 - y]),
                count => floats.extend(std::iter::repeat(0.0).take(count as usize)),
            }
        }
    }
    pack_floats(&floats)
}

// --- Static

/// Draws world surfaces from their persistent buffers.
#[derive(Debug)]
pub struct StaticPass {
    pub parameters: PassParameters,
    draw_objects: Vec<DrawObject>,
}

impl StaticPass {
    fn init(parameters: PassParameters) -> Self {
        Self {
            parameters,
            draw_objects: Vec::new(),
        }
    }

    pub fn execute(&mut self, ctx: &mut JobContext) {
        self.draw_objects.clear();
        lease_const_buffers(ctx.frame, &mut self.parameters.pass_local_root_args);

        for call in &ctx.input.statics {
            let mut object = instantiate_object(&self.parameters, ctx.obj_global_res_template);
            lease_const_buffers(ctx.frame, &mut object.root_args);
            lease_const_buffers(ctx.frame, &mut object.global_root_args);
            stream_model_matrix(ctx, &object, call.model);
            self.draw_objects.push(object);
        }

        set_up_render_state(
            &self.parameters,
            ctx.frame,
            ctx.encoder,
            &self.parameters.pass_local_root_args,
            &self.parameters.pass_global_root_args_indices,
            ctx.passes_global_res,
        );

        for (object, call) in self.draw_objects.iter().zip(&ctx.input.statics) {
            bind_root_args(ctx.frame, ctx.encoder, &object.root_args);
            bind_root_args(ctx.frame, ctx.encoder, &object.global_root_args);
            ctx.encoder.set_vertex_buffer(
                call.vertex_buffer,
                0,
                call.vertex_stride,
                call.vertex_stride * call.vertex_count,
            );
            ctx.encoder.draw(call.vertex_count, 0);
        }
    }
}

// --- Dynamic

/// Draws animated entities; identical flow to the static pass, but the
/// per-object data comes from the entity stream.
#[derive(Debug)]
pub struct DynamicPass {
    pub parameters: PassParameters,
    draw_objects: Vec<DrawObject>,
}

impl DynamicPass {
    fn init(parameters: PassParameters) -> Self {
        Self {
            parameters,
            draw_objects: Vec::new(),
        }
    }

    pub fn execute(&mut self, ctx: &mut JobContext) {
        self.draw_objects.clear();
        lease_const_buffers(ctx.frame, &mut self.parameters.pass_local_root_args);

        for call in &ctx.input.dynamics {
            let mut object = instantiate_object(&self.parameters, ctx.obj_global_res_template);
            lease_const_buffers(ctx.frame, &mut object.root_args);
            lease_const_buffers(ctx.frame, &mut object.global_root_args);
            stream_model_matrix(ctx, &object, call.model);
            self.draw_objects.push(object);
        }

        set_up_render_state(
            &self.parameters,
            ctx.frame,
            ctx.encoder,
            &self.parameters.pass_local_root_args,
            &self.parameters.pass_global_root_args_indices,
            ctx.passes_global_res,
        );

        for (object, call) in self.draw_objects.iter().zip(&ctx.input.dynamics) {
            bind_root_args(ctx.frame, ctx.encoder, &object.root_args);
            bind_root_args(ctx.frame, ctx.encoder, &object.global_root_args);
            ctx.encoder.set_vertex_buffer(
                call.vertex_buffer,
                0,
                call.vertex_stride,
                call.vertex_stride * call.vertex_count,
            );
            ctx.encoder.draw(call.vertex_count, 0);
        }
    }
}

fn stream_model_matrix(ctx: &mut JobContext, object: &DrawObject, model: Mat4) {
    for arg in object.root_args.iter().chain(&object.global_root_args) {
        if let RootArg::ConstBufferView(view) = arg {
            update_const_buffer_view(ctx.frame, ctx.encoder, view, |field| {
                (field == FIELD_MODEL).then(|| model.to_cols_array().to_vec())
            });
        }
    }
}

// --- Particles

/// Streams every live particle as one point-list draw.
#[derive(Debug)]
pub struct ParticlesPass {
    pub parameters: PassParameters,
    vertex_memory: Option<BufferHandle>,
}

impl ParticlesPass {
    fn init(parameters: PassParameters) -> Self {
        Self {
            parameters,
            vertex_memory: None,
        }
    }

    pub fn execute(&mut self, ctx: &mut JobContext) {
        self.vertex_memory = None;

        let particles = &ctx.input.particles;
        if particles.is_empty() {
            return;
        }

        lease_const_buffers(ctx.frame, &mut self.parameters.pass_local_root_args);

        let stride = vertex_stride(&self.parameters);
        let memory = ctx
            .frame
            .streaming_vertices
            .allocate(stride * particles.len() as u32);

        let mut floats = Vec::with_capacity(particles.len() * 6);
        for particle in particles {
            floats.extend_from_slice(&[
                particle.origin.x,
                particle.origin.y,
                particle.origin.z,
                1.0,
            ]);
            floats.extend_from_slice(&[particle.color.x, particle.color.y, particle.color.z, 1.0]);
        }
        let offset = ctx.frame.streaming_vertices.offset(memory);
        ctx.encoder.update_buffer(memory, offset, &pack_floats(&floats));
        self.vertex_memory = Some(memory);

        set_up_render_state(
            &self.parameters,
            ctx.frame,
            ctx.encoder,
            &self.parameters.pass_local_root_args,
            &self.parameters.pass_global_root_args_indices,
            ctx.passes_global_res,
        );

        ctx.encoder
            .set_vertex_buffer(memory, offset, stride, stride * particles.len() as u32);
        ctx.encoder.draw(particles.len() as u32, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::compile::compile_pass_parameters;
    use crate::graph::parser::parse_pass_source;
    use crate::graph::PerObjectGlobalTemplate;
    use crate::test_support::{pass_grammar, RecordedCommand, TestDevice, TestEncoder};

    const UI_PASS: &str = r#"
input : UI
vertAttr : UiVertex

State
{
    ColorTarget : BACK_BUFFER
    DepthTarget : DEPTH_BACK_BUFFER
    Viewport : 0, 0, 1.0, 1.0
    Topology : Triangle
}

RootSig : CBV(b0), CBV(b1)

Resource <Global, PerPass> cbuffer FrameColor : register(b0)
{
    float4 color;
}

Resource <Local, PerObject> cbuffer UiObject : register(b1)
{
    float4 position;
    float4 scale;
}

struct UiVertex
{
    float4 position : POSITION;
    float2 uv : TEXCOORD;
}

shader : Vs
external : FrameColor, UiObject, UiVertex
<[
void main() {}
]>
"#;

    fn build_ui_pass() -> (Pass, Vec<RootArg>, PerObjectGlobalTemplate) {
        let device = TestDevice::default();
        let mut passes_global = Vec::new();
        let mut obj_global = PerObjectGlobalTemplate::default();

        let source = parse_pass_source(&pass_grammar(), "ui", UI_PASS, (640, 480)).unwrap();
        let parameters =
            compile_pass_parameters(&device, source, &mut passes_global, &mut obj_global).unwrap();

        (Pass::from_parameters(parameters), passes_global, obj_global)
    }

    #[test]
    fn ui_pass_draws_objects_in_order() {
        let (mut pass, mut passes_global, obj_global) = build_ui_pass();
        let mut frame = Frame::new();
        let mut encoder = TestEncoder::default();

        // The pass-global CBV has to be leased before execution
        lease_const_buffers(&mut frame, &mut passes_global);

        let input = FrameDrawInput {
            ui: vec![
                UiDrawCall {
                    position: Vec3::new(10.0, 20.0, 0.0),
                    scale: Vec3::ONE,
                    texture_hash: 1,
                },
                UiDrawCall {
                    position: Vec3::new(30.0, 40.0, 0.0),
                    scale: Vec3::ONE,
                    texture_hash: 2,
                },
            ],
            ..Default::default()
        };

        let mut ctx = JobContext {
            frame: &mut frame,
            encoder: &mut encoder,
            passes_global_res: &passes_global,
            obj_global_res_template: &obj_global,
            input: &input,
        };
        pass.execute(&mut ctx);

        let commands = encoder.commands();

        // Pipeline state is bound before any draw
        let pipeline_at = commands
            .iter()
            .position(|cmd| matches!(cmd, RecordedCommand::SetPipeline(_)))
            .unwrap();
        let draws: Vec<usize> = commands
            .iter()
            .enumerate()
            .filter(|(_, cmd)| matches!(cmd, RecordedCommand::Draw { .. }))
            .map(|(index, _)| index)
            .collect();
        assert_eq!(draws.len(), 2);
        assert!(pipeline_at < draws[0]);

        // Both objects leased distinct const-buffer regions
        assert!(frame.const_buffers.allocated_bytes() >= 2 * 32);

        // Two quads streamed back to back
        let uploads: Vec<&RecordedCommand> = commands
            .iter()
            .filter(|cmd| matches!(cmd, RecordedCommand::UpdateBuffer { .. }))
            .collect();
        assert!(uploads.len() >= 4, "expected const + vertex uploads, got {}", uploads.len());
    }

    #[test]
    fn empty_input_issues_no_draws() {
        let (mut pass, mut passes_global, obj_global) = build_ui_pass();
        let mut frame = Frame::new();
        let mut encoder = TestEncoder::default();
        let input = FrameDrawInput::default();

        lease_const_buffers(&mut frame, &mut passes_global);

        let mut ctx = JobContext {
            frame: &mut frame,
            encoder: &mut encoder,
            passes_global_res: &passes_global,
            obj_global_res_template: &obj_global,
            input: &input,
        };
        pass.execute(&mut ctx);

        assert!(!encoder
            .commands()
            .iter()
            .any(|cmd| matches!(cmd, RecordedCommand::Draw { .. })));
    }
}
