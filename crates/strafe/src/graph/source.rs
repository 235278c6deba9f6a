//! Parsed pass source data model.
//!
//! Everything in here is produced by the parsing front-end and consumed by
//! validation and the pipeline compiler. Parameter sources live from parse
//! until their pass is compiled, at which point they are consumed by move.

use crate::device::{BlendState, ElementFormat, Topology, Viewport};
use strafe_utils::fnv1a_hash;

/// Which draw-call stream a pass consumes. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassInput {
    Ui,
    Static,
    Dynamic,
    Particles,
}

pub const PASS_INPUT_COUNT: usize = 4;

impl PassInput {
    pub const ALL: [PassInput; PASS_INPUT_COUNT] = [
        PassInput::Ui,
        PassInput::Static,
        PassInput::Dynamic,
        PassInput::Particles,
    ];

    /// Index into per-input-type tables.
    pub fn index(self) -> usize {
        match self {
            PassInput::Ui => 0,
            PassInput::Static => 1,
            PassInput::Dynamic => 2,
            PassInput::Particles => 3,
        }
    }
}

/// Whether a resource is private to its pass or shared across the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
    Local,
    Global,
}

/// How often a resource's binding changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindFrequency {
    PerObject,
    PerPass,
}

/// Data types admitted in const-buffer fields and vertex attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float4x4,
    Float4,
    Float2,
    Float,
    Int,
}

impl DataType {
    pub fn size(self) -> u32 {
        match self {
            DataType::Float4x4 => 64,
            DataType::Float4 => 16,
            DataType::Float2 => 8,
            DataType::Float => 4,
            DataType::Int => 4,
        }
    }

    /// Vertex element format; matrices can't feed the input assembler.
    pub fn element_format(self) -> Option<ElementFormat> {
        match self {
            DataType::Float4x4 => None,
            DataType::Float4 => Some(ElementFormat::Rgba32Float),
            DataType::Float2 => Some(ElementFormat::Rg32Float),
            DataType::Float => Some(ElementFormat::R32Float),
            DataType::Int => Some(ElementFormat::R32Int),
        }
    }
}

/// One field of a const buffer: size plus interned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstBufferField {
    pub size: u32,
    pub name_hash: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertAttrField {
    pub ty: DataType,
    pub name_hash: u32,
    pub semantic_name: String,
    pub semantic_index: u32,
    pub name: String,
}

/// A named vertex-attribute declaration, reusable across shaders.
#[derive(Debug, Clone, PartialEq)]
pub struct VertAttr {
    pub name: String,
    pub fields: Vec<VertAttrField>,
    /// Declaration text as written, for shader injection.
    pub raw: String,
}

/// A free function declaration, reusable across shaders via `external`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstBufferDecl {
    pub name: String,
    pub register_id: u32,
    pub fields: Vec<ConstBufferField>,
    pub raw: String,
    pub scope: ResourceScope,
    pub bind: BindFrequency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDecl {
    pub name: String,
    pub register_id: u32,
    pub raw: String,
    pub scope: ResourceScope,
    pub bind: BindFrequency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerDecl {
    pub name: String,
    pub register_id: u32,
    pub raw: String,
    pub scope: ResourceScope,
    pub bind: BindFrequency,
}

/// A resource declared by a pass. Closed sum, dispatched exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceDecl {
    ConstBuffer(ConstBufferDecl),
    Texture(TextureDecl),
    Sampler(SamplerDecl),
}

impl ResourceDecl {
    pub fn name(&self) -> &str {
        match self {
            ResourceDecl::ConstBuffer(decl) => &decl.name,
            ResourceDecl::Texture(decl) => &decl.name,
            ResourceDecl::Sampler(decl) => &decl.name,
        }
    }

    pub fn name_hash(&self) -> u32 {
        fnv1a_hash(self.name().as_bytes())
    }

    pub fn register_id(&self) -> u32 {
        match self {
            ResourceDecl::ConstBuffer(decl) => decl.register_id,
            ResourceDecl::Texture(decl) => decl.register_id,
            ResourceDecl::Sampler(decl) => decl.register_id,
        }
    }

    pub fn scope(&self) -> ResourceScope {
        match self {
            ResourceDecl::ConstBuffer(decl) => decl.scope,
            ResourceDecl::Texture(decl) => decl.scope,
            ResourceDecl::Sampler(decl) => decl.scope,
        }
    }

    pub fn bind(&self) -> BindFrequency {
        match self {
            ResourceDecl::ConstBuffer(decl) => decl.bind,
            ResourceDecl::Texture(decl) => decl.bind,
            ResourceDecl::Sampler(decl) => decl.bind,
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            ResourceDecl::ConstBuffer(decl) => &decl.raw,
            ResourceDecl::Texture(decl) => &decl.raw,
            ResourceDecl::Sampler(decl) => &decl.raw,
        }
    }

    /// Structural equality: two global declarations of the same name must
    /// agree on everything that matters for binding. The raw text is not
    /// compared, so formatting may differ between files.
    pub fn structurally_eq(&self, other: &ResourceDecl) -> bool {
        match (self, other) {
            (ResourceDecl::ConstBuffer(a), ResourceDecl::ConstBuffer(b)) => {
                a.name == b.name
                    && a.register_id == b.register_id
                    && a.fields == b.fields
                    && a.scope == b.scope
                    && a.bind == b.bind
            }
            (ResourceDecl::Texture(a), ResourceDecl::Texture(b)) => {
                a.name == b.name
                    && a.register_id == b.register_id
                    && a.scope == b.scope
                    && a.bind == b.bind
            }
            (ResourceDecl::Sampler(a), ResourceDecl::Sampler(b)) => {
                a.name == b.name
                    && a.register_id == b.register_id
                    && a.scope == b.scope
                    && a.bind == b.bind
            }
            _ => false,
        }
    }
}

/// One root signature parameter. UAVs, root constants and static samplers are
/// recognized by the grammar but rejected by the parser with a hard error.
#[derive(Debug, Clone, PartialEq)]
pub enum RootParam {
    InlineCbv { register_id: u32, num: u32 },
    DescTable { entries: Vec<DescTableParam> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescTableParam {
    Cbv { register_id: u32, num: u32 },
    Srv { register_id: u32, num: u32 },
    Sampler { register_id: u32, num: u32 },
}

/// A root signature as declared: the lowered parameter list plus the raw text
/// that gets embedded into every shader of the pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RootSignatureDecl {
    /// Single-line textual form for the `[RootSignature("...")]` attribute.
    pub raw: String,
    pub params: Vec<RootParam>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vs,
    Gs,
    Ps,
}

impl ShaderStage {
    pub fn profile(self) -> &'static str {
        match self {
            ShaderStage::Vs => "vs_5_1",
            ShaderStage::Gs => "gs_5_1",
            ShaderStage::Ps => "ps_5_1",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vs => "Vs",
            ShaderStage::Gs => "Gs",
            ShaderStage::Ps => "Ps",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderSource {
    pub stage: ShaderStage,
    /// Names of declarations injected at the top of the shader text.
    pub externals: Vec<String>,
    pub source: String,
}

/// Everything parsed out of one pass file. Consumed by move when the pass is
/// compiled into the frame graph.
#[derive(Debug, Clone, PartialEq)]
pub struct PassParametersSource {
    pub name: String,
    pub input: Option<PassInput>,
    pub input_vert_attr: Option<String>,
    /// (field name hash, input slot) overrides; empty means slot 0 for all.
    pub vert_attr_slots: Vec<(u32, u32)>,
    pub color_target: String,
    pub depth_target: String,
    pub viewport: Viewport,
    pub blend: BlendState,
    pub depth_write: bool,
    pub topology: Topology,
    pub shaders: Vec<ShaderSource>,
    pub root_signature: RootSignatureDecl,
    pub resources: Vec<ResourceDecl>,
    pub vert_attrs: Vec<VertAttr>,
    pub functions: Vec<FunctionDef>,
}

impl PassParametersSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: None,
            input_vert_attr: None,
            vert_attr_slots: Vec::new(),
            color_target: String::new(),
            depth_target: String::new(),
            viewport: Viewport::default(),
            blend: BlendState::default(),
            depth_write: true,
            topology: Topology::TriangleList,
            shaders: Vec::new(),
            root_signature: RootSignatureDecl::default(),
            resources: Vec::new(),
            vert_attrs: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// The vertex attribute selected by `vertAttr`.
    pub fn input_vert_attr(&self) -> Option<&VertAttr> {
        let name = self.input_vert_attr.as_deref()?;
        self.vert_attrs.iter().find(|attr| attr.name == name)
    }
}
