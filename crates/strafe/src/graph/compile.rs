//! Pipeline compiler: shader compilation, input layout and PSO generation,
//! and the lowering of root signature parameters into root arguments.

use super::args::{
    find_arg, ConstBufferViewArg, DescTableArg, DescTableEntities, DescTableEntity, RootArg,
};
use super::source::*;
use super::{GraphBuildError, PassParameters, PerObjectGlobalTemplate};
use crate::device::{Device, InputElement, PipelineDesc, PipelineId, RootSignatureId, ShaderBlob};
use log::*;
use strafe_utils::fnv1a_hash;

pub struct CompiledShader {
    pub stage: ShaderStage,
    pub blob: ShaderBlob,
}

/// Compiles every shader of a pass: resolved externals are prepended, the
/// root-signature attribute is appended, and the result goes through the
/// device shader compiler with a `<stage>_5_1` profile.
pub fn compile_shaders(
    device: &dyn Device,
    source: &PassParametersSource,
) -> Result<Vec<CompiledShader>, GraphBuildError> {
    let mut compiled = Vec::with_capacity(source.shaders.len());

    for shader in &source.shaders {
        let mut defs = String::new();
        for external in &shader.externals {
            let raw = lookup_external(source, external).ok_or_else(|| {
                GraphBuildError::ShaderCompile {
                    pass: source.name.clone(),
                    message: format!("shader external `{external}` was not found"),
                }
            })?;
            defs.push_str(raw);
            defs.push(';');
            defs.push('\n');
        }

        let code = format!(
            "{defs}[RootSignature( \" {} \" )]\n{}",
            source.root_signature.raw, shader.source
        );

        debug!(
            "compiling shader, pass: {}, stage: {}",
            source.name,
            shader.stage.name()
        );

        let name = format!("{}{}", source.name, shader.stage.name());
        let blob = device
            .compile_shader(&name, &code, shader.stage.profile())
            .map_err(|err| {
                error!("shader compilation error: {err}");
                GraphBuildError::ShaderCompile {
                    pass: source.name.clone(),
                    message: err.to_string(),
                }
            })?;

        compiled.push(CompiledShader {
            stage: shader.stage,
            blob,
        });
    }

    Ok(compiled)
}

fn lookup_external<'a>(source: &'a PassParametersSource, name: &str) -> Option<&'a str> {
    if let Some(resource) = source.resources.iter().find(|res| res.name() == name) {
        return Some(resource.raw());
    }
    if let Some(attr) = source.vert_attrs.iter().find(|attr| attr.name == name) {
        return Some(&attr.raw);
    }
    if let Some(function) = source.functions.iter().find(|func| func.name == name) {
        return Some(&function.raw);
    }
    None
}

const INPUT_SLOTS: usize = 16;

/// Builds the input layout from the pass's selected vertex attribute. Fields
/// go to slot 0 unless remapped by `vertAttrSlots`; byte offsets accumulate
/// per slot in declaration order.
pub fn generate_input_layout(
    source: &PassParametersSource,
) -> Result<Vec<InputElement>, GraphBuildError> {
    let vert_attr = source.input_vert_attr().ok_or_else(|| {
        GraphBuildError::InvalidPassSource {
            file: format!("{}.pass", source.name),
            line: 1,
            column: 1,
            message: match &source.input_vert_attr {
                Some(name) => format!("input vertex attribute `{name}` is not declared"),
                None => "pass declares no input vertex attribute".to_string(),
            },
        }
    })?;

    debug_assert!(
        source.vert_attr_slots.is_empty()
            || source.vert_attr_slots.len() == vert_attr.fields.len(),
        "invalid vert attr slots num for input layout generation"
    );

    let mut slot_offsets = [0u32; INPUT_SLOTS];
    let mut layout = Vec::with_capacity(vert_attr.fields.len());

    for field in &vert_attr.fields {
        let input_slot = source
            .vert_attr_slots
            .iter()
            .find(|(hash, _)| *hash == field.name_hash)
            .map(|(_, slot)| *slot)
            .unwrap_or(0);

        let format = field.ty.element_format().ok_or_else(|| {
            GraphBuildError::InvalidPassSource {
                file: format!("{}.pass", source.name),
                line: 1,
                column: 1,
                message: format!("field `{}` has no vertex element format", field.name),
            }
        })?;

        layout.push(InputElement {
            semantic_name: field.semantic_name.clone(),
            semantic_index: field.semantic_index,
            format,
            input_slot,
            aligned_byte_offset: slot_offsets[input_slot as usize],
        });

        slot_offsets[input_slot as usize] += field.ty.size();
    }

    Ok(layout)
}

/// The root signature comes from the first compiled shader blob, which embeds
/// the signature text every shader of the pass carries.
pub fn generate_root_signature(
    device: &dyn Device,
    source: &PassParametersSource,
    shaders: &[CompiledShader],
) -> Result<RootSignatureId, GraphBuildError> {
    debug!("generating root signature, pass: {}", source.name);

    let first = shaders.first().ok_or_else(|| GraphBuildError::PipelineCreate {
        pass: source.name.clone(),
        message: "can't generate a root signature without compiled shaders".to_string(),
    })?;

    device
        .create_root_signature(&first.blob, &format!("Root sig, pass: {}", source.name))
        .map_err(|err| GraphBuildError::PipelineCreate {
            pass: source.name.clone(),
            message: err.to_string(),
        })
}

pub fn generate_pipeline_state(
    device: &dyn Device,
    source: &PassParametersSource,
    shaders: &[CompiledShader],
    root_signature: RootSignatureId,
) -> Result<PipelineId, GraphBuildError> {
    debug!("generating pipeline state, pass: {}", source.name);

    let mut desc = PipelineDesc {
        root_signature,
        vs: None,
        gs: None,
        ps: None,
        input_layout: generate_input_layout(source)?,
        topology_kind: source.topology.kind(),
        blend: source.blend,
        depth_write: source.depth_write,
        color_target_hash: fnv1a_hash(source.color_target.as_bytes()),
        depth_target_hash: fnv1a_hash(source.depth_target.as_bytes()),
    };

    for shader in shaders {
        let slot = match shader.stage {
            ShaderStage::Vs => &mut desc.vs,
            ShaderStage::Gs => &mut desc.gs,
            ShaderStage::Ps => &mut desc.ps,
        };
        *slot = Some(shader.blob.clone());
    }

    device
        .create_pipeline_state(&desc, &format!("PSO, pass: {}", source.name))
        .map_err(|err| GraphBuildError::PipelineCreate {
            pass: source.name.clone(),
            message: err.to_string(),
        })
}

/// Routes one lowered argument into the right pool based on its scope and
/// bind frequency. Global arguments are deduplicated; the pass stores an
/// index into the shared pool instead of a second copy.
fn add_root_arg(
    pass: &mut PassParameters,
    passes_global_res: &mut Vec<RootArg>,
    obj_global_template: &mut PerObjectGlobalTemplate,
    bind: BindFrequency,
    scope: ResourceScope,
    arg: RootArg,
) {
    match (scope, bind) {
        (ResourceScope::Local, BindFrequency::PerObject) => {
            pass.per_object_local_root_args_template.push(arg);
        }
        (ResourceScope::Local, BindFrequency::PerPass) => {
            pass.pass_local_root_args.push(arg);
        }
        (ResourceScope::Global, BindFrequency::PerPass) => {
            let index = match find_arg(passes_global_res, &arg) {
                Some(index) => index,
                None => {
                    passes_global_res.push(arg);
                    passes_global_res.len() - 1
                }
            };
            pass.pass_global_root_args_indices.push(index);
        }
        (ResourceScope::Global, BindFrequency::PerObject) => {
            let template = &mut obj_global_template[pass.input.index()];
            let index = match find_arg(template, &arg) {
                Some(index) => index,
                None => {
                    template.push(arg);
                    template.len() - 1
                }
            };
            pass.per_obj_global_root_args_indices_template.push(index);
        }
    }
}

fn find_const_buffer<'a>(
    resources: &'a [ResourceDecl],
    register_id: u32,
) -> Option<&'a ConstBufferDecl> {
    resources.iter().find_map(|res| match res {
        ResourceDecl::ConstBuffer(decl) if decl.register_id == register_id => Some(decl),
        _ => None,
    })
}

fn find_texture<'a>(resources: &'a [ResourceDecl], register_id: u32) -> Option<&'a TextureDecl> {
    resources.iter().find_map(|res| match res {
        ResourceDecl::Texture(decl) if decl.register_id == register_id => Some(decl),
        _ => None,
    })
}

fn find_sampler<'a>(resources: &'a [ResourceDecl], register_id: u32) -> Option<&'a SamplerDecl> {
    resources.iter().find_map(|res| match res {
        ResourceDecl::Sampler(decl) if decl.register_id == register_id => Some(decl),
        _ => None,
    })
}

fn missing_resource(source: &PassParametersSource, what: &str, register: u32) -> GraphBuildError {
    GraphBuildError::InvalidPassSource {
        file: format!("{}.pass", source.name),
        line: 1,
        column: 1,
        message: format!("root signature references {what} register {register}, but no such resource is declared"),
    }
}

/// Lowers every root signature parameter of a pass into a root argument, in
/// declaration order, and routes them into the pass / graph argument pools.
pub fn create_resource_arguments(
    source: &PassParametersSource,
    passes_global_res: &mut Vec<RootArg>,
    obj_global_template: &mut PerObjectGlobalTemplate,
    pass: &mut PassParameters,
) -> Result<(), GraphBuildError> {
    debug!("creating resource arguments, pass: {}", source.name);

    for (param_index, param) in source.root_signature.params.iter().enumerate() {
        match param {
            RootParam::InlineCbv { register_id, num } => {
                debug_assert_eq!(*num, 1, "inline CBV must have exactly one descriptor");

                let decl = find_const_buffer(&source.resources, *register_id)
                    .ok_or_else(|| missing_resource(source, "const buffer", *register_id))?;

                add_root_arg(
                    pass,
                    passes_global_res,
                    obj_global_template,
                    decl.bind,
                    decl.scope,
                    RootArg::ConstBufferView(ConstBufferViewArg {
                        bind_index: param_index as u32,
                        name_hash: fnv1a_hash(decl.name.as_bytes()),
                        fields: decl.fields.clone(),
                        buffer: None,
                    }),
                );
            }
            RootParam::DescTable { entries } => {
                let mut entities = DescTableEntities::new();
                let mut shared_bind: Option<BindFrequency> = None;
                let mut shared_scope: Option<ResourceScope> = None;

                let mut merge = |scope: ResourceScope,
                                 bind: BindFrequency|
                 -> Result<(), GraphBuildError> {
                    let mixed_error = || GraphBuildError::DescTableMixedFrequency {
                        pass: source.name.clone(),
                    };
                    match shared_bind {
                        None => shared_bind = Some(bind),
                        Some(existing) if existing != bind => return Err(mixed_error()),
                        Some(_) => {}
                    }
                    match shared_scope {
                        None => shared_scope = Some(scope),
                        Some(existing) if existing != scope => return Err(mixed_error()),
                        Some(_) => {}
                    }
                    Ok(())
                };

                for entry in entries {
                    match entry {
                        DescTableParam::Cbv { register_id, num } => {
                            for offset in 0..*num {
                                let decl =
                                    find_const_buffer(&source.resources, register_id + offset)
                                        .ok_or_else(|| {
                                            missing_resource(source, "const buffer", register_id + offset)
                                        })?;
                                merge(decl.scope, decl.bind)?;
                                entities.push(DescTableEntity::ConstBufferView {
                                    name_hash: fnv1a_hash(decl.name.as_bytes()),
                                    fields: decl.fields.clone(),
                                    buffer: None,
                                    desc_index: None,
                                });
                            }
                        }
                        DescTableParam::Srv { register_id, num } => {
                            for offset in 0..*num {
                                let decl = find_texture(&source.resources, register_id + offset)
                                    .ok_or_else(|| {
                                        missing_resource(source, "texture", register_id + offset)
                                    })?;
                                merge(decl.scope, decl.bind)?;
                                entities.push(DescTableEntity::Texture {
                                    name_hash: fnv1a_hash(decl.name.as_bytes()),
                                    desc_index: None,
                                });
                            }
                        }
                        DescTableParam::Sampler { register_id, num } => {
                            for offset in 0..*num {
                                let decl = find_sampler(&source.resources, register_id + offset)
                                    .ok_or_else(|| {
                                        missing_resource(source, "sampler", register_id + offset)
                                    })?;
                                merge(decl.scope, decl.bind)?;
                                entities.push(DescTableEntity::Sampler {
                                    name_hash: fnv1a_hash(decl.name.as_bytes()),
                                    desc_index: None,
                                });
                            }
                        }
                    }
                }

                let bind = shared_bind.expect("descriptor table with no entries");
                let scope = shared_scope.expect("descriptor table with no entries");

                add_root_arg(
                    pass,
                    passes_global_res,
                    obj_global_template,
                    bind,
                    scope,
                    RootArg::DescTable(DescTableArg {
                        bind_index: param_index as u32,
                        entities,
                        heap_base: None,
                    }),
                );
            }
        }
    }

    Ok(())
}

/// Compiles one pass: shaders, root signature, PSO, then argument lowering.
/// The parameter source is consumed; compilation is the end of its life.
pub fn compile_pass_parameters(
    device: &dyn Device,
    source: PassParametersSource,
    passes_global_res: &mut Vec<RootArg>,
    obj_global_template: &mut PerObjectGlobalTemplate,
) -> Result<PassParameters, GraphBuildError> {
    let input = source.input.ok_or_else(|| GraphBuildError::InvalidPassSource {
        file: format!("{}.pass", source.name),
        line: 1,
        column: 1,
        message: "pass declares no input type".to_string(),
    })?;

    let vert_attr = source
        .input_vert_attr()
        .cloned()
        .ok_or_else(|| GraphBuildError::InvalidPassSource {
            file: format!("{}.pass", source.name),
            line: 1,
            column: 1,
            message: "pass declares no input vertex attribute".to_string(),
        })?;

    let shaders = compile_shaders(device, &source)?;
    let root_signature = generate_root_signature(device, &source, &shaders)?;
    let pipeline = generate_pipeline_state(device, &source, &shaders, root_signature)?;

    let mut pass = PassParameters {
        name: source.name.clone(),
        input,
        topology: source.topology,
        color_target_hash: fnv1a_hash(source.color_target.as_bytes()),
        depth_target_hash: fnv1a_hash(source.depth_target.as_bytes()),
        viewport: source.viewport,
        vert_attr,
        root_signature,
        pipeline,
        pass_local_root_args: Vec::new(),
        per_object_local_root_args_template: Vec::new(),
        pass_global_root_args_indices: Vec::new(),
        per_obj_global_root_args_indices_template: Vec::new(),
    };

    create_resource_arguments(&source, passes_global_res, obj_global_template, &mut pass)?;

    Ok(pass)
}
