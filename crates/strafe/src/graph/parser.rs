//! Semantic passes over the grammar parse trees.
//!
//! The PEG engine produces plain rule trees; the walkers in here turn them
//! into [`PassParametersSource`] values and the frame-graph pass list.
//! Unsupported root-signature constructs (UAVs, root constants, static
//! samplers) are recognized by the grammar and rejected here with a source
//! position.

use super::grammar::{line_column, Grammar, ParseNode};
use super::source::*;
use super::GraphBuildError;
use crate::device::{BlendFactor, Topology, Viewport};
use strafe_utils::fnv1a_hash;

fn error_at(file: &str, src: &str, offset: usize, message: impl Into<String>) -> GraphBuildError {
    let (line, column) = line_column(src, offset);
    GraphBuildError::InvalidPassSource {
        file: file.to_string(),
        line,
        column,
        message: message.into(),
    }
}

/// Parses one preprocessed pass file.
///
/// `draw_area` is the current draw-area size in pixels; fractional viewport
/// coordinates are resolved against it here, at compile time, which is why a
/// window resize requires a frame-graph rebuild.
pub fn parse_pass_source(
    grammar: &Grammar,
    name: &str,
    src: &str,
    draw_area: (u32, u32),
) -> Result<PassParametersSource, GraphBuildError> {
    let file = format!("{name}.pass");
    let root = grammar.run(src).map_err(|err| GraphBuildError::InvalidPassSource {
        file: file.clone(),
        line: err.line,
        column: err.column,
        message: "pass source does not match the pass grammar".to_string(),
    })?;

    let mut pass = PassParametersSource::new(name);

    for statement in root.all(grammar, "Statement") {
        let node = statement
            .children
            .first()
            .expect("empty Statement node");

        match grammar.rule_name(node.rule) {
            "PassInput" => {
                let ident = expect_child(node, grammar, "PassInputIdent");
                pass.input = Some(PassInput::ALL[ident.choice]);
            }
            "PassVertAttr" => {
                let ident = expect_child(node, grammar, "Ident");
                pass.input_vert_attr = Some(ident.token_text(src).to_string());
            }
            "PassVertAttrSlots" => {
                let slots = expect_child(node, grammar, "VertAttrSlots");
                for slot in slots.all(grammar, "VertAttrFieldSlot") {
                    let ident = expect_child(slot, grammar, "Ident");
                    let index = parse_int(&file, src, expect_child(slot, grammar, "Int"))?;
                    pass.vert_attr_slots
                        .push((fnv1a_hash(ident.token_text(src).as_bytes()), index as u32));
                }
            }
            "State" => visit_state(grammar, &file, src, node, draw_area, &mut pass)?,
            "RootSig" => visit_root_sig(grammar, &file, src, node, &mut pass)?,
            "Resource" => visit_resource(grammar, &file, src, node, &mut pass)?,
            "VertAttr" => {
                let name = expect_child(node, grammar, "Ident").token_text(src).to_string();
                let content = expect_child(node, grammar, "VertAttrContent");
                let fields = content
                    .all(grammar, "VertAttrField")
                    .map(|field| visit_vert_attr_field(grammar, src, field))
                    .collect();
                pass.vert_attrs.push(VertAttr {
                    name,
                    fields,
                    raw: node.raw(src).to_string(),
                });
            }
            "Function" => {
                let name = expect_child(node, grammar, "Ident").token_text(src).to_string();
                pass.functions.push(FunctionDef {
                    name,
                    raw: node.raw(src).to_string(),
                });
            }
            "Shader" => {
                let stage = match expect_child(node, grammar, "ShaderType").choice {
                    0 => ShaderStage::Vs,
                    1 => ShaderStage::Gs,
                    _ => ShaderStage::Ps,
                };
                let externals = node
                    .find(grammar, "ShaderExternalDecl")
                    .and_then(|decl| decl.find(grammar, "ExternalList"))
                    .map(|list| {
                        list.all(grammar, "Ident")
                            .map(|ident| ident.token_text(src).to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                let source = expect_child(node, grammar, "ShaderSource")
                    .token_text(src)
                    .to_string();
                pass.shaders.push(ShaderSource {
                    stage,
                    externals,
                    source,
                });
            }
            other => unreachable!("unexpected statement rule `{other}`"),
        }
    }

    Ok(pass)
}

/// Parses the frame-graph file into an ordered pass name list.
pub fn parse_frame_graph(
    grammar: &Grammar,
    file: &str,
    src: &str,
) -> Result<Vec<String>, GraphBuildError> {
    let root = grammar.run(src).map_err(|err| GraphBuildError::InvalidPassSource {
        file: file.to_string(),
        line: err.line,
        column: err.column,
        message: "frame graph file does not match the frame-graph grammar".to_string(),
    })?;

    Ok(root
        .all(grammar, "Pass")
        .map(|pass| pass.token_text(src).to_string())
        .collect())
}

// --- Statement visitors

fn visit_state(
    grammar: &Grammar,
    file: &str,
    src: &str,
    state: &ParseNode,
    draw_area: (u32, u32),
    pass: &mut PassParametersSource,
) -> Result<(), GraphBuildError> {
    for statement in state.all(grammar, "StateStatement") {
        let node = statement.children.first().expect("empty StateStatement");
        match grammar.rule_name(node.rule) {
            "ColorTargetSt" => {
                pass.color_target = expect_child(node, grammar, "Ident").token_text(src).to_string();
            }
            "DepthTargetSt" => {
                pass.depth_target = expect_child(node, grammar, "Ident").token_text(src).to_string();
            }
            "ViewportSt" => {
                let values: Vec<&ParseNode> = node.all(grammar, "Number").collect();
                debug_assert_eq!(values.len(), 4);

                let (width, height) = (draw_area.0 as f32, draw_area.1 as f32);
                let resolve = |node: &ParseNode, extent: f32| -> Result<f32, GraphBuildError> {
                    let text = node.token_text(src);
                    // Choice 0 is a fraction of the draw area, 1 is pixels
                    if node.choice == 0 {
                        let fraction: f32 = text.parse().map_err(|_| {
                            error_at(file, src, node.start, "invalid viewport fraction")
                        })?;
                        Ok(fraction * extent)
                    } else {
                        let pixels: i64 = text.parse().map_err(|_| {
                            error_at(file, src, node.start, "invalid viewport coordinate")
                        })?;
                        Ok(pixels as f32)
                    }
                };

                pass.viewport = Viewport {
                    top_left_x: resolve(values[0], width)?,
                    top_left_y: resolve(values[1], height)?,
                    width: resolve(values[2], width)?,
                    height: resolve(values[3], height)?,
                };

                debug_assert!(
                    pass.viewport.top_left_x < pass.viewport.width,
                    "weird viewport X param, are you sure?"
                );
                debug_assert!(
                    pass.viewport.top_left_y < pass.viewport.height,
                    "weird viewport Y param, are you sure?"
                );
            }
            "BlendEnabledSt" => {
                pass.blend.enabled = expect_child(node, grammar, "Bool").choice == 0;
            }
            "SrcBlendSt" => {
                pass.blend.src = blend_factor(expect_child(node, grammar, "BlendStValues"));
            }
            "DestBlendSt" => {
                pass.blend.dst = blend_factor(expect_child(node, grammar, "BlendStValues"));
            }
            "TopologySt" => {
                pass.topology = match expect_child(node, grammar, "TopologyStValues").choice {
                    0 => Topology::TriangleList,
                    _ => Topology::PointList,
                };
            }
            "DepthWriteMaskSt" => {
                pass.depth_write = expect_child(node, grammar, "Bool").choice == 0;
            }
            other => unreachable!("unexpected state rule `{other}`"),
        }
    }
    Ok(())
}

fn visit_root_sig(
    grammar: &Grammar,
    file: &str,
    src: &str,
    node: &ParseNode,
    pass: &mut PassParametersSource,
) -> Result<(), GraphBuildError> {
    let body = expect_child(node, grammar, "RSigBody");

    // The signature text is embedded into shader sources as a single-line
    // attribute; a stray newline would break compilation there.
    let mut raw = body.raw(src).to_string();
    raw.retain(|ch| ch != '\n' && ch != '\r');
    pass.root_signature.raw = raw;

    for entry in body.all(grammar, "RSigEntry") {
        let param = entry.children.first().expect("empty RSigEntry");
        let lowered = match grammar.rule_name(param.rule) {
            "RSigCBVDecl" => {
                let (register_id, num) = register_and_num(grammar, file, src, param)?;
                if num != 1 {
                    return Err(error_at(
                        file,
                        src,
                        param.start,
                        "inline CBV descriptors can't have more than 1 num",
                    ));
                }
                RootParam::InlineCbv { register_id, num }
            }
            "RSigDescTableDecl" => {
                let mut entries = Vec::new();
                for table_entry in param.all(grammar, "RSigDescTableEntry") {
                    let inner = table_entry.children.first().expect("empty RSigDescTableEntry");
                    let entry = match grammar.rule_name(inner.rule) {
                        "RSigCBVDecl" => {
                            let (register_id, num) = register_and_num(grammar, file, src, inner)?;
                            DescTableParam::Cbv { register_id, num }
                        }
                        "RSigSRVDecl" => {
                            let (register_id, num) = register_and_num(grammar, file, src, inner)?;
                            DescTableParam::Srv { register_id, num }
                        }
                        "RSigDescTableSampler" => {
                            let (register_id, num) = register_and_num(grammar, file, src, inner)?;
                            DescTableParam::Sampler { register_id, num }
                        }
                        "RSigUAVDecl" => {
                            return Err(error_at(file, src, inner.start, "UAVs are not supported"))
                        }
                        other => unreachable!("unexpected desc table entry `{other}`"),
                    };
                    entries.push(entry);
                }
                RootParam::DescTable { entries }
            }
            "RSigUAVDecl" => {
                return Err(error_at(file, src, param.start, "UAVs are not supported"));
            }
            "RSigStatSamplerDecl" => {
                return Err(error_at(
                    file,
                    src,
                    param.start,
                    "static samplers are not supported",
                ));
            }
            "RSigRootConstDecl" => {
                return Err(error_at(
                    file,
                    src,
                    param.start,
                    "root constants are not supported",
                ));
            }
            other => unreachable!("unexpected root signature entry `{other}`"),
        };
        pass.root_signature.params.push(lowered);
    }

    Ok(())
}

fn visit_resource(
    grammar: &Grammar,
    file: &str,
    src: &str,
    node: &ParseNode,
    pass: &mut PassParametersSource,
) -> Result<(), GraphBuildError> {
    let attr = expect_child(node, grammar, "ResourceAttr");
    let scope = match expect_child(attr, grammar, "ResourceScope").choice {
        0 => ResourceScope::Local,
        _ => ResourceScope::Global,
    };
    let bind = match expect_child(attr, grammar, "ResourceUpdate").choice {
        0 => BindFrequency::PerObject,
        _ => BindFrequency::PerPass,
    };

    let decl = node
        .children
        .iter()
        .find(|child| !child.is(grammar, "ResourceAttr"))
        .expect("Resource without declaration");

    let name = expect_child(decl, grammar, "Ident").token_text(src).to_string();
    let register_id = register_id(grammar, file, src, decl)?;
    let raw = decl.raw(src).to_string();

    let resource = match grammar.rule_name(decl.rule) {
        "ConstBuff" => {
            let content = expect_child(decl, grammar, "ConstBuffContent");
            let fields = content
                .all(grammar, "ConstBuffField")
                .map(|field| {
                    let ty = data_type(expect_child(field, grammar, "ResourceFieldType"));
                    let name = expect_child(field, grammar, "Ident").token_text(src);
                    ConstBufferField {
                        size: ty.size(),
                        name_hash: fnv1a_hash(name.as_bytes()),
                    }
                })
                .collect();
            ResourceDecl::ConstBuffer(ConstBufferDecl {
                name,
                register_id,
                fields,
                raw,
                scope,
                bind,
            })
        }
        "Texture" => ResourceDecl::Texture(TextureDecl {
            name,
            register_id,
            raw,
            scope,
            bind,
        }),
        "Sampler" => ResourceDecl::Sampler(SamplerDecl {
            name,
            register_id,
            raw,
            scope,
            bind,
        }),
        other => unreachable!("unexpected resource rule `{other}`"),
    };

    pass.resources.push(resource);
    Ok(())
}

fn visit_vert_attr_field(grammar: &Grammar, src: &str, field: &ParseNode) -> VertAttrField {
    let ty = data_type(expect_child(field, grammar, "ResourceFieldType"));
    let name = expect_child(field, grammar, "Ident").token_text(src).to_string();
    let semantic = expect_child(field, grammar, "ResourceFieldSemantic");
    let semantic_name = expect_child(semantic, grammar, "SemanticName")
        .token_text(src)
        .to_string();
    let semantic_index = semantic
        .find(grammar, "SemanticIndex")
        .map(|index| index.raw(src).parse().unwrap_or(0))
        .unwrap_or(0);

    VertAttrField {
        ty,
        name_hash: fnv1a_hash(name.as_bytes()),
        semantic_name,
        semantic_index,
        name,
    }
}

// --- Small helpers

fn expect_child<'a>(node: &'a ParseNode, grammar: &Grammar, name: &str) -> &'a ParseNode {
    node.find(grammar, name)
        .unwrap_or_else(|| panic!("expected `{name}` child node"))
}

fn blend_factor(node: &ParseNode) -> BlendFactor {
    match node.choice {
        0 => BlendFactor::SrcAlpha,
        _ => BlendFactor::InvSrcAlpha,
    }
}

fn data_type(node: &ParseNode) -> DataType {
    [
        DataType::Float4x4,
        DataType::Float4,
        DataType::Float2,
        DataType::Float,
        DataType::Int,
    ][node.choice]
}

fn parse_int(file: &str, src: &str, node: &ParseNode) -> Result<i64, GraphBuildError> {
    node.token_text(src)
        .parse()
        .map_err(|_| error_at(file, src, node.start, "invalid integer"))
}

fn register_id(
    grammar: &Grammar,
    file: &str,
    src: &str,
    node: &ParseNode,
) -> Result<u32, GraphBuildError> {
    let register = expect_child(node, grammar, "RegisterId");
    let value = parse_int(file, src, expect_child(register, grammar, "Int"))?;
    Ok(value as u32)
}

/// Register id plus the `numDescriptors` option, defaulting to 1. Visibility
/// options are accepted and ignored.
fn register_and_num(
    grammar: &Grammar,
    file: &str,
    src: &str,
    node: &ParseNode,
) -> Result<(u32, u32), GraphBuildError> {
    let register = register_id(grammar, file, src, node)?;

    let mut num = 1;
    for option in node.all(grammar, "RSigDeclOption") {
        if let Some(decl) = option.find(grammar, "RSDescNumDecl") {
            num = parse_int(file, src, expect_child(decl, grammar, "Int"))? as u32;
        }
    }

    Ok((register, num))
}
