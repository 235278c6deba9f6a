//! Cross-pass resource validation, run before any pass is compiled.
//!
//! The rules, in the order they are checked per declaration:
//!
//! 1. names are unique inside a single pass,
//! 2. `Global PerPass` declarations sharing a name must be structurally
//!    equal across passes; no other declaration may reuse such a name,
//! 3. `Global PerObject` declarations are deduplicated *per input type* —
//!    passes feeding different input types may reuse a name independently,
//! 4. a `PerPass` name never collides with any `PerObject` name.

use super::source::{
    BindFrequency, PassParametersSource, ResourceDecl, ResourceScope, PASS_INPUT_COUNT,
};
use super::GraphBuildError;

pub fn validate_resources(sources: &[PassParametersSource]) -> Result<(), GraphBuildError> {
    let mut per_object_global: [Vec<&ResourceDecl>; PASS_INPUT_COUNT] = Default::default();
    let mut per_pass_global: Vec<&ResourceDecl> = Vec::new();

    for source in sources {
        let input = source.input.ok_or_else(|| GraphBuildError::InvalidPassSource {
            file: format!("{}.pass", source.name),
            line: 1,
            column: 1,
            message: "pass declares no input type".to_string(),
        })?;

        for resource in &source.resources {
            let name = resource.name();
            let collision = || GraphBuildError::ResourceNameCollision {
                name: name.to_string(),
            };

            // In-pass uniqueness
            let in_pass_count = source
                .resources
                .iter()
                .filter(|other| other.name() == name)
                .count();
            if in_pass_count != 1 {
                return Err(collision());
            }

            // Global per-pass table
            {
                let existing = per_pass_global.iter().find(|other| other.name() == name);

                if resource.scope() == ResourceScope::Global
                    && resource.bind() == BindFrequency::PerPass
                {
                    match existing {
                        Some(existing) if !existing.structurally_eq(resource) => {
                            return Err(collision())
                        }
                        Some(_) => {}
                        None => per_pass_global.push(resource),
                    }
                } else if existing.is_some() {
                    return Err(collision());
                }
            }

            // Per-object tables
            if resource.bind() == BindFrequency::PerObject {
                // Only resources fed to the same input type can conflict
                let table = &mut per_object_global[input.index()];
                let existing = table.iter().find(|other| other.name() == name);

                if resource.scope() == ResourceScope::Global {
                    match existing {
                        Some(existing) if !existing.structurally_eq(resource) => {
                            return Err(collision())
                        }
                        Some(_) => {}
                        None => table.push(resource),
                    }
                } else if existing.is_some() {
                    return Err(collision());
                }
            } else {
                // A per-pass name must stay clear of every per-object table
                for table in &per_object_global {
                    if table.iter().any(|other| other.name() == name) {
                        return Err(collision());
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::source::{ConstBufferDecl, ConstBufferField, PassInput};
    use strafe_utils::fnv1a_hash;

    fn cbuffer(
        name: &str,
        register_id: u32,
        field: &str,
        scope: ResourceScope,
        bind: BindFrequency,
    ) -> ResourceDecl {
        ResourceDecl::ConstBuffer(ConstBufferDecl {
            name: name.to_string(),
            register_id,
            fields: vec![ConstBufferField {
                size: 64,
                name_hash: fnv1a_hash(field.as_bytes()),
            }],
            raw: format!("cbuffer {name} {{ ... }}"),
            scope,
            bind,
        })
    }

    fn pass(name: &str, input: PassInput, resources: Vec<ResourceDecl>) -> PassParametersSource {
        let mut source = PassParametersSource::new(name);
        source.input = Some(input);
        source.resources = resources;
        source
    }

    #[test]
    fn equal_global_per_pass_declarations_are_fine() {
        let shared = || {
            cbuffer(
                "Cam",
                0,
                "view",
                ResourceScope::Global,
                BindFrequency::PerPass,
            )
        };
        let sources = [
            pass("a", PassInput::Ui, vec![shared()]),
            pass("b", PassInput::Static, vec![shared()]),
        ];
        validate_resources(&sources).unwrap();
    }

    #[test]
    fn structurally_different_globals_collide() {
        let sources = [
            pass(
                "a",
                PassInput::Ui,
                vec![cbuffer("Cam", 0, "view", ResourceScope::Global, BindFrequency::PerPass)],
            ),
            pass(
                "b",
                PassInput::Static,
                vec![cbuffer("Cam", 0, "proj", ResourceScope::Global, BindFrequency::PerPass)],
            ),
        ];
        match validate_resources(&sources) {
            Err(GraphBuildError::ResourceNameCollision { name }) => assert_eq!(name, "Cam"),
            other => panic!("expected collision, got {other:?}"),
        }
    }

    #[test]
    fn per_object_globals_are_scoped_to_input_type() {
        // Same name, different content, but different input types: allowed
        let sources = [
            pass(
                "a",
                PassInput::Ui,
                vec![cbuffer("Obj", 1, "pos", ResourceScope::Global, BindFrequency::PerObject)],
            ),
            pass(
                "b",
                PassInput::Static,
                vec![cbuffer("Obj", 1, "model", ResourceScope::Global, BindFrequency::PerObject)],
            ),
        ];
        validate_resources(&sources).unwrap();

        // Same input type: must be structurally equal
        let sources = [
            pass(
                "a",
                PassInput::Ui,
                vec![cbuffer("Obj", 1, "pos", ResourceScope::Global, BindFrequency::PerObject)],
            ),
            pass(
                "b",
                PassInput::Ui,
                vec![cbuffer("Obj", 1, "model", ResourceScope::Global, BindFrequency::PerObject)],
            ),
        ];
        assert!(validate_resources(&sources).is_err());
    }

    #[test]
    fn per_pass_and_per_object_namespaces_are_disjoint() {
        let sources = [
            pass(
                "a",
                PassInput::Ui,
                vec![cbuffer("Shared", 1, "x", ResourceScope::Global, BindFrequency::PerObject)],
            ),
            pass(
                "b",
                PassInput::Static,
                vec![cbuffer("Shared", 0, "x", ResourceScope::Local, BindFrequency::PerPass)],
            ),
        ];
        assert!(validate_resources(&sources).is_err());
    }

    #[test]
    fn duplicate_names_inside_one_pass_collide() {
        let sources = [pass(
            "a",
            PassInput::Ui,
            vec![
                cbuffer("Dup", 0, "x", ResourceScope::Local, BindFrequency::PerPass),
                cbuffer("Dup", 1, "y", ResourceScope::Local, BindFrequency::PerObject),
            ],
        )];
        assert!(validate_resources(&sources).is_err());
    }
}
