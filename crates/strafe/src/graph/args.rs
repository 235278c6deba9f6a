//! Runtime root arguments, lowered from root signature parameters.
//!
//! A root *parameter* is the logical slot a root signature declares; a root
//! *argument* is the binding a pass supplies at frame time. Arguments hold
//! only weak [`BufferHandle`]s and descriptor-heap indices; the GPU objects
//! themselves are owned by the central buffer registry.

use super::source::ConstBufferField;
use crate::frame::BufferHandle;
use smallvec::SmallVec;

/// Descriptor tables are almost always a handful of entries; keep them
/// inline.
pub type DescTableEntities = SmallVec<[DescTableEntity; 4]>;

/// An inline constant-buffer view argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstBufferViewArg {
    /// Root parameter index this argument binds to.
    pub bind_index: u32,
    pub name_hash: u32,
    pub fields: Vec<ConstBufferField>,
    /// Leased buffer region; `None` until the argument is bound.
    pub buffer: Option<BufferHandle>,
}

impl ConstBufferViewArg {
    /// Total byte size of the buffer region this view needs.
    pub fn byte_size(&self) -> u32 {
        self.fields.iter().map(|field| field.size).sum()
    }
}

/// One entity inside a descriptor table argument.
#[derive(Debug, Clone, PartialEq)]
pub enum DescTableEntity {
    ConstBufferView {
        name_hash: u32,
        fields: Vec<ConstBufferField>,
        buffer: Option<BufferHandle>,
        desc_index: Option<u32>,
    },
    Texture {
        name_hash: u32,
        desc_index: Option<u32>,
    },
    Sampler {
        name_hash: u32,
        desc_index: Option<u32>,
    },
}

impl DescTableEntity {
    pub fn name_hash(&self) -> u32 {
        match self {
            DescTableEntity::ConstBufferView { name_hash, .. } => *name_hash,
            DescTableEntity::Texture { name_hash, .. } => *name_hash,
            DescTableEntity::Sampler { name_hash, .. } => *name_hash,
        }
    }

    /// Identity comparison that ignores runtime binding state.
    fn same_entity(&self, other: &DescTableEntity) -> bool {
        match (self, other) {
            (
                DescTableEntity::ConstBufferView { name_hash: a, fields: af, .. },
                DescTableEntity::ConstBufferView { name_hash: b, fields: bf, .. },
            ) => a == b && af == bf,
            (
                DescTableEntity::Texture { name_hash: a, .. },
                DescTableEntity::Texture { name_hash: b, .. },
            ) => a == b,
            (
                DescTableEntity::Sampler { name_hash: a, .. },
                DescTableEntity::Sampler { name_hash: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

/// A descriptor table argument: ordered entities resolved to one contiguous
/// descriptor-heap range at bind time.
#[derive(Debug, Clone, PartialEq)]
pub struct DescTableArg {
    pub bind_index: u32,
    pub entities: DescTableEntities,
    /// First descriptor-heap index of the bound range.
    pub heap_base: Option<u32>,
}

/// A root argument. The set of shapes is closed.
#[derive(Debug, Clone, PartialEq)]
pub enum RootArg {
    ConstBufferView(ConstBufferViewArg),
    DescTable(DescTableArg),
}

impl RootArg {
    pub fn bind_index(&self) -> u32 {
        match self {
            RootArg::ConstBufferView(arg) => arg.bind_index,
            RootArg::DescTable(arg) => arg.bind_index,
        }
    }

    /// Scope-invariant identity used for global argument deduplication:
    /// two declarations refer to the same argument when their bind slot,
    /// names and content layout agree. Runtime state (buffer handles,
    /// descriptor indices) is ignored.
    pub fn same_resource(&self, other: &RootArg) -> bool {
        match (self, other) {
            (RootArg::ConstBufferView(a), RootArg::ConstBufferView(b)) => {
                a.bind_index == b.bind_index && a.name_hash == b.name_hash && a.fields == b.fields
            }
            (RootArg::DescTable(a), RootArg::DescTable(b)) => {
                a.bind_index == b.bind_index
                    && a.entities.len() == b.entities.len()
                    && a.entities
                        .iter()
                        .zip(&b.entities)
                        .all(|(x, y)| x.same_entity(y))
            }
            _ => false,
        }
    }
}

/// Finds an equal argument in a global pool. Deterministic for a fixed pass
/// order, which keeps rebuilds structurally identical.
pub fn find_arg(pool: &[RootArg], arg: &RootArg) -> Option<usize> {
    pool.iter().position(|candidate| candidate.same_resource(arg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strafe_utils::fnv1a_hash;

    fn cbv(bind_index: u32, name: &str) -> RootArg {
        RootArg::ConstBufferView(ConstBufferViewArg {
            bind_index,
            name_hash: fnv1a_hash(name.as_bytes()),
            fields: vec![ConstBufferField {
                size: 64,
                name_hash: fnv1a_hash(b"viewProj"),
            }],
            buffer: None,
        })
    }

    #[test]
    fn identity_ignores_binding_state() {
        let unbound = cbv(0, "Camera");
        let mut bound = unbound.clone();
        if let RootArg::ConstBufferView(arg) = &mut bound {
            arg.buffer = Some(strafe_utils::Pool::new().allocate(0u32));
        }
        assert!(unbound.same_resource(&bound));
    }

    #[test]
    fn identity_covers_name_slot_and_content() {
        let base = cbv(0, "Camera");
        assert!(!base.same_resource(&cbv(1, "Camera")));
        assert!(!base.same_resource(&cbv(0, "Sky")));

        let pool = vec![cbv(0, "Camera"), cbv(1, "Sky")];
        assert_eq!(find_arg(&pool, &cbv(1, "Sky")), Some(1));
        assert_eq!(find_arg(&pool, &cbv(2, "Fog")), None);
    }
}
