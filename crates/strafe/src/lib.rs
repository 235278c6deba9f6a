//! Data-driven renderer core and offline light baker.
//!
//! Two subsystems share this crate and one resource-argument model:
//!
//! * the **frame-graph compiler and runtime** ([`graph`], [`pass`]) — pass
//!   description files and a frame-graph file are parsed with grammars loaded
//!   from disk, validated, compiled into pipeline state, and executed in
//!   order every frame;
//! * the **light baker** ([`baker`]) — an offline Monte-Carlo path tracer
//!   producing diffuse-indirect SH9 probes per PVS cluster, with a textual
//!   serialization format.
//!
//! The native GPU layer, the map loader and the enclosing renderer are
//! consumed through the traits in [`device`] and [`scene`].

pub mod baker;
pub mod config;
pub mod device;
pub mod frame;
pub mod graph;
pub mod pass;
pub mod scene;

#[cfg(test)]
pub(crate) mod test_support;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
