//! Build-time settings and tuning constants.

use std::path::PathBuf;

/// Grammar file names, looked up inside [`GraphConfig::grammar_dir`].
pub const GRAMMAR_PREPROCESSOR_FILENAME: &str = "preprocessor.peg";
pub const GRAMMAR_PASS_FILENAME: &str = "pass.peg";
pub const GRAMMAR_FRAMEGRAPH_FILENAME: &str = "framegraph.peg";
pub const GRAMMAR_BAKE_RESULT_FILENAME: &str = "bakeresult.peg";

/// Pass source files are every file in the frame-graph directory with this
/// extension; the file stem is the pass name.
pub const PASS_EXT: &str = "pass";
/// The single frame-graph file in the frame-graph directory.
pub const FRAMEGRAPH_EXT: &str = "framegraph";

pub const LIGHT_BAKING_DATA_FILENAME: &str = "lightbake.dat";

/// Filesystem layout consumed by the frame-graph builder and the baker.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Directory holding the PEG grammar files. Absence is fatal.
    pub grammar_dir: PathBuf,
    /// Directory holding pass sources and the frame-graph file.
    pub framegraph_dir: PathBuf,
    /// Directory for baked data files.
    pub data_dir: PathBuf,
}

// --- Path tracing tuning.

/// Offset subtracted along the ray when reconstructing intersection points, so
/// that the reconstructed point never lands behind the triangle it hit.
pub const PATH_TRACING_EPSILON: f32 = 0.001;

/// Initial directions drawn per probe, uniformly over the sphere.
pub const PROBE_SAMPLES_NUM: usize = 128;

/// Bounces a path always takes before Russian roulette starts terminating it.
pub const GUARANTEED_BOUNCES_NUM: u32 = 3;

/// Absorption probability once bounces are no longer guaranteed. Surviving
/// paths get their throughput divided by `1.0 - this`.
pub const RUSSIAN_ROULETTE_ABSORPTION_PROBABILITY: f32 = 0.3;

/// Samples taken on each potentially visible area light per gather.
pub const AREA_LIGHTS_SAMPLES_NUM: usize = 8;

pub const POINT_LIGHTS_MAX_DISTANCE: f32 = 1000.0;
pub const AREA_LIGHTS_MIN_DISTANCE: f32 = 1.0;
pub const AREA_LIGHTS_MAX_DISTANCE: f32 = 1000.0;

/// Grid spacing between bake points inside a cluster AABB.
pub const BAKE_POINTS_INTERVAL: f32 = 50.0;
