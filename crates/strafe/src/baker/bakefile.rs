//! Textual baked-data format: serialization and grammar-driven parsing.
//!
//! ```text
//! BakingMode AllClusters
//! ClusterFirstProbeIndices 2
//! 0
//! 4
//! ProbeData 8
//! Probe 0
//! 0.001428571, 0.002857142, 0.004285714
//! ...          ; nine coefficient rows per probe
//! ```

use super::{BakeError, BakingData, DiffuseProbe, LightBakingMode};
use crate::graph::grammar::{Grammar, ParseNode};
use glam::Vec3;
use log::*;
use std::fmt::Write as _;
use std::path::Path;

/// Renders a finished bake into its textual form. Coefficients are written
/// with nine decimal digits, which bounds the round-trip error well under the
/// 1e-6 the renderer cares about.
pub fn serialize(data: &BakingData) -> Result<String, BakeError> {
    let mode = data
        .mode
        .ok_or_else(|| BakeError::InputInvalid("baking mode is not set".to_string()))?;

    let mut out = String::new();
    let _ = write!(out, "BakingMode {}", mode.as_str());

    match mode {
        LightBakingMode::CurrentPositionCluster => {
            let cluster = data.baking_cluster.ok_or_else(|| {
                BakeError::InputInvalid(
                    "baking cluster is required in CurrentPositionCluster mode".to_string(),
                )
            })?;
            let _ = write!(out, "\nBakingCluster {cluster}");
        }
        LightBakingMode::AllClusters => {
            if data.cluster_first_probe_indices.is_empty() {
                return Err(BakeError::InputInvalid(
                    "cluster first probe indices are required in AllClusters mode".to_string(),
                ));
            }
            let _ = write!(
                out,
                "\nClusterFirstProbeIndices {}",
                data.cluster_first_probe_indices.len()
            );
            for index in &data.cluster_first_probe_indices {
                let _ = write!(out, "\n{index}");
            }
        }
    }

    let _ = write!(out, "\nProbeData {}", data.probes.len());
    for (index, probe) in data.probes.iter().enumerate() {
        let _ = write!(out, "\nProbe {index}");
        for coeff in &probe.radiance_sh {
            let _ = write!(out, "\n{:.9}, {:.9}, {:.9}", coeff.x, coeff.y, coeff.z);
        }
    }

    Ok(out)
}

pub fn save(path: &Path, data: &BakingData) -> Result<(), BakeError> {
    let text = serialize(data)?;
    std::fs::write(path, text)
        .map_err(|err| BakeError::DataIo(format!("{}: {err}", path.display())))?;
    info!("saved baking results to {}", path.display());
    Ok(())
}

/// Parses the textual form back into a [`BakingData`], using the bake-result
/// grammar. Structural inconsistencies (count mismatches, gaps in probe
/// numbering, a cluster section that contradicts the mode) are all
/// [`BakeError::DataIo`].
pub fn parse(grammar: &Grammar, text: &str) -> Result<BakingData, BakeError> {
    let root = grammar.run(text).map_err(|err| {
        BakeError::DataIo(format!(
            "malformed baked data at line {}, column {}",
            err.line, err.column
        ))
    })?;

    let mut data = BakingData::default();

    // Baking mode
    let mode_word = root
        .find(grammar, "BakingModeSection")
        .and_then(|section| section.find(grammar, "Word"))
        .ok_or_else(|| BakeError::DataIo("missing BakingMode section".to_string()))?
        .token_text(text);
    let mode = LightBakingMode::from_str(mode_word)
        .ok_or_else(|| BakeError::DataIo(format!("unknown baking mode `{mode_word}`")))?;
    data.mode = Some(mode);

    // Cluster section, which must match the mode
    let cluster_section = root
        .find(grammar, "ClusterSection")
        .ok_or_else(|| BakeError::DataIo("missing cluster section".to_string()))?;

    if let Some(cluster) = cluster_section.find(grammar, "BakingCluster") {
        if mode != LightBakingMode::CurrentPositionCluster {
            return Err(BakeError::DataIo(
                "BakingCluster section with a non-cluster baking mode".to_string(),
            ));
        }
        data.baking_cluster = Some(parse_int(grammar, text, cluster)? as u32);
    }

    if let Some(indices) = cluster_section.find(grammar, "ClusterFirstProbeIndices") {
        if mode != LightBakingMode::AllClusters {
            return Err(BakeError::DataIo(
                "ClusterFirstProbeIndices section with a non-AllClusters mode".to_string(),
            ));
        }

        let values: Vec<i64> = indices
            .all(grammar, "Int")
            .map(|node| parse_int_node(text, node))
            .collect::<Result<_, _>>()?;
        let (&count, rest) = values
            .split_first()
            .ok_or_else(|| BakeError::DataIo("empty ClusterFirstProbeIndices".to_string()))?;
        if rest.len() != count as usize {
            return Err(BakeError::DataIo(format!(
                "ClusterFirstProbeIndices declares {count} entries but carries {}",
                rest.len()
            )));
        }
        data.cluster_first_probe_indices = rest.iter().map(|&value| value as usize).collect();
    }

    // Probes
    let probe_section = root
        .find(grammar, "ProbeSection")
        .ok_or_else(|| BakeError::DataIo("missing ProbeData section".to_string()))?;
    let declared_count = probe_section
        .find(grammar, "Int")
        .ok_or_else(|| BakeError::DataIo("missing probe count".to_string()))
        .and_then(|node| parse_int_node(text, node))? as usize;

    for probe_node in probe_section.all(grammar, "Probe") {
        let index = probe_node
            .find(grammar, "Int")
            .ok_or_else(|| BakeError::DataIo("probe without an index".to_string()))
            .and_then(|node| parse_int_node(text, node))? as usize;
        if index != data.probes.len() {
            return Err(BakeError::DataIo(format!(
                "probe {index} out of order, expected {}",
                data.probes.len()
            )));
        }

        let coefficients: Vec<Vec3> = probe_node
            .all(grammar, "Float3")
            .map(|node| parse_float3(grammar, text, node))
            .collect::<Result<_, _>>()?;

        let mut probe = DiffuseProbe::default();
        if coefficients.len() != probe.radiance_sh.len() {
            return Err(BakeError::DataIo(format!(
                "probe {index} carries {} coefficients instead of {}",
                coefficients.len(),
                probe.radiance_sh.len()
            )));
        }
        probe.radiance_sh.copy_from_slice(&coefficients);
        data.probes.push(probe);
    }

    if data.probes.len() != declared_count {
        return Err(BakeError::DataIo(format!(
            "ProbeData declares {declared_count} probes but carries {}",
            data.probes.len()
        )));
    }

    Ok(data)
}

pub fn load(grammar: &Grammar, path: &Path) -> Result<BakingData, BakeError> {
    info!("loading baking results from {}", path.display());
    let text = std::fs::read_to_string(path)
        .map_err(|err| BakeError::DataIo(format!("{}: {err}", path.display())))?;
    parse(grammar, &text)
}

fn parse_int(grammar: &Grammar, text: &str, parent: &ParseNode) -> Result<i64, BakeError> {
    parent
        .find(grammar, "Int")
        .ok_or_else(|| BakeError::DataIo("missing integer".to_string()))
        .and_then(|node| parse_int_node(text, node))
}

fn parse_int_node(text: &str, node: &ParseNode) -> Result<i64, BakeError> {
    node.token_text(text)
        .parse()
        .map_err(|_| BakeError::DataIo(format!("invalid integer `{}`", node.token_text(text))))
}

fn parse_float3(grammar: &Grammar, text: &str, node: &ParseNode) -> Result<Vec3, BakeError> {
    let values: Vec<f32> = node
        .all(grammar, "Float")
        .map(|float| {
            float
                .token_text(text)
                .parse()
                .map_err(|_| BakeError::DataIo(format!("invalid float `{}`", float.token_text(text))))
        })
        .collect::<Result<_, _>>()?;

    if values.len() != 3 {
        return Err(BakeError::DataIo("coefficient row is not a float triple".to_string()));
    }
    Ok(Vec3::new(values[0], values[1], values[2]))
}
