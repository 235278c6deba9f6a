//! Frame-graph build orchestration and hot reload.
//!
//! The builder loads the three grammars once at startup, then compiles the
//! frame-graph directory on demand. A filesystem watcher flips a dirty flag
//! whenever anything in that directory changes; the next
//! [`FrameGraphBuilder::build_if_changed`] drains all in-flight frames and
//! rebuilds. A failed rebuild returns the error and leaves the caller's
//! previous graph in place.

use super::compile::compile_pass_parameters;
use super::grammar::Grammar;
use super::parser::{parse_frame_graph, parse_pass_source};
use super::preprocessor;
use super::validate::validate_resources;
use super::{FrameGraph, GraphBuildError};
use crate::config::*;
use crate::device::{Device, RendererHost};
use crate::pass::Pass;
use log::*;
use notify::{RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reads and compiles one grammar file. A missing or broken grammar is a
/// configuration error; nothing can be parsed without it.
pub fn load_grammar_file(path: impl AsRef<Path>) -> Result<Grammar, GraphBuildError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|_| GraphBuildError::ConfigMissing(path.display().to_string()))?;
    Grammar::parse(&text)
        .map_err(|err| GraphBuildError::ConfigMissing(format!("{}: {err}", path.display())))
}

#[derive(Debug)]
pub struct FrameGraphBuilder {
    config: GraphConfig,
    preprocessor_grammar: Grammar,
    pass_grammar: Grammar,
    framegraph_grammar: Grammar,
    dirty: Arc<AtomicBool>,
    _watcher: Option<notify::RecommendedWatcher>,
}

impl FrameGraphBuilder {
    /// Loads the grammars and starts watching the frame-graph directory.
    /// The first [`FrameGraphBuilder::build_if_changed`] always builds.
    pub fn new(config: GraphConfig) -> Result<Self, GraphBuildError> {
        let preprocessor_grammar =
            load_grammar_file(config.grammar_dir.join(GRAMMAR_PREPROCESSOR_FILENAME))?;
        let pass_grammar = load_grammar_file(config.grammar_dir.join(GRAMMAR_PASS_FILENAME))?;
        let framegraph_grammar =
            load_grammar_file(config.grammar_dir.join(GRAMMAR_FRAMEGRAPH_FILENAME))?;

        let dirty = Arc::new(AtomicBool::new(true));
        let watcher = Self::start_watcher(&config.framegraph_dir, dirty.clone());

        Ok(Self {
            config,
            preprocessor_grammar,
            pass_grammar,
            framegraph_grammar,
            dirty,
            _watcher: watcher,
        })
    }

    fn start_watcher(dir: &Path, dirty: Arc<AtomicBool>) -> Option<notify::RecommendedWatcher> {
        let result = notify::recommended_watcher(move |event: Result<notify::Event, _>| {
            if event.is_ok() {
                dirty.store(true, Ordering::Release);
            }
        });

        match result {
            Ok(mut watcher) => match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => Some(watcher),
                Err(err) => {
                    warn!("can't watch frame graph directory {dir:?}: {err}");
                    None
                }
            },
            Err(err) => {
                warn!("can't create frame graph watcher: {err}");
                None
            }
        }
    }

    /// Whether the frame-graph directory changed since the last build.
    pub fn is_source_changed(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Forces the next [`FrameGraphBuilder::build_if_changed`] to rebuild.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Rebuilds if the sources changed. Drains all in-flight frames first, so
    /// no GPU work can still reference the graph being replaced. On failure
    /// the caller keeps its current graph; the dirty flag is consumed either
    /// way, so a broken edit doesn't rebuild in a loop until the next change.
    pub fn build_if_changed(
        &mut self,
        device: &dyn Device,
        host: &mut dyn RendererHost,
    ) -> Result<Option<FrameGraph>, GraphBuildError> {
        if !self.is_source_changed() {
            return Ok(None);
        }

        host.flush_all_frames();
        self.dirty.store(false, Ordering::Release);

        self.build(device, host.draw_area_size()).map(Some)
    }

    /// Unconditional build against the current sources.
    pub fn build(
        &self,
        device: &dyn Device,
        draw_area: (u32, u32),
    ) -> Result<FrameGraph, GraphBuildError> {
        info!("building frame graph from {:?}", self.config.framegraph_dir);

        let pass_files = self.load_pass_files()?;
        let pass_files = self.preprocess_pass_files(pass_files)?;

        let mut sources = Vec::with_capacity(pass_files.len());
        for (name, content) in &pass_files {
            debug!("parsing pass file: {name}");
            sources.push(parse_pass_source(&self.pass_grammar, name, content, draw_area)?);
        }

        validate_resources(&sources)?;

        let (framegraph_file, framegraph_text) = self.load_frame_graph_file()?;
        let pass_order =
            parse_frame_graph(&self.framegraph_grammar, &framegraph_file, &framegraph_text)?;

        let mut graph = FrameGraph::default();
        for pass_name in &pass_order {
            debug!("compiling pass: {pass_name}");

            let position = sources
                .iter()
                .position(|source| &source.name == pass_name)
                .ok_or_else(|| {
                    GraphBuildError::ConfigMissing(format!(
                        "pass `{pass_name}` is listed in the frame graph but has no source file"
                    ))
                })?;

            // The source's life ends here; compilation consumes it
            let source = sources.swap_remove(position);
            let parameters = compile_pass_parameters(
                device,
                source,
                &mut graph.passes_global_res,
                &mut graph.obj_global_res_template,
            )?;

            graph.passes.push(Pass::from_parameters(parameters));
        }

        info!(
            "frame graph built: {} passes, {} shared pass-global arguments",
            graph.passes.len(),
            graph.passes_global_res.len()
        );

        Ok(graph)
    }

    /// Pass name -> file content, sorted by name so that every build sees the
    /// same order regardless of directory iteration order.
    fn load_pass_files(&self) -> Result<Vec<(String, String)>, GraphBuildError> {
        let dir = &self.config.framegraph_dir;
        let entries = fs::read_dir(dir)
            .map_err(|_| GraphBuildError::ConfigMissing(dir.display().to_string()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PASS_EXT) {
                continue;
            }

            let name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();

            debug!("reading pass file: {}", path.display());
            files.push((name, fs::read_to_string(&path)?));
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    fn preprocess_pass_files(
        &self,
        files: Vec<(String, String)>,
    ) -> Result<Vec<(String, String)>, GraphBuildError> {
        files
            .into_iter()
            .map(|(name, content)| {
                let file = format!("{name}.{PASS_EXT}");
                let includes =
                    preprocessor::collect_includes(&self.preprocessor_grammar, &file, &content)?;
                let processed = preprocessor::substitute(
                    &self.preprocessor_grammar,
                    &file,
                    &content,
                    &includes,
                    |include_name| {
                        let path = self.config.framegraph_dir.join(include_name);
                        fs::read_to_string(&path).map_err(|_| {
                            GraphBuildError::ConfigMissing(path.display().to_string())
                        })
                    },
                )?;
                Ok((name, processed))
            })
            .collect()
    }

    /// The single `*.framegraph` file in the frame-graph directory.
    fn load_frame_graph_file(&self) -> Result<(String, String), GraphBuildError> {
        let dir = &self.config.framegraph_dir;
        let entries = fs::read_dir(dir)
            .map_err(|_| GraphBuildError::ConfigMissing(dir.display().to_string()))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(FRAMEGRAPH_EXT) {
                debug!("reading frame graph file: {}", path.display());
                let name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or_default()
                    .to_string();
                return Ok((name, fs::read_to_string(&path)?));
            }
        }

        Err(GraphBuildError::ConfigMissing(format!(
            "no .{FRAMEGRAPH_EXT} file in {}",
            dir.display()
        )))
    }
}

/// Convenience for binaries: the default on-disk layout relative to a root.
pub fn default_config(root: impl Into<PathBuf>) -> GraphConfig {
    let root = root.into();
    GraphConfig {
        grammar_dir: root.join("assets/grammar"),
        framegraph_dir: root.join("assets/framegraph"),
        data_dir: root.join("assets/data"),
    }
}
