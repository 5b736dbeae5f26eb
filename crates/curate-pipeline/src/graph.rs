//! The stage graph and its orchestrator.
//!
//! A [`PipelineGraph`] is a set of named stages, each reading either the
//! pipeline root directory or one earlier stage's output. Stages run
//! strictly one after another in dependency order: a stage starts only
//! after its predecessor's output is committed.
//!
//! # Invalidation
//!
//! Invalidation is coarse and forward-only. Once any stage recomputes
//! during a run, every stage that runs after it recomputes too, even if
//! its own cache entry looks reusable. Stale upstream data is never
//! served, at the cost of some redundant work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::cache::CacheStore;
use crate::diagnostics::{Clock, RunDiagnostics, StageDiagnostics, SystemClock};
use crate::stage::{StageOutcome, StageRecord, StageState, StageTransform};
use crate::types::{PipelineConfig, PipelineError};

/// Where a stage reads its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInput {
    /// The pipeline root input directory.
    Root,
    /// The committed output of the named stage.
    Stage(String),
}

/// Graph node: the root input, or a stage.
enum Node {
    Root,
    Stage(StageNode),
}

struct StageNode {
    name: String,
    transform: Box<dyn StageTransform>,
}

/// A dependency graph of pipeline stages.
///
/// Stages are added with [`add_stage`](Self::add_stage) (explicit
/// predecessor) or [`then`](Self::then) (chain onto the last stage). A
/// predecessor must be added before the stages that read from it, so
/// the graph is acyclic by construction.
pub struct PipelineGraph {
    graph: DiGraph<Node, ()>,
    root: NodeIndex,
    last: Option<NodeIndex>,
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl PipelineGraph {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        let mut graph = DiGraph::new();
        let root = graph.add_node(Node::Root);
        Self {
            graph,
            root,
            last: None,
        }
    }

    /// Add a stage named `name` that reads from `input`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidGraph`] if the name is empty or
    /// already taken, or if `input` names a stage that has not been added.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        input: StageInput,
        transform: impl StageTransform + 'static,
    ) -> Result<&mut Self, PipelineError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PipelineError::InvalidGraph(
                "stage name must not be empty".to_string(),
            ));
        }
        if self.find(&name).is_some() {
            return Err(PipelineError::InvalidGraph(format!(
                "duplicate stage name `{name}`"
            )));
        }
        let predecessor = match input {
            StageInput::Root => self.root,
            StageInput::Stage(ref upstream) => self.find(upstream).ok_or_else(|| {
                PipelineError::InvalidGraph(format!(
                    "stage `{name}` reads from unknown stage `{upstream}`"
                ))
            })?,
        };

        let node = self.graph.add_node(Node::Stage(StageNode {
            name,
            transform: Box::new(transform),
        }));
        self.graph.add_edge(predecessor, node, ());
        self.last = Some(node);
        Ok(self)
    }

    /// Add a stage that reads from the most recently added stage, or from
    /// the root input when the graph is empty.
    ///
    /// # Errors
    ///
    /// See [`add_stage`](Self::add_stage).
    pub fn then(
        &mut self,
        name: impl Into<String>,
        transform: impl StageTransform + 'static,
    ) -> Result<&mut Self, PipelineError> {
        let input = match self.last.and_then(|idx| self.stage_name(idx)) {
            Some(previous) => StageInput::Stage(previous.to_string()),
            None => StageInput::Root,
        };
        self.add_stage(name, input, transform)
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count() - 1
    }

    /// Whether the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.order()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|idx| self.stage_name(idx))
            .collect()
    }

    /// Run every stage against `root`, using `store` as the cache.
    ///
    /// The run never panics on stage failure; the returned [`PipelineRun`]
    /// records how far it got and why it stopped.
    pub fn run(&self, store: &CacheStore, root: &Path, config: &PipelineConfig) -> PipelineRun {
        self.run_with_clock(store, root, config, &SystemClock)
    }

    /// [`run`](Self::run) with an injected clock for stage timings.
    pub fn run_with_clock<K: Clock>(
        &self,
        store: &CacheStore,
        root: &Path,
        config: &PipelineConfig,
        clock: &K,
    ) -> PipelineRun {
        let started = clock.now();
        let mut run = PipelineRun {
            stages: Vec::new(),
            total_duration: Duration::ZERO,
            failure: None,
        };

        let order = match self.prepare(root, config) {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(error = %e, "pipeline aborted before any stage ran");
                run.failure = Some(e);
                run.total_duration = clock.elapsed(&started);
                return run;
            }
        };

        run.stages = order
            .iter()
            .filter_map(|&idx| self.stage_name(idx))
            .map(StageRecord::pending)
            .collect();

        let mut outputs: Vec<Option<PathBuf>> = vec![None; self.graph.node_count()];
        outputs[self.root.index()] = Some(root.to_path_buf());
        let mut upstream_recomputed = false;

        for (slot, &idx) in order.iter().filter(|&&idx| idx != self.root).enumerate() {
            let Node::Stage(stage) = &self.graph[idx] else {
                continue;
            };
            let stage_started = clock.now();
            let record = &mut run.stages[slot];
            let input_dir = self.input_of(idx).and_then(|p| outputs[p.index()].clone());
            let Some(input_dir) = input_dir else {
                run.failure = Some(PipelineError::InvalidGraph(format!(
                    "stage `{}` has no resolved input",
                    stage.name
                )));
                break;
            };

            let result = execute(stage, store, &input_dir, config, upstream_recomputed, record);
            record.input_dir = Some(input_dir);
            record.duration = clock.elapsed(&stage_started);

            match result {
                Ok(output_dir) => {
                    upstream_recomputed |= record.recomputed();
                    outputs[idx.index()] = Some(output_dir);
                }
                Err(e) => {
                    tracing::error!(stage = %stage.name, error = %e, "stage failed, aborting run");
                    run.failure = Some(e);
                    break;
                }
            }
        }

        run.total_duration = clock.elapsed(&started);
        run
    }

    /// Validate inputs and compute the execution order.
    fn prepare(&self, root: &Path, config: &PipelineConfig) -> Result<Vec<NodeIndex>, PipelineError> {
        config.validate()?;
        if !root.is_dir() {
            return Err(PipelineError::InputNotFound {
                path: root.to_path_buf(),
            });
        }
        self.order()
    }

    fn order(&self) -> Result<Vec<NodeIndex>, PipelineError> {
        toposort(&self.graph, None).map_err(|cycle| {
            PipelineError::InvalidGraph(format!(
                "cycle through stage `{}`",
                self.stage_name(cycle.node_id()).unwrap_or("<root>")
            ))
        })
    }

    fn find(&self, name: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&idx| self.stage_name(idx) == Some(name))
    }

    fn stage_name(&self, idx: NodeIndex) -> Option<&str> {
        match &self.graph[idx] {
            Node::Stage(stage) => Some(&stage.name),
            Node::Root => None,
        }
    }

    fn input_of(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .next()
    }
}

/// Resolve one stage and, if needed, recompute it. Returns the committed
/// output directory.
fn execute(
    stage: &StageNode,
    store: &CacheStore,
    input_dir: &Path,
    config: &PipelineConfig,
    upstream_recomputed: bool,
    record: &mut StageRecord,
) -> Result<PathBuf, PipelineError> {
    let name = stage.name.as_str();
    let snapshot = stage
        .transform
        .config_scope()
        .snapshot(config)
        .map_err(|source| PipelineError::Key {
            stage: name.to_string(),
            source,
        })?;
    let resolution = store
        .resolve(name, &snapshot, input_dir)
        .map_err(|e| e.for_stage(name))?;
    record.key = Some(resolution.key.clone());
    record.input_fingerprint = Some(resolution.input_fingerprint.clone());

    if resolution.reused && !upstream_recomputed {
        record.advance(StageState::CacheHit);
        record.advance(StageState::Done(StageOutcome::Reused));
        record.output_dir = Some(resolution.output_dir.clone());
        return Ok(resolution.output_dir);
    }

    record.advance(StageState::Recomputing);
    if resolution.reused {
        record.invalidated = true;
        tracing::info!(stage = name, entry = %resolution.key, "upstream recomputed, forcing recompute");
    }

    let pending = store.begin(&resolution).map_err(|e| e.for_stage(name))?;
    let metrics = stage
        .transform
        .run(input_dir, pending.path(), config)
        .map_err(|source| PipelineError::Transform {
            stage: name.to_string(),
            key: resolution.key.dir_name(),
            source,
        })?;
    let output_dir = pending.commit().map_err(|e| e.for_stage(name))?;

    tracing::info!(
        stage = name,
        entry = %resolution.key,
        files_read = metrics.files_read,
        files_written = metrics.files_written,
        "stage recomputed"
    );
    record.metrics = Some(metrics);
    record.output_dir = Some(output_dir.clone());
    record.advance(StageState::Done(StageOutcome::Recomputed));
    Ok(output_dir)
}

/// The result of one pipeline run.
///
/// Stage records are kept even when the run fails, so callers can see
/// which stages finished, which one failed, and which never started.
#[derive(Debug)]
pub struct PipelineRun {
    /// One record per stage, in execution order.
    pub stages: Vec<StageRecord>,
    /// Wall-clock time for the whole run.
    pub total_duration: Duration,
    /// The error that aborted the run, if any.
    pub failure: Option<PipelineError>,
}

impl PipelineRun {
    /// Whether every stage finished.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.stages.iter().all(|s| s.state.is_done())
    }

    /// Record for the named stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Output directory of the last stage, when the run succeeded.
    #[must_use]
    pub fn final_output(&self) -> Option<&Path> {
        if !self.is_success() {
            return None;
        }
        self.stages.last().and_then(|s| s.output_dir.as_deref())
    }

    /// Number of transforms that ran to completion.
    #[must_use]
    pub fn recomputed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.recomputed()).count()
    }

    /// Serializable view of this run.
    #[must_use]
    pub fn diagnostics(&self) -> RunDiagnostics {
        RunDiagnostics {
            stages: self.stages.iter().map(StageDiagnostics::from).collect(),
            total_duration: self.total_duration,
            error: self.failure.as_ref().map(ToString::to_string),
        }
    }

    /// The final output directory, or the error that stopped the run.
    ///
    /// # Errors
    ///
    /// Returns the recorded failure, or [`PipelineError::InvalidGraph`]
    /// for a graph with no stages.
    pub fn into_result(self) -> Result<PathBuf, PipelineError> {
        if let Some(e) = self.failure {
            return Err(e);
        }
        self.stages
            .into_iter()
            .last()
            .and_then(|s| s.output_dir)
            .ok_or_else(|| PipelineError::InvalidGraph("pipeline has no stages".to_string()))
    }
}
