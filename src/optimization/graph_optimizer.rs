use std::time::Duration;

use log::debug;

use crate::config::OptimizationLevel;
use crate::error::Result;
use crate::graph::Graph;

/// Outcome of one pass over a graph
#[derive(Debug, Clone)]
pub struct PassResult {
    pub name: String,
    /// Rewrites applied by the pass
    pub optimizations_applied: usize,
    pub duration: Duration,
    pub changed: bool,
}

/// Per-pass results of one `GraphOptimizer::run`, with running totals
#[derive(Debug, Clone, Default)]
pub struct OptimizationStats {
    pub pass_results: Vec<PassResult>,
    pub total_optimizations: usize,
    pub total_duration: Duration,
}

impl OptimizationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pass_result(&mut self, result: PassResult) {
        self.total_optimizations += result.optimizations_applied;
        self.total_duration += result.duration;
        self.pass_results.push(result);
    }
}

/// A rewrite over the whole graph. Edges must be left consistent on `Ok`.
pub trait OptimizationPass {
    fn name(&self) -> &str;

    fn run(&self, graph: &mut Graph) -> Result<PassResult>;
}

/// Runs its passes once each, in registration order
pub struct GraphOptimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl GraphOptimizer {
    /// Create an optimizer with no passes
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Create an optimizer with the passes of the given level
    pub fn for_level(level: OptimizationLevel) -> Self {
        let mut optimizer = Self::new();
        for pass in Self::create_default_passes(level) {
            optimizer.register_pass(pass);
        }
        optimizer
    }

    pub fn register_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn num_passes(&self) -> usize {
        self.passes.len()
    }

    /// Passes enabled by `level`: none, pair elimination, or both transpose families
    pub fn create_default_passes(level: OptimizationLevel) -> Vec<Box<dyn OptimizationPass>> {
        use crate::optimization::passes::fusion::TransposeFusion;

        match level {
            OptimizationLevel::None => Vec::new(),
            OptimizationLevel::Basic => {
                vec![Box::new(TransposeFusion::elimination_only()) as Box<dyn OptimizationPass>]
            }
            OptimizationLevel::Standard => {
                vec![Box::new(TransposeFusion::new()) as Box<dyn OptimizationPass>]
            }
        }
    }

    /// Run every registered pass once, optionally validating the graph after each
    pub fn run(&self, graph: &mut Graph, validate: bool) -> Result<OptimizationStats> {
        let mut stats = OptimizationStats::new();

        for pass in &self.passes {
            let result = pass.run(graph)?;
            debug!(
                "pass {} applied {} rewrites in {:?}",
                result.name, result.optimizations_applied, result.duration
            );
            if validate {
                graph.check_valid()?;
            }
            stats.add_pass_result(result);
        }

        Ok(stats)
    }
}

impl Default for GraphOptimizer {
    fn default() -> Self {
        Self::new()
    }
}
