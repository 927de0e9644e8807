use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default allocation alignment: the widest supported element type.
pub const DEFAULT_ALIGNMENT: usize = std::mem::size_of::<u64>();

/// Which rewrite families `Graph::optimize` applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    /// No rewrites
    None,
    /// Transpose pair elimination only
    Basic,
    /// Transpose elimination and transpose folding into MatMul (default)
    Standard,
}

impl Default for OptimizationLevel {
    fn default() -> Self {
        OptimizationLevel::Standard
    }
}

/// Options for graph planning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerOptions {
    /// Byte alignment applied to every allocator request
    pub alignment: usize,
    /// Level of optimization to apply
    pub optimization_level: OptimizationLevel,
    /// Run structural validation after every optimization pass
    pub validate_after_passes: bool,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            optimization_level: OptimizationLevel::Standard,
            validate_after_passes: cfg!(debug_assertions),
        }
    }
}

impl PlannerOptions {
    /// Create a new options object with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let options: PlannerOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Check that the options describe a usable planner
    pub fn validate(&self) -> Result<()> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(self.alignment));
        }
        Ok(())
    }

    /// Set the allocation alignment
    pub fn set_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the optimization level
    pub fn set_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    /// Enable or disable validation after each optimization pass
    pub fn validate_after_passes(mut self, enable: bool) -> Self {
        self.validate_after_passes = enable;
        self
    }
}
