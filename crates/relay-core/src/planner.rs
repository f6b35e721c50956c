use std::collections::{HashMap, HashSet};

use crate::error::RelayError;
use crate::types::{ExecutionMode, PipelineConfig, StageConfig};

/// A set of stages whose dependencies are all satisfied by earlier layers.
/// In parallel mode the whole layer runs concurrently.
#[derive(Debug, Clone)]
pub struct Layer {
    pub stages: Vec<StageConfig>,
    /// Last non-empty layer; its stages receive loop-continuation
    /// instructions when looping is enabled.
    pub is_final: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub layers: Vec<Layer>,
}

impl ExecutionPlan {
    pub fn stage_count(&self) -> usize {
        self.layers.iter().map(|l| l.stages.len()).sum()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.layers
            .iter()
            .flat_map(|l| l.stages.iter().map(|s| s.name.as_str()))
            .collect()
    }
}

/// Transform the declared stages into an ordered list of layers.
///
/// Kahn's algorithm with stable tie-breaking: within a layer, stages keep
/// their declaration order. Disabled stages are filtered out and count as
/// already-satisfied for their dependents. Sequential mode degenerates every
/// stage into its own single-element layer, preserving topological order.
pub fn plan(config: &PipelineConfig) -> Result<ExecutionPlan, RelayError> {
    let mut seen = HashSet::new();
    for stage in &config.stages {
        if !seen.insert(stage.name.as_str()) {
            return Err(RelayError::Configuration(format!(
                "duplicate stage name '{}'",
                stage.name
            )));
        }
    }

    let declared: HashSet<&str> = config.stages.iter().map(|s| s.name.as_str()).collect();
    for stage in &config.stages {
        for dep in &stage.depends_on {
            if !declared.contains(dep.as_str()) {
                return Err(RelayError::Configuration(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.name, dep
                )));
            }
            if dep == &stage.name {
                return Err(RelayError::Configuration(format!(
                    "stage '{}' depends on itself",
                    stage.name
                )));
            }
        }
    }

    let enabled: Vec<&StageConfig> = config.stages.iter().filter(|s| s.enabled).collect();
    let enabled_names: HashSet<&str> = enabled.iter().map(|s| s.name.as_str()).collect();

    // Remaining unsatisfied dependencies per enabled stage; dependencies on
    // disabled stages are satisfied from the start.
    let pending: HashMap<&str, HashSet<&str>> = enabled
        .iter()
        .map(|s| {
            let deps = s
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| enabled_names.contains(d))
                .collect::<HashSet<_>>();
            (s.name.as_str(), deps)
        })
        .collect();

    let mut layers: Vec<Vec<StageConfig>> = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();

    while placed.len() < enabled.len() {
        // Declaration-order scan keeps the tie-break stable.
        let ready: Vec<&StageConfig> = enabled
            .iter()
            .filter(|s| {
                !placed.contains(s.name.as_str())
                    && pending[s.name.as_str()].iter().all(|d| placed.contains(d))
            })
            .copied()
            .collect();

        if ready.is_empty() {
            let stuck: Vec<&str> = enabled
                .iter()
                .map(|s| s.name.as_str())
                .filter(|n| !placed.contains(n))
                .collect();
            return Err(RelayError::Configuration(format!(
                "dependency cycle among stages: {}",
                stuck.join(", ")
            )));
        }

        for stage in &ready {
            placed.insert(stage.name.as_str());
        }
        layers.push(ready.into_iter().cloned().collect());
    }

    if config.execution.mode == ExecutionMode::Sequential {
        layers = layers
            .into_iter()
            .flatten()
            .map(|stage| vec![stage])
            .collect();
    }

    let count = layers.len();
    let layers = layers
        .into_iter()
        .enumerate()
        .map(|(i, stages)| Layer {
            stages,
            is_final: i + 1 == count,
        })
        .collect();

    Ok(ExecutionPlan { layers })
}
