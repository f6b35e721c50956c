use std::path::Path;

use anyhow::{Context, Result};

use crate::error::RelayError;
use crate::types::PipelineConfig;

/// Load and validate a pipeline definition from a YAML file.
pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let config: PipelineConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("parse {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Shape-level validation of a pipeline config. Graph-level checks
/// (unknown dependencies, cycles, duplicate names) live in the planner.
pub fn validate(config: &PipelineConfig) -> Result<(), RelayError> {
    let fail = |msg: String| Err(RelayError::Configuration(msg));

    if config.name.trim().is_empty() {
        return fail("pipeline name must not be empty".into());
    }
    if config.git.base_branch.trim().is_empty() {
        return fail("git.baseBranch must not be empty".into());
    }
    if config.looping.enabled && config.looping.max_iterations == 0 {
        return fail("looping.maxIterations must be at least 1".into());
    }

    for stage in &config.stages {
        if stage.name.trim().is_empty() {
            return fail("stage name must not be empty".into());
        }
        if stage.agent_ref.trim().is_empty() {
            return fail(format!("stage '{}': agentRef must not be empty", stage.name));
        }
        if stage.timeout_seconds == 0 {
            return fail(format!(
                "stage '{}': timeoutSeconds must be at least 1",
                stage.name
            ));
        }
        if stage.retry.max_attempts == 0 {
            return fail(format!(
                "stage '{}': retry.maxAttempts must be at least 1",
                stage.name
            ));
        }
        if stage.retry.backoff != "exponential" {
            return fail(format!(
                "stage '{}': unsupported retry.backoff '{}'",
                stage.name, stage.retry.backoff
            ));
        }
        for (key, value) in &stage.inputs {
            if value.is_object() || value.is_array() {
                return fail(format!(
                    "stage '{}': input '{}' must be a scalar",
                    stage.name, key
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for key in &stage.declared_output_keys {
            if !seen.insert(key.as_str()) {
                return fail(format!(
                    "stage '{}': duplicate declared output key '{}'",
                    stage.name, key
                ));
            }
        }
    }

    Ok(())
}
