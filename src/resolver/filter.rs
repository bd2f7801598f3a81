//! Decides which modules are converted and which stay as loaded.

use crate::core::ValidatedConfig;
use crate::model::ParameterTree;
use crate::utils::is_within;

/// `name` is excluded by `entry` when it is `entry` or a dotted descendant of it.
fn matches_any<'a>(name: &str, entries: impl IntoIterator<Item = &'a String>) -> bool {
    entries.into_iter().any(|entry| is_within(name, entry))
}

pub fn should_quantize(config: &ValidatedConfig, module: &str) -> bool {
    !matches_any(module, &config.excluded_module_names)
}

#[derive(Debug, Clone)]
pub struct ModuleFilter {
    config: ValidatedConfig,
    keep_in_fp32: Vec<String>,
}

impl ModuleFilter {
    pub fn new(config: ValidatedConfig, keep_in_fp32: Vec<String>) -> Self {
        Self {
            config,
            keep_in_fp32,
        }
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn should_quantize(&self, module: &str) -> bool {
        should_quantize(&self.config, module) && !self.keeps_fp32(module)
    }

    pub fn keeps_fp32(&self, module: &str) -> bool {
        matches_any(module, &self.keep_in_fp32)
    }

    /// Exclusion entries that name no module or ancestor in `tree`.
    pub fn unmatched_exclusions(&self, tree: &ParameterTree) -> Vec<String> {
        self.config
            .excluded_module_names
            .iter()
            .filter(|entry| !tree.covers(entry))
            .cloned()
            .collect()
    }
}
