use crate::engine::ExecutionMode;
use serde::{Deserialize, Serialize};

/// Settings of a [`SessionTemplate`](crate::SessionTemplate) and the mapper
/// resolver built on it.
///
/// Missing fields take their defaults, unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateConfig {
    /// Execution mode of the template's sessions; the factory's default mode
    /// when unset.
    pub execution_mode: Option<ExecutionMode>,
    /// Register mappers with the factory's configuration on first resolve.
    pub add_mappers_to_config: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            execution_mode: None,
            add_mappers_to_config: true,
        }
    }
}
