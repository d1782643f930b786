//! Agent configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Agent configuration stored in database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub icon: Option<String>,
    /// Default model selector passed to the agent binary
    pub model: String,
    pub allow_file_read: bool,
    pub allow_file_write: bool,
    pub allow_network: bool,
    pub enabled: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Agent {
    /// Create a new agent configuration
    pub fn new(id: impl Into<String>, name: impl Into<String>, command: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            icon: None,
            model: "sonnet".to_string(),
            allow_file_read: true,
            allow_file_write: true,
            allow_network: false,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}
