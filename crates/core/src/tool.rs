//! Tool catalog and the ToolExecutor collaborator.
//!
//! The driver never runs tools itself. It resolves the server a tool lives
//! on from the session's [`ToolCatalog`] and hands the call to a
//! [`ToolExecutor`]. [`ToolRegistry`] is the in-process executor for tools
//! implemented directly in Rust.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::backend::ToolDefinition;
use crate::error::ToolError;

/// Metadata of the server hosting a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServer {
    /// Stable server identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Transport details, auth hints, etc.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ToolServer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// One tool the model may call, with the server that executes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub definition: ToolDefinition,
    pub server: ToolServer,
}

/// The set of tools offered to the model for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCatalog {
    entries: Vec<CatalogEntry>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A later entry with the same name shadows an earlier one.
    pub fn add(&mut self, definition: ToolDefinition, server: ToolServer) {
        self.entries.retain(|e| e.definition.name != definition.name);
        self.entries.push(CatalogEntry { definition, server });
    }

    /// Builder form of [`ToolCatalog::add`].
    pub fn with(mut self, definition: ToolDefinition, server: ToolServer) -> Self {
        self.add(definition, server);
        self
    }

    /// Definitions to advertise to the backend, in insertion order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }

    /// Find the server hosting `name`.
    pub fn resolve(&self, name: &str) -> Option<&ToolServer> {
        self.entries
            .iter()
            .find(|e| e.definition.name == name)
            .map(|e| &e.server)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One piece of tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    Json { value: serde_json::Value },
    Image { mime_type: String, data: String },
}

/// The structured result of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,

    /// The tool ran but reports failure.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Flatten the content into the text that goes back into history.
    pub fn to_text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolContent::Text { text } => text.clone(),
                ToolContent::Json { value } => value.to_string(),
                ToolContent::Image { mime_type, .. } => format!("[image: {mime_type}]"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Executes tool calls on behalf of the agent loop.
///
/// An `Err` is treated exactly like an `Ok` output with `is_error = true`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call(
        &self,
        name: &str,
        arguments: &str,
        server: &ToolServer,
    ) -> std::result::Result<ToolOutput, ToolError>;
}

/// A tool implemented in-process.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "search").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of in-process tools, usable as a [`ToolExecutor`].
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Build a catalog advertising every registered tool as hosted by `server`.
    /// Tools are sorted by name so the catalog order is stable.
    pub fn catalog(&self, server: &ToolServer) -> ToolCatalog {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        let mut catalog = ToolCatalog::new();
        for name in names {
            if let Some(tool) = self.tools.get(name) {
                catalog.add(tool.to_definition(), server.clone());
            }
        }
        catalog
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn call(
        &self,
        name: &str,
        arguments: &str,
        _server: &ToolServer,
    ) -> std::result::Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let args: serde_json::Value = if arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(arguments)
                .map_err(|e| ToolError::InvalidArguments(format!("{name}: {e}")))?
        };
        tool.execute(args).await
    }
}
