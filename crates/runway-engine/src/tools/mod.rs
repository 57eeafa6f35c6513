//! Tool registry and server abstractions

mod calculator;
mod github;

pub use calculator::CalculatorServer;
pub use github::GithubServer;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Structured metadata describing a tool exposed by a server.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub permission_scope: String,
    pub server_id: String,
    pub source: String,
    /// Read-only tools are eligible for result caching.
    pub read_only: bool,
}

/// Errors raised by tool servers, classified for event emission.
#[derive(Debug, thiserror::Error)]
pub enum ToolServerError {
    /// Arguments failed the tool's input schema.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The server ran but raised an application-level error payload.
    #[error("tool application error")]
    Application(Value),

    /// Transport-level failure reaching the server.
    #[error("tool transport error: {0}")]
    Transport(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// A server hosting one or more tools.
#[async_trait]
pub trait ToolServer: Send + Sync + 'static {
    fn server_id(&self) -> &str;

    fn descriptors(&self) -> Vec<ToolDescriptor>;

    /// Validate arguments against the tool's input schema without invoking
    /// the tool. Returns `InvalidArguments` on mismatch.
    fn validate(&self, tool_name: &str, arguments: &Value) -> Result<(), ToolServerError>;

    async fn invoke(&self, tool_name: &str, arguments: &Value) -> Result<Value, ToolServerError>;
}

/// In-memory registry mapping tool names to descriptors and servers.
#[derive(Default)]
pub struct ToolRegistry {
    servers: HashMap<String, Arc<dyn ToolServer>>,
    descriptors: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server and all of its tools. Duplicate tool names replace
    /// earlier registrations.
    pub fn register(&mut self, server: Arc<dyn ToolServer>) {
        for descriptor in server.descriptors() {
            self.descriptors.insert(descriptor.name.clone(), descriptor);
        }
        self.servers.insert(server.server_id().to_string(), server);
    }

    pub fn descriptor(&self, tool_name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.get(tool_name)
    }

    pub fn server_for(&self, tool_name: &str) -> Option<Arc<dyn ToolServer>> {
        let descriptor = self.descriptors.get(tool_name)?;
        self.servers.get(&descriptor.server_id).cloned()
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<_> = self.descriptors.values().cloned().collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lists_sorted_descriptors() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(GithubServer::new(None)));
        registry.register(Arc::new(CalculatorServer::new()));

        let names: Vec<String> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["calculator", "github.list_files", "github.read_file"]);
    }

    #[test]
    fn test_registry_resolves_server() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculatorServer::new()));

        assert!(registry.descriptor("calculator").is_some());
        assert!(registry.server_for("calculator").is_some());
        assert!(registry.descriptor("missing").is_none());
    }
}
