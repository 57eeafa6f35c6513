//! Read-only GitHub server behind the `github.read` scope

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ToolDescriptor, ToolServer, ToolServerError};

pub const SERVER_ID: &str = "github_server";
const API_BASE: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListFilesInput {
    repo: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadFileInput {
    repo: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct FileContent {
    content: String,
}

/// Read-only GitHub integration. The permission gate denies `github.read`
/// before invocation when no token is configured, so `invoke` may assume a
/// token in the happy path.
pub struct GithubServer {
    token: Option<String>,
    client: reqwest::Client,
    api_base: String,
}

impl GithubServer {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    async fn fetch(&self, url: &str) -> Result<reqwest::Response, ToolServerError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| ToolServerError::Transport("github token not configured".into()))?;
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {token}"))
            .header("User-Agent", "runway")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ToolServerError::Application(json!({
                "error": "github_status",
                "status": response.status().as_u16(),
            })));
        }
        Ok(response)
    }

    async fn list_files(&self, input: ListFilesInput) -> Result<Value, ToolServerError> {
        let path = input.path.unwrap_or_default();
        let url = format!("{}/repos/{}/contents/{}", self.api_base, input.repo, path);
        let entries: Vec<ContentEntry> = self
            .fetch(&url)
            .await?
            .json()
            .await
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        let files: Vec<String> = entries.into_iter().map(|e| e.name).collect();
        Ok(json!({"files": files}))
    }

    async fn read_file(&self, input: ReadFileInput) -> Result<Value, ToolServerError> {
        let url = format!(
            "{}/repos/{}/contents/{}",
            self.api_base, input.repo, input.path
        );
        let file: FileContent = self
            .fetch(&url)
            .await?
            .json()
            .await
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        let cleaned: String = file.content.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| ToolServerError::Transport(format!("content decode: {e}")))?;
        let content = String::from_utf8_lossy(&decoded).to_string();
        Ok(json!({"content": content}))
    }
}

#[async_trait]
impl ToolServer for GithubServer {
    fn server_id(&self) -> &str {
        SERVER_ID
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "github.list_files".to_string(),
                description: "List files within a GitHub repository path.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "repo": {"type": "string", "description": "owner/repo identifier"},
                        "path": {"type": "string", "description": "Directory to list"}
                    },
                    "required": ["repo"],
                    "additionalProperties": false
                }),
                permission_scope: "github.read".to_string(),
                server_id: SERVER_ID.to_string(),
                source: "external".to_string(),
                read_only: true,
            },
            ToolDescriptor {
                name: "github.read_file".to_string(),
                description: "Read the content of a GitHub repository file.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "repo": {"type": "string", "description": "owner/repo identifier"},
                        "path": {"type": "string", "description": "File path to read"}
                    },
                    "required": ["repo", "path"],
                    "additionalProperties": false
                }),
                permission_scope: "github.read".to_string(),
                server_id: SERVER_ID.to_string(),
                source: "external".to_string(),
                read_only: true,
            },
        ]
    }

    fn validate(&self, tool_name: &str, arguments: &Value) -> Result<(), ToolServerError> {
        match tool_name {
            "github.list_files" => serde_json::from_value::<ListFilesInput>(arguments.clone())
                .map(|_| ())
                .map_err(|e| ToolServerError::InvalidArguments(e.to_string())),
            "github.read_file" => serde_json::from_value::<ReadFileInput>(arguments.clone())
                .map(|_| ())
                .map_err(|e| ToolServerError::InvalidArguments(e.to_string())),
            _ => Err(ToolServerError::UnknownTool(tool_name.to_string())),
        }
    }

    async fn invoke(&self, tool_name: &str, arguments: &Value) -> Result<Value, ToolServerError> {
        match tool_name {
            "github.list_files" => {
                let input = serde_json::from_value(arguments.clone())
                    .map_err(|e| ToolServerError::InvalidArguments(e.to_string()))?;
                self.list_files(input).await
            }
            "github.read_file" => {
                let input = serde_json::from_value(arguments.clone())
                    .map_err(|e| ToolServerError::InvalidArguments(e.to_string()))?;
                self.read_file(input).await
            }
            _ => Err(ToolServerError::UnknownTool(tool_name.to_string())),
        }
    }
}
