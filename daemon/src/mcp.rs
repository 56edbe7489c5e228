//! MCP server implementation using rmcp.
//!
//! Exposes the runner as a single `run` tool over stdio.

use std::fmt::Write;
use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{error, info};

use crate::request::ExecutionRequest;
use crate::runner::{RunError, Runner};

/// MCP server for running Swift snippets.
#[derive(Clone)]
pub struct RunnerServer {
    runner: Arc<Runner>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the run tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunParams {
    /// Toolchain version, e.g. "5.10" or "nightly-main".
    #[schemars(description = "Swift toolchain version, e.g. '5.10' or 'nightly-main'")]
    pub version: String,

    /// The Swift source to run.
    #[schemars(description = "The Swift source code to run")]
    pub code: String,

    /// "swift" (default) or "swiftc".
    #[schemars(description = "Driver to use: 'swift' (default) or 'swiftc'")]
    #[serde(default)]
    pub command: Option<String>,

    /// Extra compiler options.
    #[schemars(description = "Extra compiler options")]
    #[serde(default)]
    pub options: Option<String>,

    /// Timeout in seconds (clamped to 30..=600).
    #[schemars(description = "Timeout in seconds, clamped to 30..=600")]
    #[serde(default)]
    pub timeout: Option<i64>,
}

impl From<RunParams> for ExecutionRequest {
    fn from(params: RunParams) -> Self {
        Self {
            command: params.command,
            options: params.options,
            code: Some(params.code),
            timeout: params.timeout,
            color: Some(false),
            nonce: None,
        }
    }
}

#[tool_router]
impl RunnerServer {
    /// Create a new runner server.
    pub fn new(runner: Arc<Runner>) -> Self {
        Self {
            runner,
            tool_router: Self::tool_router(),
        }
    }

    /// Run Swift code in a disposable container.
    #[tool(description = "Run Swift code in a disposable container and return its output")]
    async fn run(
        &self,
        Parameters(params): Parameters<RunParams>,
    ) -> Result<CallToolResult, McpError> {
        let version = params.version.clone();
        info!(version = %version, code_len = params.code.len(), "Running code");

        match self.runner.run(&version, params.into()).await {
            Ok(result) => {
                let is_error = result.output.is_empty() && !result.errors.is_empty();

                let mut text = if result.errors.is_empty() {
                    result.output
                } else if result.output.is_empty() {
                    result.errors
                } else {
                    format!("{}\n--- stderr ---\n{}", result.output, result.errors)
                };
                let _ = write!(text, "\n--- version ---\n{}", result.version.trim_end());

                if is_error {
                    Ok(CallToolResult::error(vec![Content::text(text)]))
                } else {
                    Ok(CallToolResult::success(vec![Content::text(text)]))
                }
            }
            Err(e @ RunError::Invalid(_)) => Err(McpError::invalid_params(e.to_string(), None)),
            Err(e) => {
                error!(error = %e, "Run failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "Execution error: {e}"
                ))]))
            }
        }
    }
}

#[tool_handler]
impl ServerHandler for RunnerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "swift-runner".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Run Swift code in a disposable container.\n\
                 \n\
                 Use the 'run' tool with:\n\
                 - version: toolchain version, e.g. '5.10'\n\
                 - code: the Swift source to run"
                    .to_string(),
            ),
        }
    }
}

/// Serve the runner over stdio.
pub async fn serve_stdio(runner: Arc<Runner>) -> anyhow::Result<()> {
    let server = RunnerServer::new(runner);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
