//! Stdio tool server
//!
//! Helper for writing local tool endpoints in Rust. A binary registers its
//! `ToolHandler`s and calls [`serve_stdio`]; the engine's local transport
//! then spawns it and exchanges one JSON object per line.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::EngineError;
use crate::types::{CallParams, LocalMethod, LocalRequest, LocalResponse, ToolList, ToolSpec};

/// A tool served by a local endpoint
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Advertised spec, returned from `list_tools`
    fn spec(&self) -> ToolSpec;

    /// Execute with the given arguments
    async fn call(&self, arguments: Value) -> Result<Value, EngineError>;
}

/// A set of handlers addressable by tool name
#[derive(Default, Clone)]
pub struct ToolSet {
    order: Vec<String>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later handler with the same name replaces it
    pub fn with(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        let name = handler.spec().name;
        if !self.handlers.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.handlers.insert(name, handler);
        self
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .map(|h| h.spec())
            .collect()
    }

    /// Answer one request frame
    pub async fn handle(&self, request: LocalRequest) -> LocalResponse {
        match request.method {
            LocalMethod::ListTools => {
                let list = ToolList {
                    tools: self.specs(),
                };
                match serde_json::to_value(list) {
                    Ok(value) => LocalResponse::result(request.id, value),
                    Err(e) => LocalResponse::error(request.id, e.to_string()),
                }
            }
            LocalMethod::CallTool => {
                let params: CallParams = match serde_json::from_value(request.params) {
                    Ok(p) => p,
                    Err(e) => {
                        return LocalResponse::error(
                            request.id,
                            format!("invalid call_tool params: {}", e),
                        )
                    }
                };
                let Some(handler) = self.handlers.get(&params.name) else {
                    return LocalResponse::error(
                        request.id,
                        EngineError::ToolNotFound(params.name).to_string(),
                    );
                };
                match handler.call(params.arguments).await {
                    Ok(value) => LocalResponse::result(request.id, value),
                    Err(e) => LocalResponse::error(request.id, e.to_string()),
                }
            }
        }
    }
}

/// Serve requests from `reader` until EOF, writing one response per line.
///
/// Lines that are not valid request frames are skipped; without an id
/// there is nobody to answer.
pub async fn serve<R, W>(tools: &ToolSet, reader: R, mut writer: W) -> Result<(), EngineError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: LocalRequest = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("skipping malformed request: {}", e);
                continue;
            }
        };

        let response = tools.handle(request).await;
        let mut encoded = serde_json::to_string(&response)
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Serve on this process's stdin/stdout
pub async fn serve_stdio(tools: &ToolSet) -> Result<(), EngineError> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(tools, stdin, stdout).await
}
