//! Tool registry and dispatcher
//!
//! The registry owns every transport and knows which one exposes each tool.
//! It is built once at startup and then shared (`Arc<ToolRegistry>`) by any
//! number of sessions; after initialization it is read-only apart from the
//! per-endpoint gates.
//!
//! # Dispatch
//!
//! `dispatch` never fails. Unknown tools, invalid arguments and transport
//! errors come back as failed `ToolResult`s so the cognitive loop can store
//! them as context and re-plan.
//!
//! # Concurrency
//!
//! Calls to different endpoints run in parallel. Calls to an endpoint whose
//! transport cannot multiplex (a subprocess pipe) queue on that endpoint's
//! gate; remote endpoints have no gate.

pub mod schema;

use futures::future::join_all;
use sdk::errors::EngineError;
use sdk::types::{ToolCall, ToolResult, ToolSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EndpointConfig;
use crate::transport::{self, ToolTransport};

/// Outcome of one dispatch, annotated for observability
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The call as proposed
    pub call: ToolCall,

    pub result: ToolResult,

    /// Wall time spent inside the dispatcher, gate wait included
    pub elapsed: Duration,

    /// Endpoint that served the call, if one was found
    pub endpoint: Option<String>,
}

struct Endpoint {
    transport: Arc<dyn ToolTransport>,
    gate: Option<Mutex<()>>,
}

struct Route {
    spec: ToolSpec,
    endpoint: usize,
}

/// Registry of tools discovered across all configured endpoints
pub struct ToolRegistry {
    endpoints: Vec<Endpoint>,
    routes: HashMap<String, Route>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry with no endpoints.
    pub fn empty() -> Self {
        Self {
            endpoints: Vec::new(),
            routes: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Build transports for every endpoint and discover their tools.
    ///
    /// # Errors
    ///
    /// Returns `ToolNameCollision` when two endpoints expose the same tool
    /// name. Endpoints that cannot be reached during discovery are logged and
    /// left out.
    pub async fn initialize(endpoints: &[EndpointConfig]) -> Result<Self, EngineError> {
        let mut transports = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let transport = transport::from_config(endpoint).map_err(|e| {
                EngineError::Config(format!("endpoint '{}': {}", endpoint.id, e))
            })?;
            transports.push(transport);
        }
        Self::from_transports(transports).await
    }

    /// Discover tools on already constructed transports, concurrently.
    pub async fn from_transports(
        transports: Vec<Arc<dyn ToolTransport>>,
    ) -> Result<Self, EngineError> {
        let start = Instant::now();
        let discovered = join_all(transports.iter().map(|t| t.list_tools())).await;

        let mut registry = Self::empty();
        let mut failed = Vec::new();

        for (transport, listing) in transports.into_iter().zip(discovered) {
            let specs = match listing {
                Ok(specs) => specs,
                Err(e) => {
                    error!(
                        endpoint = %transport.endpoint_id(),
                        error = %e,
                        "Tool discovery failed, endpoint skipped"
                    );
                    failed.push(transport);
                    continue;
                }
            };

            let index = registry.endpoints.len();
            for spec in specs {
                if let Some(existing) = registry.routes.get(&spec.name) {
                    let first = registry.endpoints[existing.endpoint]
                        .transport
                        .endpoint_id()
                        .to_string();
                    let err = EngineError::ToolNameCollision {
                        tool: spec.name.clone(),
                        first,
                        second: transport.endpoint_id().to_string(),
                    };
                    registry.shutdown().await;
                    transport.shutdown().await;
                    for t in &failed {
                        t.shutdown().await;
                    }
                    return Err(err);
                }
                debug!(tool = %spec.name, endpoint = %transport.endpoint_id(), "Registered tool");
                registry.order.push(spec.name.clone());
                registry.routes.insert(
                    spec.name.clone(),
                    Route {
                        spec,
                        endpoint: index,
                    },
                );
            }

            let gate = if transport.supports_concurrent_calls() {
                None
            } else {
                Some(Mutex::new(()))
            };
            registry.endpoints.push(Endpoint { transport, gate });
        }

        for t in &failed {
            t.shutdown().await;
        }

        info!(
            endpoints = registry.endpoints.len(),
            tools = registry.order.len(),
            skipped = failed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Tool registry initialized"
        );

        Ok(registry)
    }

    /// Execute one call on the endpoint that owns it.
    pub async fn dispatch(&self, call: &ToolCall) -> Dispatched {
        let start = Instant::now();

        let Some(route) = self.routes.get(&call.name) else {
            warn!(tool = %call.name, "Unknown tool requested");
            return Dispatched {
                call: call.clone(),
                result: EngineError::ToolNotFound(format!(
                    "{}. Available tools: {}",
                    call.name,
                    self.order.join(", ")
                ))
                .into(),
                elapsed: start.elapsed(),
                endpoint: None,
            };
        };

        let endpoint = &self.endpoints[route.endpoint];
        let endpoint_id = endpoint.transport.endpoint_id().to_string();

        let arguments = schema::coerce_arguments(&route.spec, call.arguments.clone());
        if let Err(reason) = schema::validate_arguments(&route.spec, &arguments) {
            warn!(tool = %call.name, reason = %reason, "Rejected tool arguments");
            return Dispatched {
                call: call.clone(),
                result: EngineError::InvalidArguments {
                    tool: call.name.clone(),
                    reason,
                }
                .into(),
                elapsed: start.elapsed(),
                endpoint: Some(endpoint_id),
            };
        }

        let _permit = match &endpoint.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let result = match endpoint.transport.call_tool(&call.name, arguments).await {
            Ok(result) => result,
            Err(e) => EngineError::from(e).into(),
        };
        let elapsed = start.elapsed();

        if result.success {
            info!(
                tool = %call.name,
                endpoint = %endpoint_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Tool call succeeded"
            );
        } else {
            warn!(
                tool = %call.name,
                endpoint = %endpoint_id,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %result.text(),
                "Tool call failed"
            );
        }

        Dispatched {
            call: call.clone(),
            result,
            elapsed,
            endpoint: Some(endpoint_id),
        }
    }

    /// Execute several calls concurrently; results keep input order.
    pub async fn dispatch_batch(&self, calls: &[ToolCall]) -> Vec<Dispatched> {
        join_all(calls.iter().map(|call| self.dispatch(call))).await
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Specs in discovery order
    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.routes.get(name))
            .map(|r| &r.spec)
            .collect()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Id of the endpoint that owns `name`
    pub fn endpoint_of(&self, name: &str) -> Option<&str> {
        self.routes
            .get(name)
            .map(|r| self.endpoints[r.endpoint].transport.endpoint_id())
    }

    /// Endpoint ids with their transport kinds
    pub fn endpoints(&self) -> Vec<(&str, transport::TransportKind)> {
        self.endpoints
            .iter()
            .map(|e| (e.transport.endpoint_id(), e.transport.kind()))
            .collect()
    }

    /// Tool catalogue for the decision prompt
    pub fn describe_tools(&self) -> String {
        if self.order.is_empty() {
            return "(no tools available)".to_string();
        }
        self.specs()
            .iter()
            .map(|spec| {
                let props = spec.property_names();
                let args = if props.is_empty() {
                    "no arguments".to_string()
                } else {
                    props.join(", ")
                };
                format!("- {}: {} (arguments: {})", spec.name, spec.description, args)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Stop every endpoint
    pub async fn shutdown(&self) {
        join_all(self.endpoints.iter().map(|e| e.transport.shutdown())).await;
    }
}
