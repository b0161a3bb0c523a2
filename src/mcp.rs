// ABOUTME: MCP (Model Context Protocol) server exposing the engine as send/wait/list tools
// ABOUTME: Serves JSON-RPC over newline-delimited stdio or an axum HTTP endpoint

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Engine, Error, RoomSummary};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// MCP server state shared with handlers
#[derive(Clone)]
pub struct McpState {
    pub engine: Arc<Engine>,
}

impl McpState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// JSON-RPC request structure
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response structure
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            // errors always carry an id, null when the request had none
            id: Some(id.unwrap_or(Value::Null)),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }
}

/// Tool definition for MCP
#[derive(Debug, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Get list of available tools
fn get_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "send_message".to_string(),
            description: "Send a message to a Matrix room".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "room_id": {
                        "type": "string",
                        "description": "Room ID or alias (e.g., #room:server.com)"
                    },
                    "message": {
                        "type": "string",
                        "description": "Message text to send"
                    },
                    "join_if_needed": {
                        "type": "boolean",
                        "default": true,
                        "description": "Auto-join room if not already joined"
                    }
                },
                "required": ["message"]
            }),
        },
        ToolDefinition {
            name: "wait_for_response".to_string(),
            description: "Send message and wait for human response in specified room".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "room_id": {
                        "type": "string",
                        "description": "Room ID or alias"
                    },
                    "message": {
                        "type": "string",
                        "description": "Message to send before waiting"
                    },
                    "timeout_seconds": {
                        "type": "number",
                        "default": 300,
                        "description": "Max wait time (default: 5 min)"
                    },
                    "response_from": {
                        "type": "string",
                        "description": "Optional: specific user ID to wait for"
                    }
                },
                "required": ["message"]
            }),
        },
        ToolDefinition {
            name: "list_rooms".to_string(),
            description: "List joined Matrix rooms with names and aliases".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

/// Dispatch one JSON-RPC message. Notifications (no id) produce no response.
pub async fn handle_request(state: &McpState, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    tracing::debug!(method = %request.method, "MCP request received");

    if request.jsonrpc != "2.0" {
        tracing::warn!(version = %request.jsonrpc, "Unexpected JSON-RPC version");
    }

    let response = match request.method.as_str() {
        "initialize" => handle_initialize(&request),
        "notifications/initialized" => {
            tracing::info!("MCP initialized notification received");
            return None;
        }
        "ping" => JsonRpcResponse::result(request.id.clone(), json!({})),
        "tools/list" => JsonRpcResponse::result(request.id.clone(), json!({"tools": get_tools()})),
        "tools/call" => handle_tools_call(state, &request).await,
        method if method.starts_with("notifications/") => {
            tracing::debug!(method = %method, "Ignoring MCP notification");
            return None;
        }
        _ => JsonRpcResponse::error(
            request.id.clone(),
            -32601,
            format!("Method not found: {}", request.method),
        ),
    };

    request.id.is_some().then_some(response)
}

/// Handle one raw line from a transport, including parse failures
pub async fn handle_message(state: &McpState, line: &str) -> Option<JsonRpcResponse> {
    match serde_json::from_str::<JsonRpcRequest>(line) {
        Ok(request) => handle_request(state, request).await,
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable MCP message");
            Some(JsonRpcResponse::error(None, -32700, format!("Parse error: {}", e)))
        }
    }
}

/// Handle MCP initialize request
fn handle_initialize(request: &JsonRpcRequest) -> JsonRpcResponse {
    tracing::info!("MCP initialize request received");
    JsonRpcResponse::result(
        request.id.clone(),
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": "tether",
                "version": env!("CARGO_PKG_VERSION")
            }
        }),
    )
}

/// Outcome of a tool: text plus whether it reports a failure
struct ToolOutput {
    text: String,
    is_error: bool,
}

impl ToolOutput {
    fn ok(text: String) -> Self {
        Self {
            text,
            is_error: false,
        }
    }

    fn failed(text: String) -> Self {
        Self {
            text,
            is_error: true,
        }
    }
}

/// Handle tools/call request
async fn handle_tools_call(state: &McpState, request: &JsonRpcRequest) -> JsonRpcResponse {
    let params = &request.params;

    let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");

    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    tracing::info!(tool = %tool_name, "MCP tool call");

    let output = match tool_name {
        "send_message" => handle_send_message(state, &arguments).await,
        "wait_for_response" => handle_wait_for_response(state, &arguments).await,
        "list_rooms" => Ok(ToolOutput::ok(format_room_list(&state.engine.list_rooms()))),
        _ => Err(format!("Unknown tool: {}", tool_name)),
    };
    let output = output.unwrap_or_else(|error| {
        tracing::warn!(tool = %tool_name, error = %error, "MCP tool call failed");
        ToolOutput::failed(error)
    });

    let mut result = json!({
        "content": [{
            "type": "text",
            "text": output.text
        }]
    });
    if output.is_error {
        result["isError"] = json!(true);
    }
    JsonRpcResponse::result(request.id.clone(), result)
}

/// Room named by `room_id` (or `room`), falling back to the configured default
fn room_arg<'a>(state: &'a McpState, args: &'a Value) -> Result<&'a str, String> {
    args.get("room_id")
        .or_else(|| args.get("room"))
        .and_then(|v| v.as_str())
        .filter(|room| !room.trim().is_empty())
        .or_else(|| state.engine.default_room())
        .ok_or_else(|| {
            "Missing required parameter: room_id (no default room configured)".to_string()
        })
}

fn message_arg(args: &Value) -> Result<&str, String> {
    args.get("message")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "Missing required parameter: message".to_string())
}

fn tool_error(error: &Error) -> String {
    format!("Error: {}", error)
}

/// Handle send_message tool call
async fn handle_send_message(state: &McpState, args: &Value) -> Result<ToolOutput, String> {
    let room = room_arg(state, args)?;
    let message = message_arg(args)?;
    let join_if_needed = match args.get("join_if_needed") {
        None | Some(Value::Null) => true,
        Some(v) => v
            .as_bool()
            .ok_or("Invalid parameter: join_if_needed must be a boolean")?,
    };

    state
        .engine
        .send_message(room, message, join_if_needed)
        .await
        .map_err(|e| tool_error(&e))?;

    Ok(ToolOutput::ok(format!("Message sent to {}: {}", room, message)))
}

/// Handle wait_for_response tool call
async fn handle_wait_for_response(state: &McpState, args: &Value) -> Result<ToolOutput, String> {
    let room = room_arg(state, args)?;
    let message = message_arg(args)?;
    let timeout_secs = match args.get("timeout_seconds") {
        None | Some(Value::Null) => state.engine.default_timeout().as_secs_f64(),
        Some(v) => v
            .as_f64()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .ok_or("Invalid parameter: timeout_seconds must be a positive number")?,
    };
    let timeout = Duration::try_from_secs_f64(timeout_secs)
        .map_err(|_| format!("Invalid parameter: timeout_seconds {} is too large", timeout_secs))?;
    let response_from = args.get("response_from").and_then(|v| v.as_str());

    let outcome = state
        .engine
        .wait_for_response(
            room,
            message,
            timeout,
            response_from,
        )
        .await;

    match outcome {
        Ok(reply) => Ok(ToolOutput::ok(format!(
            "Received response from {}: {}",
            reply.sender, reply.body
        ))),
        // a timeout is an answer, not a tool failure
        Err(Error::Timeout(_)) => Ok(ToolOutput::ok(format!(
            "Timeout: No response received within {} seconds",
            timeout_secs
        ))),
        Err(e) => Err(tool_error(&e)),
    }
}

/// `Joined rooms (n):` followed by one `room_id (name | alias)` line per room
pub fn format_room_list(rooms: &[RoomSummary]) -> String {
    let lines: Vec<String> = rooms
        .iter()
        .map(|room| {
            let parts: Vec<&str> = room
                .display_name
                .as_deref()
                .into_iter()
                .chain(room.canonical_alias.as_ref().map(|a| a.as_str()))
                .collect();
            if parts.is_empty() {
                room.room_id.to_string()
            } else {
                format!("{} ({})", room.room_id, parts.join(" | "))
            }
        })
        .collect();
    format!("Joined rooms ({}):\n{}", lines.len(), lines.join("\n"))
}

// ─── transports ────────────────────────────────────────────────────

/// Handle MCP JSON-RPC requests over HTTP
pub async fn mcp_handler(
    State(state): State<Arc<McpState>>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    match handle_request(&state, request).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

pub fn router(state: Arc<McpState>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .with_state(state)
}

/// Serve `POST /mcp` on `addr` until `shutdown` fires
pub async fn serve_http(
    state: Arc<McpState>,
    addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "MCP HTTP endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Serve newline-delimited JSON-RPC on a reader/writer pair.
///
/// Each request runs in its own task so a long wait never blocks other
/// calls; responses go through a single writer task. On end of input the
/// requests still in flight are answered unless `shutdown` fires first.
pub async fn serve_stdio<R, W>(
    state: Arc<McpState>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = rx.recv().await {
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = reader.lines();
    let mut in_flight = JoinSet::new();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.cancelled() => break,
        };
        let Some(line) = line else {
            tracing::info!("MCP input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let state = Arc::clone(&state);
        let tx = tx.clone();
        in_flight.spawn(async move {
            let Some(response) = handle_message(&state, &line).await else {
                return;
            };
            match serde_json::to_string(&response) {
                Ok(frame) => {
                    let _ = tx.send(frame);
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode MCP response"),
            }
        });

        // reap finished tasks as we go
        while in_flight.try_join_next().is_some() {}
    }

    let drained = tokio::select! {
        _ = async { while in_flight.join_next().await.is_some() {} } => true,
        _ = shutdown.cancelled() => false,
    };
    if !drained {
        in_flight.abort_all();
    }
    drop(tx);

    writer_task.await??;
    Ok(())
}
