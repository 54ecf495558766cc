//! Wire protocol to the CLI front-end.
//!
//! Newline-delimited JSON over a Unix domain socket: `{id, method, params}`
//! requests answered with `{id, result}` or `{id, error: {code, message}}`.
//! This module owns the protocol types and the method dispatch for the core
//! surface; request authentication and daemon supervision live above.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use uuid::Uuid;

use crate::error::{SubstratError, SubstratResult};
use crate::orchestrator::Orchestrator;

pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const NOT_FOUND: i32 = -32001;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Route one request to the orchestrator.
pub async fn dispatch(orch: &Orchestrator, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    match handle(orch, &request).await {
        Ok(result) => RpcResponse::success(id, result),
        Err(DispatchError::UnknownMethod) => RpcResponse::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("unknown method: {}", request.method),
        ),
        Err(DispatchError::BadParams(msg)) => {
            RpcResponse::failure(id, error_codes::INVALID_PARAMS, msg)
        }
        Err(DispatchError::Core(SubstratError::NotFound(what))) => {
            RpcResponse::failure(id, error_codes::NOT_FOUND, format!("not found: {what}"))
        }
        Err(DispatchError::Core(e)) => {
            RpcResponse::failure(id, error_codes::INTERNAL_ERROR, e.to_string())
        }
    }
}

enum DispatchError {
    UnknownMethod,
    BadParams(String),
    Core(SubstratError),
}

impl From<SubstratError> for DispatchError {
    fn from(e: SubstratError) -> Self {
        DispatchError::Core(e)
    }
}

async fn handle(orch: &Orchestrator, request: &RpcRequest) -> Result<Value, DispatchError> {
    let params = &request.params;
    match request.method.as_str() {
        "agent.create" => {
            let name = require_str(params, "name")?;
            let instructions = params
                .get("instructions")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let provider = params.get("provider").and_then(Value::as_str);
            let model = params.get("model").and_then(Value::as_str);
            let node = orch
                .create_root_agent(name, instructions, provider, model)
                .await?;
            Ok(json!({
                "agent_id": node.id.simple().to_string(),
                "session_id": node.session_id.simple().to_string(),
                "name": node.name,
            }))
        }
        "agent.spawn" => {
            let parent_id = require_uuid(params, "parent_id")?;
            let name = require_str(params, "name")?;
            let instructions = params
                .get("instructions")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let role = params
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("worker");
            let workspace_subdir = params.get("workspace_subdir").and_then(Value::as_str);
            let handler = orch.handler(parent_id)?;
            Ok(handler
                .spawn_agent(name, instructions, role, workspace_subdir)
                .await?)
        }
        "agent.terminate" => {
            let agent_id = require_uuid(params, "agent_id")?;
            orch.terminate_agent(agent_id).await?;
            Ok(json!({"status": "terminated"}))
        }
        "agent.send" => {
            let agent_id = require_uuid(params, "agent_id")?;
            let prompt = require_str(params, "prompt")?;
            let response = orch.run_turn(agent_id, prompt).await?;
            Ok(json!({"response": response}))
        }
        "session.list" => {
            let sessions = orch.scheduler().list_sessions().await;
            let listed: Vec<Value> = sessions
                .iter()
                .map(|s| {
                    json!({
                        "id": s.id.simple().to_string(),
                        "state": s.state.to_string(),
                        "provider_name": s.provider_name,
                        "model": s.model,
                    })
                })
                .collect();
            Ok(json!({"sessions": listed}))
        }
        "session.suspend" => {
            let session_id = require_uuid(params, "session_id")?;
            orch.scheduler().suspend_session(session_id).await?;
            Ok(json!({"status": "suspended"}))
        }
        "session.resume" => {
            let session_id = require_uuid(params, "session_id")?;
            orch.scheduler().resume_session(session_id).await?;
            Ok(json!({"status": "resumed"}))
        }
        "session.delete" => {
            let session_id = require_uuid(params, "session_id")?;
            orch.scheduler().delete_session(session_id).await?;
            Ok(json!({"status": "deleted"}))
        }
        _ => Err(DispatchError::UnknownMethod),
    }
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, DispatchError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::BadParams(format!("missing string param: {key}")))
}

fn require_uuid(params: &Value, key: &str) -> Result<Uuid, DispatchError> {
    let raw = require_str(params, key)?;
    Uuid::parse_str(raw)
        .map_err(|_| DispatchError::BadParams(format!("invalid uuid in param: {key}")))
}

/// Accept loop for the daemon socket. One task per connection; each line is
/// a request, answered in order on the same stream.
pub async fn serve_unix(listener: UnixListener, orch: Orchestrator) -> SubstratResult<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let orch = orch.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, orch).await {
                tracing::warn!(error = %err, "rpc connection error");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, orch: Orchestrator) -> SubstratResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => dispatch(&orch, request).await,
            Err(e) => RpcResponse::failure(Value::Null, error_codes::PARSE_ERROR, e.to_string()),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }
    Ok(())
}
