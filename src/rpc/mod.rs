//! JSON-RPC 2.0 transport over stdio.
//!
//! One request object per line on stdin, one response per line on stdout;
//! logging goes to stderr so the frame stream stays clean. Tool calls run
//! concurrently; a writer task serializes responses. Canonical method names
//! are snake_case, hyphenated forms are accepted as aliases.

use crate::pipeline::{
    CheckSyntaxArgs, ExecuteArgs, GatewayError, LearnArgs, PolicyArgs, RequestPipeline, StatsArgs,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Caller identity used for rate limiting and learning session tracking
/// when requests arrive over stdio.
const STDIO_CALLER_ID: &str = "stdio";

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Serialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    data: RpcErrorData,
}

#[derive(Debug, Serialize)]
struct RpcErrorData {
    kind: &'static str,
}

fn success(id: Value, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

fn failure(id: Value, code: i64, message: String, kind: &'static str) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcErrorBody {
            code,
            message,
            data: RpcErrorData { kind },
        }),
    }
}

fn gateway_error_response(id: Value, err: GatewayError) -> RpcResponse {
    let code = match &err {
        GatewayError::Unauthorized(_) => -32001,
        GatewayError::RateLimited { .. } => -32002,
        GatewayError::InvalidArgument(_) => -32602,
        GatewayError::Internal(_) => -32603,
    };
    failure(id, code, err.to_string(), err.kind())
}

fn parse_args<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, GatewayError> {
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|e| GatewayError::InvalidArgument(format!("invalid params: {e}")))
}

/// Resolve a wire method to its canonical tool name.
fn canonical_method(method: &str) -> String {
    method.trim().replace('-', "_")
}

async fn dispatch(
    pipeline: &RequestPipeline,
    method: &str,
    params: Value,
) -> Result<Value, GatewayError> {
    match canonical_method(method).as_str() {
        "execute_command" => {
            let args: ExecuteArgs = parse_args(params)?;
            let response = pipeline.execute_command(args, STDIO_CALLER_ID).await?;
            serde_json::to_value(response).map_err(to_internal)
        }
        "check_syntax" => {
            let args: CheckSyntaxArgs = parse_args(params)?;
            let report = pipeline.check_syntax(args, STDIO_CALLER_ID)?;
            serde_json::to_value(report).map_err(to_internal)
        }
        "working_directory_policy" => {
            let args: PolicyArgs = parse_args(params)?;
            let policy = pipeline.working_directory_policy(args, STDIO_CALLER_ID)?;
            serde_json::to_value(policy).map_err(to_internal)
        }
        "server_stats" => {
            let args: StatsArgs = parse_args(params)?;
            let stats = pipeline.server_stats(args, STDIO_CALLER_ID)?;
            serde_json::to_value(stats).map_err(to_internal)
        }
        "threat_analysis" => {
            let auth_key = params
                .get("authKey")
                .and_then(Value::as_str)
                .map(str::to_string);
            let summary = pipeline.threat_analysis(auth_key.as_deref(), STDIO_CALLER_ID)?;
            serde_json::to_value(summary).map_err(to_internal)
        }
        "learn" => {
            let args: LearnArgs = parse_args(params)?;
            let response = pipeline.learn(args, STDIO_CALLER_ID)?;
            serde_json::to_value(response).map_err(to_internal)
        }
        "capture_sample" => {
            let auth_key = params
                .get("authKey")
                .and_then(Value::as_str)
                .map(str::to_string);
            let sample = pipeline
                .capture_sample(auth_key.as_deref(), STDIO_CALLER_ID)
                .await?;
            serde_json::to_value(sample).map_err(to_internal)
        }
        other => Err(GatewayError::InvalidArgument(format!(
            "unknown method '{other}'"
        ))),
    }
}

fn to_internal(e: serde_json::Error) -> GatewayError {
    GatewayError::Internal(format!("response serialization failed: {e}"))
}

/// Read frames from stdin until EOF, dispatching each tool call on its own
/// task. Responses funnel through a single writer so lines never interleave.
pub async fn serve_stdio(pipeline: Arc<RequestPipeline>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    info!("JSON-RPC transport listening on stdio");
    while let Some(line) = lines.next_line().await.context("reading stdin frame")? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("unparseable frame: {e}");
                let response = failure(
                    Value::Null,
                    -32700,
                    format!("parse error: {e}"),
                    "invalid-argument",
                );
                if let Ok(json) = serde_json::to_string(&response) {
                    let _ = out_tx.send(json).await;
                }
                continue;
            }
        };

        let pipeline = pipeline.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            debug!(method = %request.method, "dispatching tool call");
            let outcome = dispatch(&pipeline, &request.method, request.params).await;

            // Requests without an id are notifications; their outcome is
            // dropped on the floor.
            let Some(id) = request.id else {
                return;
            };
            let response = match outcome {
                Ok(result) => success(id, result),
                Err(err) => gateway_error_response(id, err),
            };
            if let Ok(json) = serde_json::to_string(&response) {
                let _ = out_tx.send(json).await;
            }
        });
    }

    drop(out_tx);
    let _ = writer.await;
    info!("stdin closed; transport shutting down");
    Ok(())
}
