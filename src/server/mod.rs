//! Unix socket JSON-RPC server for the dashboard.
//!
//! Listens on a local socket for line-delimited JSON-RPC 2.0
//! requests. All communication is local-only — no TCP network
//! exposure — and every method is read-mostly, so there is no auth
//! layer: the socket file itself is owner-restricted.
//!
//! Methods:
//! - `usage.status`  → per-poller state plus latest recorded usage
//! - `usage.history` → cost history per provider ({days}, default 30)
//! - `usage.run`     → trigger one poller now ({provider})

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::{query, scheduler, AppContext};

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<serde_json::Value>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }
    fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self { jsonrpc: "2.0".into(), result: None, error: Some(JsonRpcError { code, message }), id }
    }
}

// ── Server ──────────────────────────────────────────────────────────

pub struct Server {
    socket_path: PathBuf,
    ctx: Arc<AppContext>,
}

impl Server {
    pub fn new(socket_path: PathBuf, ctx: Arc<AppContext>) -> Self {
        Self { socket_path, ctx }
    }

    pub async fn run(&self) -> Result<()> {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        // Ensure parent directory exists
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Restrict socket permissions (owner-only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(
            socket = %self.socket_path.display(),
            "💸 costwatch server listening"
        );

        loop {
            let (stream, _) = listener.accept().await?;
            let ctx = Arc::clone(&self.ctx);

            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                // Bound reads to 1 MB to prevent oversized payloads
                const MAX_REQUEST_BYTES: u64 = 1_048_576;
                let bounded = reader.take(MAX_REQUEST_BYTES);
                let mut reader = BufReader::new(bounded);
                let mut line = String::new();

                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break, // EOF
                        Ok(_) => {
                            let response = handle_request(&line, &ctx).await;
                            let resp_json = serde_json::to_string(&response).unwrap_or_default();
                            if writer.write_all(resp_json.as_bytes()).await.is_err() { break; }
                            if writer.write_all(b"\n").await.is_err() { break; }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    }
}

// ── Request Handling ────────────────────────────────────────────────

async fn handle_request(raw: &str, ctx: &AppContext) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => return JsonRpcResponse::error(None, -32700, format!("Parse error: {}", e)),
    };
    let params = req.params.unwrap_or(serde_json::Value::Null);

    match req.method.as_str() {
        "usage.status" => {
            let pollers = query::status(ctx);
            JsonRpcResponse::success(req.id, serde_json::json!({ "pollers": pollers }))
        }

        "usage.history" => {
            let days = params.get("days").and_then(serde_json::Value::as_u64).unwrap_or(30) as u32;
            let history = query::history(ctx, days);
            JsonRpcResponse::success(req.id, serde_json::json!({ "history": history }))
        }

        "usage.run" => {
            // An unknown provider is a well-formed not_found result,
            // never an RPC error.
            let provider = params
                .get("provider")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            let outcome = scheduler::run_provider(ctx, provider).await;
            match serde_json::to_value(&outcome) {
                Ok(value) => JsonRpcResponse::success(req.id, value),
                Err(e) => JsonRpcResponse::error(req.id, -32603, format!("Encode error: {}", e)),
            }
        }

        other => {
            warn!(method = other, "unknown method");
            JsonRpcResponse::error(req.id, -32601, format!("Method not found: {}", other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pollers::testing::{StubPoller, StubResult};
    use crate::pollers::PollerRegistry;
    use crate::store::UsageStore;

    fn context() -> (tempfile::TempDir, AppContext) {
        let dir = tempfile::tempdir().unwrap();
        let store = UsageStore::open(&dir.path().join("usage.db")).unwrap();
        let registry = PollerRegistry::from_pollers(vec![Box::new(StubPoller {
            name: "OpenAI",
            enabled: true,
            result: StubResult::Usage { cost_usd: 1.0, tokens: 10 },
        })]);
        (dir, AppContext { store, registry })
    }

    fn request(method: &str, params: serde_json::Value) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_status_method_shape() {
        let (_dir, ctx) = context();
        let resp = handle_request(&request("usage.status", serde_json::json!({})), &ctx).await;

        let result = resp.result.unwrap();
        let pollers = result["pollers"].as_array().unwrap();
        assert_eq!(pollers.len(), 1);
        assert_eq!(pollers[0]["provider"], "OpenAI");
        assert_eq!(pollers[0]["enabled"], true);
    }

    #[tokio::test]
    async fn test_history_method_defaults_days() {
        let (_dir, ctx) = context();
        let resp = handle_request(&request("usage.history", serde_json::json!({})), &ctx).await;

        let result = resp.result.unwrap();
        assert!(result["history"]["OpenAI"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_method_returns_outcome() {
        let (_dir, ctx) = context();
        let resp = handle_request(
            &request("usage.run", serde_json::json!({"provider": "openai"})),
            &ctx,
        )
        .await;

        let result = resp.result.unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(result["data"]["cost_usd"], 1.0);
    }

    #[tokio::test]
    async fn test_run_method_unknown_provider_is_not_found_result() {
        let (_dir, ctx) = context();
        let resp = handle_request(
            &request("usage.run", serde_json::json!({"provider": "nonexistent"})),
            &ctx,
        )
        .await;

        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["status"], "not_found");
    }

    #[tokio::test]
    async fn test_unknown_method_is_rpc_error() {
        let (_dir, ctx) = context();
        let resp = handle_request(&request("usage.nope", serde_json::json!({})), &ctx).await;

        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_malformed_request_is_parse_error() {
        let (_dir, ctx) = context();
        let resp = handle_request("this is not json\n", &ctx).await;

        assert_eq!(resp.error.unwrap().code, -32700);
    }
}
