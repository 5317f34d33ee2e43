//! MCP stdio 传输
//!
//! 启动工具服务子进程，在其 stdin/stdout 上按行收发 JSON-RPC 2.0（NDJSON）。
//! 连接建立时完成 initialize 握手；请求串行发送，读取时跳过通知与 id 不匹配的行。
//! 子进程 stderr 转发到 tracing。
//!
//! 调用方的超时可能在写请求的中途取消 future，stdin 上会残留半行；检测到这种情况后连接标记为关闭。

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::tools::{CallToolResult, ToolDescriptor, ToolTransport, TransportError};

const PROTOCOL_VERSION: &str = "2024-11-05";

struct Connection {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    closed: bool,
    /// 写入开始后置位、flush 完成后清除；下次写入时仍为 true 说明上次写入被中途取消
    writing: bool,
}

pub struct McpStdioTransport {
    conn: Mutex<Connection>,
    next_id: AtomicI64,
    server_name: String,
}

impl McpStdioTransport {
    /// 启动子进程并完成握手；program 含路径分隔符时先检查文件存在
    pub async fn spawn(program: impl AsRef<Path>, args: &[String]) -> Result<Self, TransportError> {
        let program = program.as_ref();
        if program.components().count() > 1 && !program.exists() {
            return Err(TransportError::Spawn(format!(
                "tool server not found at {}",
                program.display()
            )));
        }

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {}", program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to get stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("failed to get stdout handle".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "tool_server", "{}", line);
                }
            });
        }

        let mut transport = Self {
            conn: Mutex::new(Connection {
                child,
                stdin,
                stdout: BufReader::new(stdout),
                closed: false,
                writing: false,
            }),
            next_id: AtomicI64::new(1),
            server_name: String::new(),
        };

        let init = transport
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "keylime-agent", "version": env!("CARGO_PKG_VERSION")}
                }),
            )
            .await?;
        transport.server_name = init["serverInfo"]["name"].as_str().unwrap_or("unknown").to_string();
        transport.notify("notifications/initialized", json!({})).await?;
        tracing::info!(
            server = %transport.server_name,
            protocol = init["protocolVersion"].as_str().unwrap_or(""),
            "tool server connected"
        );
        Ok(transport)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let mut conn = self.conn.lock().await;
        let msg = json!({"jsonrpc": "2.0", "method": method, "params": params});
        write_line(&mut conn, &msg).await
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn.lock().await;
        let msg = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        write_line(&mut conn, &msg).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = conn.stdout.read_line(&mut line).await?;
            if n == 0 {
                conn.closed = true;
                return Err(TransportError::Closed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unparsable line from tool server");
                    continue;
                }
            };
            match value.get("id").and_then(Value::as_i64) {
                Some(got) if got == id => {}
                Some(got) => {
                    tracing::debug!(expected = id, got, "skipping response with stale id");
                    continue;
                }
                None => {
                    tracing::debug!(method = value["method"].as_str().unwrap_or(""), "skipping notification");
                    continue;
                }
            }
            if let Some(err) = value.get("error") {
                return Err(TransportError::Rpc {
                    code: err["code"].as_i64().unwrap_or(0),
                    message: err["message"].as_str().unwrap_or("").to_string(),
                });
            }
            return value
                .get("result")
                .cloned()
                .ok_or_else(|| TransportError::Protocol(format!("response {} has neither result nor error", id)));
        }
    }
}

async fn write_line(conn: &mut Connection, msg: &Value) -> Result<(), TransportError> {
    if conn.closed {
        return Err(TransportError::Closed);
    }
    if conn.writing {
        tracing::warn!("previous request was cancelled mid-write, tool server stream is unusable");
        conn.closed = true;
        return Err(TransportError::Closed);
    }
    let mut buf = serde_json::to_vec(msg).map_err(|e| TransportError::Protocol(e.to_string()))?;
    buf.push(b'\n');
    conn.writing = true;
    let written = match conn.stdin.write_all(&buf).await {
        Ok(()) => conn.stdin.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        conn.closed = true;
        return Err(e.into());
    }
    conn.writing = false;
    Ok(())
}

#[async_trait]
impl ToolTransport for McpStdioTransport {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({"cursor": c}),
                None => json!({}),
            };
            let result = self.request("tools/list", params).await?;
            let items = result["tools"]
                .as_array()
                .ok_or_else(|| TransportError::Protocol("tools/list result without 'tools'".to_string()))?;
            for item in items {
                match serde_json::from_value::<ToolDescriptor>(item.clone()) {
                    Ok(d) => tools.push(d),
                    Err(e) => tracing::warn!(error = %e, tool = %item, "skipping malformed tool descriptor"),
                }
            }
            match result["nextCursor"].as_str() {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, TransportError> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        serde_json::from_value(result).map_err(|e| TransportError::Protocol(format!("invalid tools/call result: {}", e)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut conn = self.conn.lock().await;
        if conn.closed {
            return Ok(());
        }
        conn.closed = true;
        if let Err(e) = conn.child.kill().await {
            tracing::warn!(error = %e, "failed to stop tool server");
        }
        tracing::info!(server = %self.server_name, "tool server stopped");
        Ok(())
    }
}
