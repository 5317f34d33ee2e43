//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `KEYLIME_AGENT__*` 覆盖（双下划线表示嵌套，如 `KEYLIME_AGENT__AGENT__MAX_TURNS=8`）。
//! 兼容旧部署的环境变量：`ANTHROPIC_API_KEY`、`MCP_SERVER_PATH`、`PORT`。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 默认系统提示词（Keylime 运维助手）
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an AI assistant with access to Keylime system management tools. Your goal is to help users manage and monitor their Keylime infrastructure.

You have a maximum of 5 conversation turns to complete the task. When given a task:
1. Break it down into steps if needed
2. Use available tools to gather information and take actions
3. Chain multiple tool calls together to accomplish complex tasks
4. Provide clear explanations of what you're doing and what you found
5. If you encounter failures, investigate and suggest solutions
6. Work efficiently to complete tasks within the turn limit";

/// 轮数耗尽时追加的总结提示
pub const DEFAULT_SUMMARY_PROMPT: &str = "I've reached the maximum number of allowed turns. Please provide a summary of:
1. What you accomplished so far
2. What still needs to be done
3. Any issues or blockers encountered";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub log: LogSection,
}

/// [server] 段：监听地址、SSE 心跳、事件缓冲
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    /// SSE 空闲多久注入一次 keepalive（秒）
    pub keepalive_secs: u64,
    /// 每个订阅者的事件缓冲条数，满了就丢弃
    pub event_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            keepalive_secs: 30,
            event_buffer: 100,
        }
    }
}

/// [llm] 段：模型与 Messages API 端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub max_tokens: u32,
    pub base_url: String,
    /// 未设置时读取 ANTHROPIC_API_KEY；两者都没有则退回 Mock
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "claude-3-5-haiku-latest".to_string(),
            max_tokens: 2048,
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key: None,
            request_timeout_secs: 60,
        }
    }
}

/// [agent] 段：轮数上限、提示词、审批超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_turns: usize,
    pub system_prompt: Option<String>,
    pub summary_prompt: Option<String>,
    /// 审批等待上限（秒）；不设置则无限等待
    pub approval_timeout_secs: Option<u64>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_turns: 5,
            system_prompt: None,
            summary_prompt: None,
            approval_timeout_secs: None,
        }
    }
}

impl AgentSection {
    pub fn system_prompt(&self) -> String {
        self.system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    pub fn summary_prompt(&self) -> String {
        self.summary_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SUMMARY_PROMPT.to_string())
    }

    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_secs.map(Duration::from_secs)
    }
}

/// [tools] 段：MCP 工具服务进程与单次调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub server_path: PathBuf,
    pub server_args: Vec<String>,
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            server_path: PathBuf::from("./server"),
            server_args: Vec::new(),
            tool_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 读取 .env（当前目录与上级目录），找不到不算错误
pub fn load_dotenv() {
    for path in [".env", "../.env"] {
        if dotenvy::from_filename(path).is_ok() {
            tracing::debug!(path, "loaded .env");
            return;
        }
    }
}

/// 从 config 目录加载配置，环境变量 KEYLIME_AGENT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 KEYLIME_AGENT__*（双下划线表示嵌套键）
/// 4. 最后应用旧变量 ANTHROPIC_API_KEY / MCP_SERVER_PATH / PORT
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignored");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("KEYLIME_AGENT")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    apply_legacy_env(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// 旧版部署直接用 ANTHROPIC_API_KEY / MCP_SERVER_PATH / PORT，这里映射到新配置
fn apply_legacy_env(cfg: &mut AppConfig, var: impl Fn(&str) -> Option<String>) {
    if cfg.llm.api_key.is_none() {
        cfg.llm.api_key = var("ANTHROPIC_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
    }
    if let Some(path) = var("MCP_SERVER_PATH").filter(|p| !p.is_empty()) {
        cfg.tools.server_path = PathBuf::from(path);
    }
    if let Some(port) = var("PORT").filter(|p| !p.is_empty()) {
        let host = cfg
            .server
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        cfg.server.bind_addr = format!("{}:{}", host, port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_turns, 5);
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:3000");
        assert_eq!(cfg.server.keepalive_secs, 30);
        assert_eq!(cfg.llm.max_tokens, 2048);
        assert!(cfg.agent.approval_timeout().is_none());
        assert!(cfg.agent.system_prompt().contains("Keylime"));
    }

    #[test]
    fn test_load_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_turns = 3\napproval_timeout_secs = 120\n\n[tools]\nserver_path = \"/opt/keylime/server\"\n"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_turns, 3);
        assert_eq!(cfg.agent.approval_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(cfg.tools.server_path, PathBuf::from("/opt/keylime/server"));
        // 未出现的段保持默认
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
    }

    #[test]
    fn test_legacy_env_mapping() {
        let vars: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "  sk-test  "),
            ("MCP_SERVER_PATH", "../bin/server"),
            ("PORT", "8088"),
        ]
        .into_iter()
        .collect();
        let mut cfg = AppConfig::default();
        apply_legacy_env(&mut cfg, |k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.tools.server_path, PathBuf::from("../bin/server"));
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:8088");
    }

    #[test]
    fn test_legacy_env_keeps_configured_key() {
        let mut cfg = AppConfig::default();
        cfg.llm.api_key = Some("from-file".to_string());
        apply_legacy_env(&mut cfg, |k| (k == "ANTHROPIC_API_KEY").then(|| "from-env".to_string()));
        assert_eq!(cfg.llm.api_key.as_deref(), Some("from-file"));
    }
}
