//! Keylime Agent Web 服务
//!
//! 启动: cargo run
//! 浏览器访问 http://127.0.0.1:3000

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use keylime_agent::config::{load_config, load_dotenv};
use keylime_agent::core::{OrchestratorCleanup, ShutdownCoordinator, ShutdownManager, ToolServerCleanup};
use keylime_agent::{observability, start_agent, web};

/// Keylime 管理智能体：工具调用需在浏览器中人工批准
#[derive(Parser, Debug)]
#[command(name = "keylime-agent", version, about)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 监听地址，覆盖配置中的 server.bind_addr
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    load_dotenv();

    let mut cfg = load_config(cli.config).context("Failed to load config")?;
    if let Some(bind) = cli.bind {
        cfg.server.bind_addr = bind;
    }
    observability::init(&cfg.log.level);

    let runtime = start_agent(&cfg).await.with_context(|| {
        format!(
            "Failed to start agent (tool server: {})",
            cfg.tools.server_path.display()
        )
    })?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(OrchestratorCleanup::new(runtime.handle.clone()));
    coordinator.register(ToolServerCleanup::new(runtime.transport.clone()));

    let app = web::router(runtime.handle.clone(), shutdown.token());
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind_addr))?;
    tracing::info!("Keylime Agent: http://{}", cfg.server.bind_addr);

    let manager = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { manager.wait_for_shutdown().await })
        .await;

    coordinator.run_cleanup().await;
    let (input, output) = runtime.model.token_usage();
    tracing::info!(
        input_tokens = input,
        output_tokens = output,
        dropped_events = runtime.handle.bus().dropped(),
        "session totals"
    );
    served.context("Server error")?;
    Ok(())
}
