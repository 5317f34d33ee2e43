//! 命令行单次提问
//!
//! 用法: keylime-agent-ask [--yes] "list all failed agents"
//! 与 Web 服务共用编排器；工具请求在终端确认（--yes 自动批准）。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use keylime_agent::config::{load_config, load_dotenv};
use keylime_agent::core::OrchestratorHandle;
use keylime_agent::events::OrchestrationEvent;
use keylime_agent::{observability, start_agent};

#[derive(Parser, Debug)]
#[command(name = "keylime-agent-ask", version, about = "Ask the Keylime agent a single question")]
struct Cli {
    /// 问题
    #[arg(required = true)]
    query: Vec<String>,

    /// 自动批准所有工具请求
    #[arg(short, long)]
    yes: bool,

    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    load_dotenv();
    let cfg = load_config(cli.config).context("Failed to load config")?;
    observability::init(&cfg.log.level);

    let runtime = start_agent(&cfg).await.context("Failed to start agent")?;
    let handle = runtime.handle.clone();
    let result = run(&handle, &cli.query.join(" "), cli.yes).await;

    handle.shutdown();
    if let Err(e) = runtime.transport.close().await {
        tracing::warn!("Failed to stop tool server: {}", e);
    }
    result
}

async fn run(handle: &OrchestratorHandle, query: &str, auto_approve: bool) -> anyhow::Result<()> {
    let mut events = handle.subscribe();
    let mut status = handle.status_receiver();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let before = status.borrow_and_update().completed;

    handle.submit(query)?;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("event stream closed");
                };
                handle_event(handle, &event, auto_approve, &mut stdin).await?;
            }
            changed = status.changed() => {
                changed.context("orchestrator stopped")?;
            }
        }

        if status.borrow().completed > before {
            while let Some(rest) = events.try_recv() {
                handle_event(handle, &rest, auto_approve, &mut stdin).await?;
            }
            break;
        }
    }
    Ok(())
}

async fn handle_event(
    handle: &OrchestratorHandle,
    event: &OrchestrationEvent,
    auto_approve: bool,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> anyhow::Result<()> {
    match event {
        OrchestrationEvent::Keepalive { .. } | OrchestrationEvent::UserMessage { .. } => {}
        OrchestrationEvent::ToolRequest { request } => {
            println!("\n[tool] {}\n{}", request.name, request.arguments_pretty());
            let approve = if auto_approve {
                true
            } else {
                println!("Approve? [y/N]");
                let answer = stdin.next_line().await?.unwrap_or_default();
                matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
            };
            let decision = if approve { handle.approve() } else { handle.deny() };
            if let Err(e) = decision {
                if !e.is_benign() {
                    return Err(e.into());
                }
            }
        }
        other => println!("{}", other.render()),
    }
    Ok(())
}
