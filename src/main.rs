use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use lab_relay::config::{build_fleet, default_config_path, load_config};
use lab_relay::output::sinks::FileSink;
use lab_relay::output::Sink;
use lab_relay::{FleetExit, FleetSupervisor};

#[derive(Parser)]
#[command(name = "labrelay")]
#[command(about = "Lab Relay - 采集实验室仪器数据并可靠地转发到输出链")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动所有仪器适配器，直到 Ctrl-C
    Run {
        /// 配置文件路径（默认 ~/.config/lab-relay/fleet.json）
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 只构建不启动，检查配置
    Check {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 取出文件输出端缓冲的全部消息，按 JSON 行输出
    Drain {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 控制日志级别，默认 info
    // 例如: RUST_LOG=lab_relay=debug labrelay run
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lab_relay=info,labrelay=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config.unwrap_or_else(default_config_path)).await,
        Commands::Check { config } => check(config.unwrap_or_else(default_config_path)).await,
        Commands::Drain { file } => drain(file),
    }
}

async fn run(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    info!(config = %path.display(), "Loaded config");

    // 阻塞 HTTP 客户端不能在异步上下文里创建或销毁，集群整个生命周期都放在阻塞线程上
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Weak<FleetSupervisor>>();
    let mut worker = tokio::task::spawn_blocking(move || -> Result<FleetExit> {
        let built = build_fleet(&config)?;
        let supervisor = Arc::new(built.supervisor);
        let _ = ready_tx.send(Arc::downgrade(&supervisor));
        Ok(supervisor.run())
    });
    let handle = ready_rx.await.ok();

    let exit = tokio::select! {
        result = &mut worker => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping fleet");
            if let Some(handle) = handle {
                tokio::task::spawn_blocking(move || {
                    if let Some(supervisor) = handle.upgrade() {
                        supervisor.stop();
                    }
                })
                .await?;
            }
            worker.await??
        }
    };

    match exit {
        FleetExit::Stopped => Ok(()),
        other => bail!("fleet stopped abnormally: {:?}", other),
    }
}

async fn check(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;

    let report = tokio::task::spawn_blocking(move || -> Result<String> {
        let built = build_fleet(&config)?;
        let ctx = built.supervisor.context();

        let mut lines = Vec::new();
        let chain: Vec<&str> = config.outputs.iter().map(|s| s.name.as_str()).collect();
        lines.push(format!("输出端 {} 个: {}", built.outputs.len(), chain.join(", ")));
        let head: Vec<String> = ctx.output.chain().iter().map(|n| n.name().to_string()).collect();
        lines.push(format!("主输出链: {}", head.join(" -> ")));
        lines.push(format!("仪器 {} 台:", built.supervisor.adapters().len()));
        for adapter in built.supervisor.adapters() {
            lines.push(format!("  {} | process: {}", adapter.name(), adapter.processes().len()));
        }
        Ok(lines.join("\n"))
    })
    .await??;

    println!("{}", report);
    println!("\n配置有效: {}", path.display());
    Ok(())
}

fn drain(file: PathBuf) -> Result<()> {
    let store = FileSink::new("drain", &file);
    let messages = store.pop_all();
    for message in &messages {
        println!("{}", serde_json::to_string(message)?);
    }
    info!(file = %file.display(), drained = messages.len(), "Outbox drained");
    Ok(())
}
